//! Executor implementations, each one layer of a stack.

mod caching;
mod composing;
mod eager;
mod federating;
pub(crate) mod placed;
mod reference_resolving;
mod remote;
mod thread_delegating;
mod transforming;

pub use caching::CachingExecutor;
pub use composing::ComposingExecutor;
pub use eager::{EagerExecutor, KernelEvaluator, PayloadEvaluator};
pub use federating::FederatingExecutor;
pub use reference_resolving::ReferenceResolvingExecutor;
pub use remote::RemoteExecutor;
pub use thread_delegating::ThreadDelegatingExecutor;
pub use transforming::TransformingExecutor;
