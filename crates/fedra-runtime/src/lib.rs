//! Composable executors for fedra computations.
//!
//! An executor stack is a tree of [`Executor`]s, each adding one concern:
//!
//! - **Eager**: concrete values and compiled kernels, in process
//! - **Reference resolving**: blocks, lambdas and references
//! - **Federating**: placement and the federated intrinsics
//! - **Composing**: hierarchies of federations over shards of clients
//! - **Caching**: single-flight memoization of `create_value`
//! - **Thread delegating**: a child pinned to its own thread
//! - **Remote**: an executor service in another process
//! - **Transforming**: the rewrite pipeline from [`fedra_compile`]
//!
//! [`ExecutorFactory`] assembles stacks from a [`RuntimeConfig`], and
//! [`ExecutorServer`] exposes one over tarpc.
//!
//! # Example
//!
//! ```no_run
//! use fedra_core::{intrinsics, CardinalityMap, Expr, Type, Value};
//! use fedra_runtime::{ExecutionContext, ExecutorFactory, RuntimeConfig};
//!
//! # async fn run() -> fedra_runtime::Result<()> {
//! let factory = ExecutorFactory::from_config(RuntimeConfig::default());
//! let ctx = ExecutionContext::from_factory(&factory, &CardinalityMap::server_and_clients(3)).await?;
//! let data = Expr::data(
//!     Value::Federated(vec![Value::int32(2), Value::int32(5), Value::int32(7)]),
//!     Type::at_clients(Type::int32()),
//! )?;
//! let total = ctx.invoke(&intrinsics::federated_sum(data)?, None).await?;
//! assert_eq!(total, Value::Federated(vec![Value::int32(14)]));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod executors;
pub mod factory;
pub mod retry;
pub mod service;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::RuntimeConfig;
pub use context::ExecutionContext;
pub use error::{ErrorKind, ExecutorError, Result, ServiceError};
pub use executor::{
    Executor, ExecutorId, ExecutorValue, Fingerprint, Payload, SharedExecutor, ValueRef,
};
pub use factory::{ExecutorFactory, StackPlan, Topology, WorkerEndpoint};
pub use retry::RetryPolicy;
pub use service::{ExecutorServer, ExecutorService, ExecutorServiceClient};
