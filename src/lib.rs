//! fedra: federated computation runtime.
//!
//! Facade over the workspace crates:
//!
//! - [`fedra_core`]: types, values, IR, intrinsics and wire encodings
//! - [`fedra_compile`]: rewrite passes and the pass manager
//! - [`fedra_runtime`]: executors, the factory and the executor service

pub use fedra_compile;
pub use fedra_core;
pub use fedra_runtime;

pub use fedra_core::{intrinsics, CardinalityMap, Expr, Placement, Type, Value};
pub use fedra_runtime::{ExecutionContext, ExecutorFactory, RuntimeConfig};
