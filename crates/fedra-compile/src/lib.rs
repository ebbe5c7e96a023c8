//! Rewrite passes for fedra IR.
//!
//! Builds on [`fedra_core`] to normalize computations before execution:
//!
//! - **Name uniquification**: every binder gets a distinct name
//! - **Inlining**: lambda calls, duplicable block locals, selections from structs
//! - **Block flattening**: nested blocks merge into their parent
//! - **Argument extraction**: intrinsics are called on references only
//! - **Common subexpression elimination**: duplicate block locals merge
//! - **Dead local elimination**
//!
//! # Example
//!
//! ```
//! use fedra_compile::PassManager;
//! use fedra_core::{Expr, Type, Value};
//!
//! let y = Expr::reference("y", Type::int32()).unwrap();
//! let three = Expr::literal(Value::int32(3)).unwrap();
//! let e = Expr::block(
//!     vec![("y", three.clone())],
//!     Expr::selection(Expr::tuple(vec![y.clone(), y]).unwrap(), 1usize).unwrap(),
//! )
//! .unwrap();
//! assert_eq!(PassManager::default_pipeline().run(&e).unwrap(), three);
//! ```

mod check;
mod error;
mod manager;
mod passes;
mod traverse;

pub use check::{check_in_scope, check_well_formed};
pub use error::{CompileError, Result};
pub use manager::{PassManager, DEFAULT_MAX_SWEEPS};
pub use passes::{
    default_passes, pass_by_name, ExtractIntrinsicArguments, FlattenBlocks, InlineBlockLocals,
    InlineLambdaCalls, InlineSelectionsFromStructs, MergeDuplicateLocals, Pass,
    RemoveUnusedLocals, UniquifyNames,
};
pub use traverse::{all_names, binders, transform, Order, Rewrite, Transformed};
