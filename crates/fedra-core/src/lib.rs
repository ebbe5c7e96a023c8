//! fedra-core: types, values and IR for federated computations.
//!
//! A federated computation is a typed expression tree whose values live at
//! placements (one server, many clients). This crate defines the building
//! blocks: the [`Type`] system, realized [`Value`]s, the [`Expr`] IR with
//! validating constructors, the closed set of federated [`Intrinsic`]s,
//! compiled [`Kernel`] payloads and the wire encodings used between
//! processes.
//!
//! ```
//! use fedra_core::{intrinsics, Expr, Type};
//!
//! let x = Expr::reference("x", Type::at_clients(Type::int32())).unwrap();
//! let sum = intrinsics::federated_sum(x).unwrap();
//! assert_eq!(sum.type_signature().to_string(), "int32@SERVER");
//! ```

pub mod cardinality;
mod display;
pub mod error;
pub mod expr;
pub mod intrinsics;
pub mod kernel;
pub mod types;
pub mod value;
pub mod wire;

pub use cardinality::CardinalityMap;
pub use error::{CoreError, Result};
pub use expr::{Expr, ExprKind, Selector};
pub use intrinsics::Intrinsic;
pub use kernel::{Kernel, KernelBuilder, KernelNode, NodeId};
pub use types::{DType, Placement, TensorSpec, Type};
pub use value::{Tensor, TensorData, Value};
pub use wire::{WireExpr, WireKernel, WirePayload};
