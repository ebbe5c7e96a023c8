//! Error types for fedra-core.

use thiserror::Error;

/// Errors raised while constructing or decoding types, values and IR.
///
/// Every variant is fatal: construction errors are reported at the point of
/// construction and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Types of a node's children are inconsistent with the node.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    /// A byte sequence does not decode to a type.
    #[error("malformed type: {0}")]
    MalformedType(String),
    /// A wire expression does not decode to well-formed IR.
    #[error("malformed IR: {0}")]
    MalformedIr(String),
    /// A reference has no enclosing binding.
    #[error("unbound reference `{0}`")]
    UnboundReference(String),
    /// An intrinsic was applied to a value at the wrong placement.
    #[error("placement mismatch: {0}")]
    PlacementMismatch(String),
}

impl CoreError {
    pub(crate) fn mismatch(msg: impl Into<String>) -> Self {
        Self::TypeMismatch(msg.into())
    }
}

impl From<postcard::Error> for CoreError {
    fn from(e: postcard::Error) -> Self {
        Self::MalformedIr(e.to_string())
    }
}

/// Result alias used throughout fedra-core.
pub type Result<T> = std::result::Result<T, CoreError>;
