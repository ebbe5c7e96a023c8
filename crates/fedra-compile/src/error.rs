//! Error types for fedra-compile.

use fedra_core::CoreError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// A pass tried to build an invalid node.
    #[error(transparent)]
    Core(#[from] CoreError),
    /// The pipeline kept changing the tree for the whole sweep budget.
    #[error("transformation did not converge after {iterations} sweeps")]
    TransformationDidNotConverge { iterations: usize },
    #[error("unbound reference `{0}`")]
    UnboundReference(String),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
}

pub type Result<T> = std::result::Result<T, CompileError>;
