//! Error types for fedra-runtime.

use fedra_compile::CompileError;
use fedra_core::CoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by executors, the factory and the executor service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    /// A remote call kept failing after every retry.
    #[error("remote executor unavailable: {0}")]
    RemoteUnavailable(String),
    /// A kernel could not be evaluated.
    #[error("evaluation failed: {0}")]
    Evaluation(String),
    #[error("unsatisfiable topology: {0}")]
    UnsatisfiableTopology(String),
    /// A federated value does not have one member per participant.
    #[error("cardinality mismatch: {0}")]
    CardinalityMismatch(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("configuration error: {0}")]
    Config(String),
    /// Session bookkeeping on the executor service.
    #[error("service error: {0}")]
    Service(String),
}

/// The variant of an [`ExecutorError`], without its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    TypeMismatch,
    MalformedType,
    MalformedIr,
    UnboundReference,
    PlacementMismatch,
    TransformationDidNotConverge,
    RemoteUnavailable,
    Evaluation,
    UnsatisfiableTopology,
    CardinalityMismatch,
    Cancelled,
    Config,
    Service,
}

impl ExecutorError {
    pub(crate) fn mismatch(msg: impl Into<String>) -> Self {
        Self::Core(CoreError::TypeMismatch(msg.into()))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Core(e) => core_kind(e),
            Self::Compile(CompileError::Core(e)) => core_kind(e),
            Self::Compile(CompileError::TransformationDidNotConverge { .. }) => {
                ErrorKind::TransformationDidNotConverge
            }
            Self::Compile(CompileError::UnboundReference(_)) => ErrorKind::UnboundReference,
            Self::Compile(CompileError::TypeMismatch(_)) => ErrorKind::TypeMismatch,
            Self::RemoteUnavailable(_) => ErrorKind::RemoteUnavailable,
            Self::Evaluation(_) => ErrorKind::Evaluation,
            Self::UnsatisfiableTopology(_) => ErrorKind::UnsatisfiableTopology,
            Self::CardinalityMismatch(_) => ErrorKind::CardinalityMismatch,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Config(_) => ErrorKind::Config,
            Self::Service(_) => ErrorKind::Service,
        }
    }

    /// The variant's own message, without the kind prefix.
    fn detail(&self) -> String {
        match self {
            Self::Core(e) | Self::Compile(CompileError::Core(e)) => match e {
                CoreError::TypeMismatch(m)
                | CoreError::MalformedType(m)
                | CoreError::MalformedIr(m)
                | CoreError::UnboundReference(m)
                | CoreError::PlacementMismatch(m) => m.clone(),
            },
            Self::Compile(CompileError::TransformationDidNotConverge { iterations }) => {
                iterations.to_string()
            }
            Self::Compile(CompileError::UnboundReference(m))
            | Self::Compile(CompileError::TypeMismatch(m))
            | Self::RemoteUnavailable(m)
            | Self::Evaluation(m)
            | Self::UnsatisfiableTopology(m)
            | Self::CardinalityMismatch(m)
            | Self::Config(m)
            | Self::Service(m) => m.clone(),
            Self::Cancelled => String::new(),
        }
    }

    /// Rebuild an error from its kind and message.
    pub fn from_kind(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::TypeMismatch => Self::Core(CoreError::TypeMismatch(message)),
            ErrorKind::MalformedType => Self::Core(CoreError::MalformedType(message)),
            ErrorKind::MalformedIr => Self::Core(CoreError::MalformedIr(message)),
            ErrorKind::UnboundReference => Self::Core(CoreError::UnboundReference(message)),
            ErrorKind::PlacementMismatch => Self::Core(CoreError::PlacementMismatch(message)),
            ErrorKind::TransformationDidNotConverge => {
                Self::Compile(CompileError::TransformationDidNotConverge {
                    iterations: message.parse().unwrap_or_default(),
                })
            }
            ErrorKind::RemoteUnavailable => Self::RemoteUnavailable(message),
            ErrorKind::Evaluation => Self::Evaluation(message),
            ErrorKind::UnsatisfiableTopology => Self::UnsatisfiableTopology(message),
            ErrorKind::CardinalityMismatch => Self::CardinalityMismatch(message),
            ErrorKind::Cancelled => Self::Cancelled,
            ErrorKind::Config => Self::Config(message),
            ErrorKind::Service => Self::Service(message),
        }
    }
}

fn core_kind(e: &CoreError) -> ErrorKind {
    match e {
        CoreError::TypeMismatch(_) => ErrorKind::TypeMismatch,
        CoreError::MalformedType(_) => ErrorKind::MalformedType,
        CoreError::MalformedIr(_) => ErrorKind::MalformedIr,
        CoreError::UnboundReference(_) => ErrorKind::UnboundReference,
        CoreError::PlacementMismatch(_) => ErrorKind::PlacementMismatch,
    }
}

/// An [`ExecutorError`] as it crosses the service boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind:?}: {message}")]
pub struct ServiceError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ServiceError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&ExecutorError> for ServiceError {
    fn from(e: &ExecutorError) -> Self {
        Self {
            kind: e.kind(),
            message: e.detail(),
        }
    }
}

impl From<ExecutorError> for ServiceError {
    fn from(e: ExecutorError) -> Self {
        Self::from(&e)
    }
}

impl From<CoreError> for ServiceError {
    fn from(e: CoreError) -> Self {
        Self::from(ExecutorError::Core(e))
    }
}

impl From<ServiceError> for ExecutorError {
    fn from(e: ServiceError) -> Self {
        Self::from_kind(e.kind, e.message)
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;
