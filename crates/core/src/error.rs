//! Centralized error types for the Custos workspace.

use thiserror::Error;

/// Top-level error enum. Variants map to the error taxonomy, not to subsystems.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CustosError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Tuple store error: {0}")]
    TupleStore(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification used by outer layers to pick a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Forbidden,
    Conflict,
    Unavailable,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
        }
    }
}

impl CustosError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CustosError::Validation(_) => ErrorKind::Validation,
            CustosError::NotFound(_) => ErrorKind::NotFound,
            CustosError::Forbidden(_) => ErrorKind::Forbidden,
            CustosError::Conflict(_) => ErrorKind::Conflict,
            CustosError::Unavailable(_) | CustosError::TupleStore(_) => ErrorKind::Unavailable,
            CustosError::Persistence(_) | CustosError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn forbidden(action: &str, object: &str) -> Self {
        CustosError::Forbidden(format!("not allowed to {action} {object}"))
    }
}

pub type CustosResult<T> = Result<T, CustosError>;
