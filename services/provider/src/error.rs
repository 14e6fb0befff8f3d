//! Error taxonomy shared by the transport, the reconciler and the provider.

use std::fmt;

/// Classification of a failure, deciding how the reconciler reacts to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connection refused, timeout, overloaded remote. Safe to retry.
    Transient,
    /// The remote rejected the request as invalid. Retrying will not help.
    Permanent,
    /// Unresolved or missing provider settings. Aborts the session.
    Configuration,
    /// Remote state diverged in a way that cannot be resolved automatically.
    Conflict,
    /// The remote has no VM with the requested identifier.
    NotFound,
    /// The caller cancelled the operation.
    Cancelled,
}

impl ErrorKind {
    /// Whether an operation failing with this kind may be retried as is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Permanent => write!(f, "permanent"),
            ErrorKind::Configuration => write!(f, "configuration"),
            ErrorKind::Conflict => write!(f, "conflict"),
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
        }
    }
}
