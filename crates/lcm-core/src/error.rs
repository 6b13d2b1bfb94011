//! Error taxonomy shared by every layer of lcm.
//!
//! Each variant carries a human-readable `message` and a `fix` hint telling
//! the user what to do about it. Adapters translate backend failures into one
//! of these kinds; nothing backend-specific leaks past the provider layer.

use thiserror::Error;

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, LcmError>;

/// Discriminant of [`LcmError`], for matching without destructuring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    Auth,
    RuntimeUnavailable,
    ModelUnavailable,
}

/// All errors surfaced by the facade.
#[derive(Debug, Error)]
pub enum LcmError {
    /// Malformed settings file, unknown provider, invalid value, missing key,
    /// or unresolved `${VAR}` reference.
    #[error("{message}\n\nHOW TO FIX: {fix}")]
    Config { message: String, fix: String },

    /// Credential missing or rejected by the backend.
    #[error("{message}\n\nHOW TO FIX: {fix}")]
    Auth { message: String, fix: String },

    /// Backend unreachable, connection refused, or timeout exceeded.
    #[error("{message}\n\nHOW TO FIX: {fix}")]
    RuntimeUnavailable { message: String, fix: String },

    /// Model does not exist and could not be provisioned.
    #[error("{message}\n\nHOW TO FIX: {fix}")]
    ModelUnavailable { message: String, fix: String },
}

impl LcmError {
    pub fn config(message: impl Into<String>, fix: impl Into<String>) -> Self {
        LcmError::Config {
            message: message.into(),
            fix: fix.into(),
        }
    }

    pub fn auth(message: impl Into<String>, fix: impl Into<String>) -> Self {
        LcmError::Auth {
            message: message.into(),
            fix: fix.into(),
        }
    }

    pub fn runtime_unavailable(message: impl Into<String>, fix: impl Into<String>) -> Self {
        LcmError::RuntimeUnavailable {
            message: message.into(),
            fix: fix.into(),
        }
    }

    pub fn model_unavailable(message: impl Into<String>, fix: impl Into<String>) -> Self {
        LcmError::ModelUnavailable {
            message: message.into(),
            fix: fix.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LcmError::Config { .. } => ErrorKind::Config,
            LcmError::Auth { .. } => ErrorKind::Auth,
            LcmError::RuntimeUnavailable { .. } => ErrorKind::RuntimeUnavailable,
            LcmError::ModelUnavailable { .. } => ErrorKind::ModelUnavailable,
        }
    }

    /// The problem statement, without the remediation hint.
    pub fn message(&self) -> &str {
        match self {
            LcmError::Config { message, .. }
            | LcmError::Auth { message, .. }
            | LcmError::RuntimeUnavailable { message, .. }
            | LcmError::ModelUnavailable { message, .. } => message,
        }
    }

    /// The remediation hint.
    pub fn fix(&self) -> &str {
        match self {
            LcmError::Config { fix, .. }
            | LcmError::Auth { fix, .. }
            | LcmError::RuntimeUnavailable { fix, .. }
            | LcmError::ModelUnavailable { fix, .. } => fix,
        }
    }
}
