// ── Core error types ──
//
// User-facing errors from warren-core. Collaborator failures are never
// exposed raw -- the manager wraps them into `Backend`/`Store` variants
// tagged with the operation that was in flight, after performing any
// compensating rollback.

use thiserror::Error;

/// Unified error type for tunnel lifecycle operations.
///
/// `Clone` because a single restore outcome fans out to every caller that
/// queued behind the bootstrap sequence.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TunnelError {
    // ── Validation errors (detected before any collaborator call) ──
    #[error("invalid tunnel name: {name:?}")]
    InvalidName { name: String },

    #[error("tunnel already exists: {name}")]
    AlreadyExists { name: String },

    #[error("no such tunnel: {name}")]
    NotFound { name: String },

    // ── Collaborator errors ──────────────────────────────────────────
    #[error("backend failure during {operation}: {reason}")]
    Backend {
        operation: &'static str,
        reason: String,
    },

    #[error("config store failure during {operation}: {reason}")]
    Store {
        operation: &'static str,
        reason: String,
    },

    // ── Lifecycle errors ─────────────────────────────────────────────
    #[error("tunnel service stopped")]
    ServiceStopped,
}

// ── Collaborator error carriers ──────────────────────────────────────

/// Error reported by a [`TunnelBackend`](crate::TunnelBackend)
/// implementation.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct BackendError {
    message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Error reported by a [`ConfigStore`](crate::ConfigStore) implementation.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct StoreError {
    message: String,
}

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl TunnelError {
    pub(crate) fn backend(operation: &'static str, err: &BackendError) -> Self {
        Self::Backend {
            operation,
            reason: err.to_string(),
        }
    }

    pub(crate) fn store(operation: &'static str, err: &StoreError) -> Self {
        Self::Store {
            operation,
            reason: err.to_string(),
        }
    }
}
