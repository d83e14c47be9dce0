//! Error types for logmend operations.
//!
//! This module defines the canonical error type used throughout logmend.
//! All public operations return `Result<T, MendError>` for error handling.
//!
//! Non-fatal conditions (malformed input lines, stale defect selections) are
//! carried inside report values, never raised through this type. Everything
//! here is fatal for the call in which it arises.

use std::io;
use thiserror::Error;

/// Canonical error type for all logmend operations.
///
/// Uses `thiserror` for automatic `Display` and `Error` trait implementations.
/// Several variants auto-convert from standard library errors via `#[from]`.
#[derive(Error, Debug)]
pub enum MendError {
    /// SQLite event-store error (auto-converts from `rusqlite::Error`)
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),

    /// I/O error (auto-converts from `std::io::Error`)
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// JSON encode/decode failure outside the tolerant line codec
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Configuration file or environment override error
    #[error("Config error: {0}")]
    ConfigError(String),

    /// Cycle in the parent chain. Fatal per session: the log is
    /// unprocessable until the upstream input is corrected.
    #[error("Structural error: parent cycle through [{}]", .cycle.join(", "))]
    StructuralError {
        /// The uuids participating in the detected cycle.
        cycle: Vec<String>,
    },

    /// Backend failure while applying or rolling back a repair
    /// (lock contention, rename failure, append rejection).
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// Event store cannot be reached or opened within the timeout.
    /// Backend A is unaffected; callers may retry or reconfigure.
    #[error("Event store unavailable: {0}")]
    StoreUnavailable(String),

    /// Event store exists but its schema does not match this version.
    #[error("Event store schema mismatch: {0}")]
    SchemaMismatch(String),

    /// An internal check failed (duplicate event id, illegal state
    /// transition). Treated as a bug; the operation is refused.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Resource not found (missing log file, backup, event id)
    #[error("Not found: {0}")]
    NotFound(String),
}

impl MendError {
    /// Map an error to the process exit code contract used by the CLI
    /// surface: 3 = persistence failure, 4 = upstream corruption (cycle),
    /// 5 = store unavailable. Everything else is a generic failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            MendError::StructuralError { .. } => 4,
            MendError::StoreUnavailable(_) => 5,
            MendError::PersistenceError(_)
            | MendError::RusqliteError(_)
            | MendError::SchemaMismatch(_) => 3,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_error_display() {
        let err = MendError::StructuralError {
            cycle: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(
            format!("{}", err),
            "Structural error: parent cycle through [a, b]"
        );
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_store_unavailable_exit_code() {
        let err = MendError::StoreUnavailable("endpoint missing".to_string());
        assert_eq!(err.exit_code(), 5);
    }

    #[test]
    fn test_persistence_error_exit_code() {
        let err = MendError::PersistenceError("rename failed".to_string());
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_invariant_violation_display() {
        let err = MendError::InvariantViolation("duplicate event id".to_string());
        assert_eq!(
            format!("{}", err),
            "Invariant violation: duplicate event id"
        );
        assert_eq!(err.exit_code(), 1);
    }
}
