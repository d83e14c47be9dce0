//! Audit trail for manager operations.
//!
//! Every confirm, rollback, and undo appends one JSONL envelope to the
//! audit log. The sink is an explicit constructor input to the repair
//! manager (tests inject a disabled one) and the envelope is stable for
//! machine consumers.

use crate::core::error::MendError;
use crate::core::time;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

fn default_schema_version() -> String {
    "1.0.0".to_string()
}

/// Audit envelope for one manager operation.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ManagerEvent {
    /// Envelope schema version for machine consumers.
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    /// ISO-8601 UTC timestamp.
    pub ts: String,
    /// Unique envelope id.
    pub event_id: String,
    /// Operation name (e.g. "manager.confirm", "manager.undo").
    pub op: String,
    /// Operator label carried on the repair operations ("user", "batch").
    pub operator: String,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Log file the operation targeted.
    pub log_path: String,
    /// Backend in effect ("file-atomic" or "event-sourced").
    pub backend: String,
    /// "success" or "error".
    pub status: String,
    /// Operation-specific details (counts, backup id, failure message).
    #[serde(default)]
    pub detail: JsonValue,
}

impl ManagerEvent {
    pub fn new(op: &str, operator: &str, log_path: &str, backend: &str) -> ManagerEvent {
        ManagerEvent {
            schema_version: default_schema_version(),
            ts: time::now_iso(),
            event_id: time::new_event_id(),
            op: op.to_string(),
            operator: operator.to_string(),
            session_id: None,
            log_path: log_path.to_string(),
            backend: backend.to_string(),
            status: "success".to_string(),
            detail: JsonValue::Null,
        }
    }
}

/// Append-only JSONL audit sink. A disabled sink swallows events, which is
/// what tests and pure-preview flows want.
pub struct AuditLog {
    path: Option<PathBuf>,
    guard: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> AuditLog {
        AuditLog {
            path: Some(path),
            guard: Mutex::new(()),
        }
    }

    pub fn disabled() -> AuditLog {
        AuditLog {
            path: None,
            guard: Mutex::new(()),
        }
    }

    pub fn append(&self, event: &ManagerEvent) -> Result<(), MendError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self
            .guard
            .lock()
            .map_err(|_| MendError::InvariantViolation("audit lock poisoned".to_string()))?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let mut f = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(f, "{}", serde_json::to_string(event)?)?;
        Ok(())
    }
}
