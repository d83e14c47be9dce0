//! Persistence layer: the single interface other components depend on.
//!
//! Two interchangeable implementations exist: the file-atomic backend
//! (in-place rewrite with sidecar lock and backups) and the event-sourced
//! backend (append-only repair events, the log file is never touched).
//! Which one is in effect is a configuration choice made at start-up.
//!
//! The in-memory application semantics live here too, shared by the file
//! backend (which applies then rewrites) and the materializer (which
//! applies during replay): operations verify their target before acting,
//! so replays and double-applies are no-ops rather than damage.

use crate::core::config::BackendChoice;
use crate::core::engine::{RepairOperation, RepairOperationKind};
use crate::core::error::MendError;
use crate::core::logfile::LogFile;
use crate::core::record::Record;

/// Upper bound on undo-history entries returned by either backend.
pub const MAX_UNDO_POINTS: usize = 50;

/// One restorable point in a log's history: a backup sidecar (backend A) or
/// a non-reverted repair event (backend B).
#[derive(Debug, Clone)]
pub struct UndoPoint {
    pub id: String,
    pub timestamp: String,
    pub label: String,
}

/// The five-operation persistence contract.
pub trait PersistenceBackend {
    /// Produce a restorable marker without observably modifying the log.
    fn create_backup(&self, log: &LogFile) -> Result<String, MendError>;

    /// Apply one operation, atomically with respect to external readers.
    /// Returns true when the operation is satisfied (freshly applied or
    /// already holding); false when its subject no longer exists.
    fn apply_repair(&self, log: &mut LogFile, op: &RepairOperation) -> Result<bool, MendError>;

    /// Restore the state captured by `backup_id`. Returns false when the
    /// marker is unknown.
    fn rollback_to_backup(&self, log: &mut LogFile, backup_id: &str) -> Result<bool, MendError>;

    /// Time-ordered undo points, newest first, bounded.
    fn undo_history(&self, log: &LogFile) -> Result<Vec<UndoPoint>, MendError>;

    /// Which backend is in effect.
    fn backend_name(&self) -> BackendChoice;
}

/// Outcome of applying one operation to an in-memory log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStatus {
    /// The log changed.
    Applied,
    /// The operation's effect was already present; nothing changed.
    AlreadySatisfied,
    /// The subject record does not exist (and cannot be synthesized).
    TargetMissing,
}

impl ApplyStatus {
    /// The trait-level success flag: a satisfied operation is a success
    /// whether or not this particular call did the work.
    pub fn is_satisfied(self) -> bool {
        !matches!(self, ApplyStatus::TargetMissing)
    }
}

/// Apply one operation to the in-memory log. Pure with respect to disk.
pub fn apply_operation(log: &mut LogFile, kind: &RepairOperationKind) -> ApplyStatus {
    match kind {
        RepairOperationKind::Relink {
            child_uuid,
            new_parent,
            ..
        } => {
            let Some(child) = log.record_mut(child_uuid) else {
                return ApplyStatus::TargetMissing;
            };
            if child.parent_uuid == *new_parent {
                return ApplyStatus::AlreadySatisfied;
            }
            child.set_parent_uuid(new_parent.clone());
            ApplyStatus::Applied
        }
        RepairOperationKind::InsertSyntheticResult {
            before_uuid,
            tool_use_id,
            payload,
            synthesize,
        } => {
            if !log.contains(before_uuid) {
                let Some(spec) = synthesize else {
                    return ApplyStatus::TargetMissing;
                };
                let synth = Record::synthetic_user(
                    &spec.uuid,
                    &spec.parent_uuid,
                    spec.session_id.as_deref(),
                    spec.timestamp,
                    0,
                );
                log.insert_record_after(&spec.parent_uuid, synth);
            }
            let Some(target) = log.record_mut(before_uuid) else {
                return ApplyStatus::TargetMissing;
            };
            if target.tool_result_count(tool_use_id) > 0 {
                return ApplyStatus::AlreadySatisfied;
            }
            target.insert_block_front(payload.clone());
            ApplyStatus::Applied
        }
        RepairOperationKind::Drop {
            record_uuid,
            block_index,
            tool_use_id,
            allow_malformed,
        } => {
            let Some(rec) = log.record_mut(record_uuid) else {
                return ApplyStatus::TargetMissing;
            };
            let dropped = if *allow_malformed {
                rec.drop_claimed_tool_result(*block_index, tool_use_id)
            } else {
                rec.drop_tool_result(*block_index, tool_use_id)
            };
            if dropped {
                ApplyStatus::Applied
            } else {
                ApplyStatus::AlreadySatisfied
            }
        }
    }
}

/// Session an operation belongs to: its subject record's session when the
/// log still has it, the synthesized record's session for virtual slots,
/// otherwise the log's primary session.
pub fn session_of_operation(log: &LogFile, op: &RepairOperation) -> String {
    if let Some(rec) = log.record(op.kind.subject_uuid())
        && let Some(sid) = &rec.session_id
    {
        return sid.clone();
    }
    if let RepairOperationKind::InsertSyntheticResult {
        synthesize: Some(spec),
        ..
    } = &op.kind
        && let Some(sid) = &spec.session_id
    {
        return sid.clone();
    }
    log.primary_session().unwrap_or_else(|| "unsessioned".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::SyntheticUserSpec;
    use serde_json::json;
    use std::path::PathBuf;

    fn log_of(text: &str) -> LogFile {
        LogFile::parse(PathBuf::from("t.jsonl"), text)
    }

    #[test]
    fn test_relink_apply_and_replay() {
        let mut log = log_of(r#"{"kind":"user","uuid":"c","parent_uuid":"X"}"#);
        let op = RepairOperationKind::Relink {
            child_uuid: "c".to_string(),
            old_parent: Some("X".to_string()),
            new_parent: Some("A".to_string()),
            similarity_score: Some(0.8),
        };
        assert_eq!(apply_operation(&mut log, &op), ApplyStatus::Applied);
        assert_eq!(
            log.record("c").unwrap().parent_uuid.as_deref(),
            Some("A")
        );
        assert_eq!(apply_operation(&mut log, &op), ApplyStatus::AlreadySatisfied);
    }

    #[test]
    fn test_relink_missing_child() {
        let mut log = log_of(r#"{"kind":"user","uuid":"other"}"#);
        let op = RepairOperationKind::Relink {
            child_uuid: "gone".to_string(),
            old_parent: None,
            new_parent: Some("A".to_string()),
            similarity_score: None,
        };
        let status = apply_operation(&mut log, &op);
        assert_eq!(status, ApplyStatus::TargetMissing);
        assert!(!status.is_satisfied());
    }

    #[test]
    fn test_insert_into_existing_record_is_idempotent() {
        let mut log = log_of(
            r#"{"kind":"user","uuid":"u","content":[{"type":"text","text":"next"}]}"#,
        );
        let op = RepairOperationKind::InsertSyntheticResult {
            before_uuid: "u".to_string(),
            tool_use_id: "T1".to_string(),
            payload: json!({"type":"tool_result","tool_use_id":"T1","content":"cancelled","is_error":true}),
            synthesize: None,
        };
        assert_eq!(apply_operation(&mut log, &op), ApplyStatus::Applied);
        assert_eq!(apply_operation(&mut log, &op), ApplyStatus::AlreadySatisfied);
        assert_eq!(log.record("u").unwrap().tool_result_count("T1"), 1);
    }

    #[test]
    fn test_insert_synthesizes_trailing_record() {
        let mut log = log_of(
            r#"{"kind":"assistant","uuid":"a","session_id":"s","content":[{"type":"tool_use","id":"T1"}]}"#,
        );
        let op = RepairOperationKind::InsertSyntheticResult {
            before_uuid: "v".to_string(),
            tool_use_id: "T1".to_string(),
            payload: json!({"type":"tool_result","tool_use_id":"T1","content":"cancelled","is_error":true}),
            synthesize: Some(SyntheticUserSpec {
                uuid: "v".to_string(),
                parent_uuid: "a".to_string(),
                session_id: Some("s".to_string()),
                timestamp: None,
            }),
        };
        assert_eq!(apply_operation(&mut log, &op), ApplyStatus::Applied);
        let synth = log.record("v").unwrap();
        assert_eq!(synth.parent_uuid.as_deref(), Some("a"));
        assert_eq!(synth.tool_result_count("T1"), 1);
        // replay does not mint a second record or block
        assert_eq!(apply_operation(&mut log, &op), ApplyStatus::AlreadySatisfied);
        assert_eq!(log.records().count(), 2);
    }

    #[test]
    fn test_drop_is_verified_and_idempotent() {
        let mut log = log_of(
            r#"{"kind":"user","uuid":"u","content":[{"type":"tool_result","tool_use_id":"T","content":"a"},{"type":"tool_result","tool_use_id":"T","content":"b"}]}"#,
        );
        let op = RepairOperationKind::Drop {
            record_uuid: "u".to_string(),
            block_index: 1,
            tool_use_id: "T".to_string(),
            allow_malformed: false,
        };
        assert_eq!(apply_operation(&mut log, &op), ApplyStatus::Applied);
        assert_eq!(apply_operation(&mut log, &op), ApplyStatus::AlreadySatisfied);
        assert_eq!(log.record("u").unwrap().tool_result_count("T"), 1);
    }

    #[test]
    fn test_session_of_operation_prefers_subject_record() {
        let log = log_of(concat!(
            r#"{"kind":"user","uuid":"a","session_id":"s1"}"#,
            "\n",
            r#"{"kind":"user","uuid":"b","session_id":"s2"}"#,
        ));
        let op = RepairOperation {
            event_id: "e".to_string(),
            operator: "test".to_string(),
            timestamp: chrono::Utc::now(),
            reason: String::new(),
            kind: RepairOperationKind::Relink {
                child_uuid: "b".to_string(),
                old_parent: None,
                new_parent: None,
                similarity_score: None,
            },
        };
        assert_eq!(session_of_operation(&log, &op), "s2");
    }
}
