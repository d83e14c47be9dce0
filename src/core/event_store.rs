//! Append-only repair event store.
//!
//! Every applied repair is recorded as an immutable [`RepairEvent`] row in
//! `repairs_events`, with relation tables linking events to their session
//! and subject record for fast reverse queries. Rows are INSERT-only;
//! schema-level triggers abort any UPDATE or DELETE.
//!
//! Revert semantics: undoing a prior event appends a new event referencing
//! the target's id with `operator = "system-revert"`. The target's
//! `is_reverted` flag flips *virtually at replay time*; the stored row is
//! never touched.

use crate::core::config::Config;
use crate::core::engine::{RepairOperation, RepairOperationKind};
use crate::core::error::MendError;
use crate::core::schemas;
use crate::core::time;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

pub const REVERT_KIND: &str = "revert";
pub const REVERT_OPERATOR: &str = "system-revert";

/// The immutable record of one applied repair operation.
#[derive(Debug, Clone)]
pub struct RepairEvent {
    pub event_id: String,
    pub session_id: String,
    /// Subject of the operation.
    pub record_uuid: String,
    pub operation_kind: String,
    pub old_parent: Option<String>,
    pub new_parent: Option<String>,
    /// Operation-specific payload, opaque to the store.
    pub payload: Value,
    pub operator: String,
    pub reason: String,
    /// Store-assigned, strictly monotonic per session.
    pub timestamp: String,
    pub similarity_score: Option<f64>,
    /// Virtual flag computed at replay; the database row stays untouched.
    pub is_reverted: bool,
}

impl RepairEvent {
    /// Wrap a planned operation for a session's event stream. The final
    /// timestamp is assigned by [`EventStore::append`].
    pub fn from_operation(session_id: &str, op: &RepairOperation) -> Result<RepairEvent, MendError> {
        let (old_parent, new_parent, similarity_score) = match &op.kind {
            RepairOperationKind::Relink {
                old_parent,
                new_parent,
                similarity_score,
                ..
            } => (old_parent.clone(), new_parent.clone(), *similarity_score),
            _ => (None, None, None),
        };
        Ok(RepairEvent {
            event_id: op.event_id.clone(),
            session_id: session_id.to_string(),
            record_uuid: op.kind.subject_uuid().to_string(),
            operation_kind: op.kind.kind_str().to_string(),
            old_parent,
            new_parent,
            payload: serde_json::to_value(&op.kind)?,
            operator: op.operator.clone(),
            reason: op.reason.clone(),
            timestamp: time::format_iso(op.timestamp),
            similarity_score,
            is_reverted: false,
        })
    }

    /// Build the revert event for `target`.
    pub fn revert_of(target: &RepairEvent) -> RepairEvent {
        RepairEvent {
            event_id: time::new_event_id(),
            session_id: target.session_id.clone(),
            record_uuid: target.record_uuid.clone(),
            operation_kind: REVERT_KIND.to_string(),
            old_parent: None,
            new_parent: None,
            payload: serde_json::json!({ "target_event_id": target.event_id }),
            operator: REVERT_OPERATOR.to_string(),
            reason: format!("revert of {}", target.event_id),
            timestamp: time::now_iso(),
            similarity_score: None,
            is_reverted: false,
        }
    }

    pub fn is_revert(&self) -> bool {
        self.operation_kind == REVERT_KIND
    }

    /// Target event id, for revert events.
    pub fn revert_target(&self) -> Option<&str> {
        if !self.is_revert() {
            return None;
        }
        self.payload.get("target_event_id").and_then(Value::as_str)
    }

    /// Decode the payload back into the operation it recorded. Revert and
    /// marker events (e.g. a sync baseline) have no operation of their own.
    pub fn operation(&self) -> Result<Option<RepairOperationKind>, MendError> {
        match self.operation_kind.as_str() {
            "relink" | "insert_synthetic_result" | "drop" => {
                Ok(Some(serde_json::from_value(self.payload.clone())?))
            }
            _ => Ok(None),
        }
    }
}

/// Connection handle to the append-only store. The handle serializes its
/// own appends; per-session apply ordering is the repair manager's lock.
#[derive(Debug)]
pub struct EventStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl EventStore {
    /// Open (creating if needed) the store described by `config`.
    pub fn open(config: &Config) -> Result<EventStore, MendError> {
        Self::open_at(&config.store_path(), config.store_timeout())
    }

    /// Open a store at an explicit path. Connection failures surface as
    /// `StoreUnavailable`; an incompatible existing table surfaces as
    /// `SchemaMismatch`.
    pub fn open_at(path: &Path, timeout: Duration) -> Result<EventStore, MendError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| MendError::StoreUnavailable(format!("{}: {}", path.display(), e)))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| MendError::StoreUnavailable(format!("{}: {}", path.display(), e)))?;
        conn.busy_timeout(timeout)?;
        conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
        conn.execute("PRAGMA foreign_keys=ON;", [])?;

        conn.execute(schemas::REPAIRS_DB_SCHEMA_META, [])?;
        conn.execute(schemas::REPAIRS_DB_SCHEMA_EVENTS, [])?;
        conn.execute(schemas::REPAIRS_DB_SCHEMA_SESSION_LINKS, [])?;
        conn.execute(schemas::REPAIRS_DB_SCHEMA_RECORD_LINKS, [])?;
        conn.execute(schemas::REPAIRS_DB_INDEX_SESSION_TS, [])?;
        conn.execute(schemas::REPAIRS_DB_INDEX_RECORD, [])?;
        conn.execute(schemas::REPAIRS_DB_TRIGGER_NO_UPDATE, [])?;
        conn.execute(schemas::REPAIRS_DB_TRIGGER_NO_DELETE, [])?;
        conn.execute(
            "INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', ?1)",
            params![schemas::REPAIRS_DB_SCHEMA_VERSION.to_string()],
        )?;

        let store = EventStore {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        };
        store.verify_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn verify_schema(&self) -> Result<(), MendError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("PRAGMA table_info(repairs_events)")?;
        let columns: HashSet<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<_, _>>()?;
        for required in schemas::REPAIRS_EVENTS_REQUIRED_COLUMNS {
            if !columns.contains(*required) {
                return Err(MendError::SchemaMismatch(format!(
                    "repairs_events is missing column '{}'",
                    required
                )));
            }
        }
        Ok(())
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, MendError> {
        self.conn
            .lock()
            .map_err(|_| MendError::InvariantViolation("event store lock poisoned".to_string()))
    }

    /// Cheap connectivity probe.
    pub fn health(&self) -> Result<(), MendError> {
        let conn = self.lock_conn()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(map_busy)?;
        Ok(())
    }

    /// Append one event. Assigns a strictly monotonic per-session timestamp
    /// and writes the row plus its relation links in one transaction.
    /// A duplicate event id is refused as an invariant violation.
    pub fn append(&self, event: &RepairEvent) -> Result<RepairEvent, MendError> {
        let mut stored = event.clone();
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction().map_err(map_busy)?;

        let duplicate: Option<String> = tx
            .query_row(
                "SELECT event_id FROM repairs_events WHERE event_id = ?1",
                params![stored.event_id],
                |row| row.get(0),
            )
            .optional()?;
        if duplicate.is_some() {
            return Err(MendError::InvariantViolation(format!(
                "duplicate event id {}",
                stored.event_id
            )));
        }

        let max_ts: Option<String> = tx
            .query_row(
                "SELECT MAX(ts) FROM repairs_events WHERE session_id = ?1",
                params![stored.session_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        stored.timestamp = next_monotonic_ts(max_ts.as_deref());

        tx.execute(
            "INSERT INTO repairs_events
             (event_id, session_id, record_uuid, operation_kind, old_parent, new_parent,
              payload, operator, reason, ts, similarity_score, is_reverted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0)",
            params![
                stored.event_id,
                stored.session_id,
                stored.record_uuid,
                stored.operation_kind,
                stored.old_parent,
                stored.new_parent,
                serde_json::to_string(&stored.payload)?,
                stored.operator,
                stored.reason,
                stored.timestamp,
                stored.similarity_score,
            ],
        )
        .map_err(map_busy)?;
        tx.execute(
            "INSERT INTO event_session_links (event_id, session_id) VALUES (?1, ?2)",
            params![stored.event_id, stored.session_id],
        )?;
        tx.execute(
            "INSERT INTO event_record_links (event_id, record_uuid) VALUES (?1, ?2)",
            params![stored.event_id, stored.record_uuid],
        )?;
        tx.commit().map_err(map_busy)?;
        Ok(stored)
    }

    /// Events for one session in timestamp order, optionally bounded to the
    /// `at_most` oldest. Revert flags are raw (all false) here; use
    /// [`query_for_session_resolved`](Self::query_for_session_resolved) for
    /// the virtual view.
    pub fn query_for_session(
        &self,
        session_id: &str,
        at_most: Option<usize>,
    ) -> Result<Vec<RepairEvent>, MendError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT event_id, session_id, record_uuid, operation_kind, old_parent, new_parent,
                    payload, operator, reason, ts, similarity_score
             FROM repairs_events WHERE session_id = ?1 ORDER BY ts ASC",
        )?;
        let mut events = stmt
            .query_map(params![session_id], row_to_event)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_busy)?;
        if let Some(cap) = at_most {
            events.truncate(cap);
        }
        Ok(events)
    }

    /// Session events with the virtual `is_reverted` flags applied: every
    /// event targeted by a revert event reads as reverted.
    pub fn query_for_session_resolved(
        &self,
        session_id: &str,
    ) -> Result<Vec<RepairEvent>, MendError> {
        let mut events = self.query_for_session(session_id, None)?;
        let reverted: HashSet<String> = events
            .iter()
            .filter_map(|e| e.revert_target().map(str::to_string))
            .collect();
        for event in &mut events {
            event.is_reverted = reverted.contains(&event.event_id);
        }
        Ok(events)
    }

    /// Events whose subject is `record_uuid`, via the relation table.
    pub fn query_for_record(&self, record_uuid: &str) -> Result<Vec<RepairEvent>, MendError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT e.event_id, e.session_id, e.record_uuid, e.operation_kind, e.old_parent,
                    e.new_parent, e.payload, e.operator, e.reason, e.ts, e.similarity_score
             FROM repairs_events e
             JOIN event_record_links l ON l.event_id = e.event_id
             WHERE l.record_uuid = ?1 ORDER BY e.ts ASC",
        )?;
        let events = stmt
            .query_map(params![record_uuid], row_to_event)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_busy)?;
        Ok(events)
    }

    /// One event by id.
    pub fn event(&self, event_id: &str) -> Result<Option<RepairEvent>, MendError> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT event_id, session_id, record_uuid, operation_kind, old_parent, new_parent,
                    payload, operator, reason, ts, similarity_score
             FROM repairs_events WHERE event_id = ?1",
            params![event_id],
            row_to_event,
        )
        .optional()
        .map_err(map_busy)
    }

    /// Latest event id for a session, if any. Backend B's synthetic backup
    /// marker.
    pub fn latest_event_id(&self, session_id: &str) -> Result<Option<String>, MendError> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT event_id FROM repairs_events WHERE session_id = ?1
             ORDER BY ts DESC LIMIT 1",
            params![session_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(map_busy)
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<RepairEvent> {
    let payload_raw: String = row.get(6)?;
    Ok(RepairEvent {
        event_id: row.get(0)?,
        session_id: row.get(1)?,
        record_uuid: row.get(2)?,
        operation_kind: row.get(3)?,
        old_parent: row.get(4)?,
        new_parent: row.get(5)?,
        payload: serde_json::from_str(&payload_raw).unwrap_or(Value::Null),
        operator: row.get(7)?,
        reason: row.get(8)?,
        timestamp: row.get(9)?,
        similarity_score: row.get(10)?,
        is_reverted: false,
    })
}

/// Assign the next per-session timestamp: now, bumped just past the current
/// maximum when the clock has not advanced.
fn next_monotonic_ts(max_ts: Option<&str>) -> String {
    let now = time::now_iso();
    match max_ts {
        Some(max) if now.as_str() <= max => match time::parse_iso(max) {
            Some(parsed) => time::format_iso(parsed + chrono::Duration::milliseconds(1)),
            None => now,
        },
        _ => now,
    }
}

/// SQLITE_BUSY / SQLITE_LOCKED after the busy timeout means the store did
/// not answer in time; everything else stays a database error.
fn map_busy(e: rusqlite::Error) -> MendError {
    if let rusqlite::Error::SqliteFailure(inner, _) = &e
        && matches!(
            inner.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        )
    {
        return MendError::StoreUnavailable(e.to_string());
    }
    MendError::RusqliteError(e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_tmp(dir: &Path) -> EventStore {
        EventStore::open_at(&dir.join("repairs.db"), Duration::from_secs(5)).unwrap()
    }

    fn sample_event(id: &str, session: &str) -> RepairEvent {
        RepairEvent {
            event_id: id.to_string(),
            session_id: session.to_string(),
            record_uuid: "r1".to_string(),
            operation_kind: "relink".to_string(),
            old_parent: Some("X".to_string()),
            new_parent: Some("A".to_string()),
            payload: serde_json::json!({
                "op": "relink",
                "child_uuid": "r1",
                "old_parent": "X",
                "new_parent": "A",
                "similarity_score": 0.82
            }),
            operator: "user".to_string(),
            reason: "test".to_string(),
            timestamp: time::now_iso(),
            similarity_score: Some(0.82),
            is_reverted: false,
        }
    }

    #[test]
    fn test_append_and_query_round_trip() {
        let dir = tempdir().unwrap();
        let store = open_tmp(dir.path());
        store.append(&sample_event("e1", "s1")).unwrap();
        let events = store.query_for_session("s1", None).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, "e1");
        assert_eq!(events[0].new_parent.as_deref(), Some("A"));
        assert_eq!(store.query_for_record("r1").unwrap().len(), 1);
        assert!(store.query_for_session("other", None).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_event_id_refused() {
        let dir = tempdir().unwrap();
        let store = open_tmp(dir.path());
        store.append(&sample_event("e1", "s1")).unwrap();
        let err = store.append(&sample_event("e1", "s1")).unwrap_err();
        assert!(matches!(err, MendError::InvariantViolation(_)));
        // the failed append left nothing behind
        assert_eq!(store.query_for_session("s1", None).unwrap().len(), 1);
    }

    #[test]
    fn test_timestamps_strictly_monotonic_per_session() {
        let dir = tempdir().unwrap();
        let store = open_tmp(dir.path());
        let mut last = String::new();
        for i in 0..5 {
            let stored = store
                .append(&sample_event(&format!("e{}", i), "s1"))
                .unwrap();
            assert!(stored.timestamp > last, "{} !> {}", stored.timestamp, last);
            last = stored.timestamp;
        }
    }

    #[test]
    fn test_updates_and_deletes_are_aborted_by_triggers() {
        let dir = tempdir().unwrap();
        let store = open_tmp(dir.path());
        store.append(&sample_event("e1", "s1")).unwrap();
        let conn = store.conn.lock().unwrap();
        let update = conn.execute("UPDATE repairs_events SET is_reverted = 1", []);
        assert!(update.is_err());
        let delete = conn.execute("DELETE FROM repairs_events", []);
        assert!(delete.is_err());
    }

    #[test]
    fn test_resolved_view_marks_reverted() {
        let dir = tempdir().unwrap();
        let store = open_tmp(dir.path());
        let stored = store.append(&sample_event("e1", "s1")).unwrap();
        store.append(&RepairEvent::revert_of(&stored)).unwrap();

        let resolved = store.query_for_session_resolved("s1").unwrap();
        assert_eq!(resolved.len(), 2);
        assert!(resolved[0].is_reverted);
        assert!(!resolved[1].is_reverted);
        assert_eq!(resolved[1].revert_target(), Some("e1"));

        // raw rows are untouched
        let raw = store.query_for_session("s1", None).unwrap();
        assert!(raw.iter().all(|e| !e.is_reverted));
    }

    #[test]
    fn test_at_most_bounds_from_the_oldest() {
        let dir = tempdir().unwrap();
        let store = open_tmp(dir.path());
        for i in 0..4 {
            store
                .append(&sample_event(&format!("e{}", i), "s1"))
                .unwrap();
        }
        let bounded = store.query_for_session("s1", Some(2)).unwrap();
        assert_eq!(bounded.len(), 2);
        assert_eq!(bounded[0].event_id, "e0");
        assert_eq!(bounded[1].event_id, "e1");
    }

    #[test]
    fn test_latest_event_id() {
        let dir = tempdir().unwrap();
        let store = open_tmp(dir.path());
        assert!(store.latest_event_id("s1").unwrap().is_none());
        store.append(&sample_event("e1", "s1")).unwrap();
        store.append(&sample_event("e2", "s1")).unwrap();
        assert_eq!(store.latest_event_id("s1").unwrap().as_deref(), Some("e2"));
    }

    #[test]
    fn test_schema_mismatch_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("repairs.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute("CREATE TABLE repairs_events (event_id TEXT PRIMARY KEY)", [])
                .unwrap();
        }
        let err = EventStore::open_at(&path, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, MendError::SchemaMismatch(_)));
    }

    #[test]
    fn test_health_probe() {
        let dir = tempdir().unwrap();
        let store = open_tmp(dir.path());
        store.health().unwrap();
    }
}
