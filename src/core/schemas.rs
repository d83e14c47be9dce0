// src/core/schemas.rs
// Centralized database schema definitions for the repair event store.

// --- Repair events ---
pub const REPAIRS_DB_SCHEMA_VERSION: u32 = 1;

pub const REPAIRS_DB_SCHEMA_META: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
";

pub const REPAIRS_DB_SCHEMA_EVENTS: &str = "
    CREATE TABLE IF NOT EXISTS repairs_events (
        event_id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        record_uuid TEXT NOT NULL,
        operation_kind TEXT NOT NULL,
        old_parent TEXT,
        new_parent TEXT,
        payload TEXT NOT NULL,
        operator TEXT NOT NULL,
        reason TEXT NOT NULL DEFAULT '',
        ts TEXT NOT NULL,
        similarity_score REAL,
        is_reverted INTEGER NOT NULL DEFAULT 0,
        CHECK (similarity_score IS NULL OR (similarity_score >= 0.0 AND similarity_score <= 1.0))
    )
";

// Relation tables for fast reverse queries.
pub const REPAIRS_DB_SCHEMA_SESSION_LINKS: &str = "
    CREATE TABLE IF NOT EXISTS event_session_links (
        event_id TEXT NOT NULL,
        session_id TEXT NOT NULL,
        PRIMARY KEY (event_id, session_id),
        FOREIGN KEY(event_id) REFERENCES repairs_events(event_id)
    )
";
pub const REPAIRS_DB_SCHEMA_RECORD_LINKS: &str = "
    CREATE TABLE IF NOT EXISTS event_record_links (
        event_id TEXT NOT NULL,
        record_uuid TEXT NOT NULL,
        PRIMARY KEY (event_id, record_uuid),
        FOREIGN KEY(event_id) REFERENCES repairs_events(event_id)
    )
";

pub const REPAIRS_DB_INDEX_SESSION_TS: &str =
    "CREATE INDEX IF NOT EXISTS idx_events_session_ts ON repairs_events(session_id, ts)";
pub const REPAIRS_DB_INDEX_RECORD: &str =
    "CREATE INDEX IF NOT EXISTS idx_events_record ON repairs_events(record_uuid)";

// Append-only hardening: the row lifecycle is INSERT-only. `is_reverted` is
// flipped virtually at replay time, never in the database.
pub const REPAIRS_DB_TRIGGER_NO_UPDATE: &str = "
    CREATE TRIGGER IF NOT EXISTS repairs_events_no_update
    BEFORE UPDATE ON repairs_events
    BEGIN
        SELECT RAISE(ABORT, 'repairs_events is append-only');
    END
";
pub const REPAIRS_DB_TRIGGER_NO_DELETE: &str = "
    CREATE TRIGGER IF NOT EXISTS repairs_events_no_delete
    BEFORE DELETE ON repairs_events
    BEGIN
        SELECT RAISE(ABORT, 'repairs_events is append-only');
    END
";

/// Columns every compatible `repairs_events` table must carry, used by the
/// schema probe on connect.
pub const REPAIRS_EVENTS_REQUIRED_COLUMNS: &[&str] = &[
    "event_id",
    "session_id",
    "record_uuid",
    "operation_kind",
    "old_parent",
    "new_parent",
    "payload",
    "operator",
    "reason",
    "ts",
    "similarity_score",
    "is_reverted",
];
