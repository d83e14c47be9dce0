//! Shared timestamp and identifier helpers for deterministic envelopes.

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

/// Parse an ISO-8601 / RFC 3339 timestamp into UTC.
///
/// Returns `None` for anything that does not parse; callers treat a record
/// with an unreadable timestamp as having no timestamp rather than failing
/// the whole line.
pub fn parse_iso(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Format a UTC timestamp as RFC 3339 with millisecond precision and a `Z`
/// suffix (e.g. `2026-08-01T09:30:00.000Z`). Millisecond precision is what
/// the event store's per-session monotonicity bump operates on.
pub fn format_iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current UTC time, formatted as by [`format_iso`].
pub fn now_iso() -> String {
    format_iso(Utc::now())
}

/// Fresh client-generated event id (UUID v4).
pub fn new_event_id() -> String {
    Uuid::new_v4().to_string()
}

/// Deterministic uuid for a synthetic record derived from its anchor record.
///
/// Two scans of the same log must propose the same synthetic uuid, otherwise
/// operation lists stop being comparable across runs.
pub fn synthetic_uuid(anchor_uuid: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, anchor_uuid.as_bytes()).to_string()
}

/// Fresh backup id (ULID). ULIDs sort lexicographically by creation time,
/// which gives the undo history its newest-first ordering for free.
pub fn new_backup_id() -> String {
    ulid::Ulid::new().to_string()
}
