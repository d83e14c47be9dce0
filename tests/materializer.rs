//! Materializer and revert semantics over the event-sourced backend.

use logmend::core::engine::{RepairOperation, RepairOperationKind};
use logmend::core::event_backend::{EventBackend, RevertOutcome};
use logmend::core::event_store::{EventStore, RepairEvent};
use logmend::core::logfile::LogFile;
use logmend::core::materialize::{Materializer, ViewCache};
use logmend::core::time;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

const SOURCE: &str = concat!(
    r#"{"kind":"user","uuid":"r1","session_id":"s"}"#,
    "\n",
    r#"{"kind":"user","uuid":"r2","parent_uuid":"r1","session_id":"s"}"#,
    "\n",
    r#"{"kind":"user","uuid":"r3","parent_uuid":"X","session_id":"s"}"#,
    "\n",
);

fn relink(child: &str, new_parent: &str) -> RepairOperation {
    RepairOperation {
        event_id: time::new_event_id(),
        operator: "user".to_string(),
        timestamp: chrono::Utc::now(),
        reason: "reattach orphan".to_string(),
        kind: RepairOperationKind::Relink {
            child_uuid: child.to_string(),
            old_parent: Some("X".to_string()),
            new_parent: Some(new_parent.to_string()),
            similarity_score: Some(0.82),
        },
    }
}

struct Rig {
    _dir: tempfile::TempDir,
    backend: EventBackend,
    materializer: Materializer,
    log: LogFile,
}

fn rig() -> Rig {
    let dir = tempdir().unwrap();
    let log_path = dir.path().join("log.jsonl");
    fs::write(&log_path, SOURCE).unwrap();
    let store = Arc::new(
        EventStore::open_at(&dir.path().join("repairs.db"), Duration::from_secs(5)).unwrap(),
    );
    let cache = Arc::new(ViewCache::new());
    let backend = EventBackend::new(store.clone(), cache.clone());
    let materializer = Materializer::new(store, log_path.clone(), cache, Duration::from_secs(300));
    let log = LogFile::load(&log_path).unwrap();
    Rig {
        _dir: dir,
        backend,
        materializer,
        log,
    }
}

#[test]
fn test_relink_then_revert_round_trip() {
    let mut r = rig();
    use logmend::core::persist::PersistenceBackend;

    // apply: materialization shows the new parent, the file keeps the old
    r.backend.apply_repair(&mut r.log, &relink("r3", "r1")).unwrap();
    let view = r.materializer.materialize("s").unwrap();
    assert_eq!(view.log.record("r3").unwrap().parent_uuid.as_deref(), Some("r1"));
    assert!(fs::read_to_string(Path::new(&r.log.path)).unwrap().contains(r#""parent_uuid":"X""#));

    // revert: orphan again under replay
    let target = r.backend.store().latest_event_id("s").unwrap().unwrap();
    match r.backend.revert_event(&target).unwrap() {
        RevertOutcome::Reverted(_) => {}
        RevertOutcome::AlreadyReverted => panic!("first revert cannot be a no-op"),
    }
    let view = r.materializer.materialize("s").unwrap();
    assert_eq!(view.log.record("r3").unwrap().parent_uuid.as_deref(), Some("X"));

    // the stream holds both events; the original reads as reverted
    assert_eq!(view.events.len(), 2);
    assert!(view.events[0].is_reverted);
    assert_eq!(view.events[1].operator, "system-revert");

    // applying the revert twice is a no-op
    assert!(matches!(
        r.backend.revert_event(&target).unwrap(),
        RevertOutcome::AlreadyReverted
    ));
    assert_eq!(
        r.backend.store().query_for_session("s", None).unwrap().len(),
        2
    );
}

#[test]
fn test_append_invalidates_cached_view() {
    let mut r = rig();
    use logmend::core::persist::PersistenceBackend;

    let before = r.materializer.materialize("s").unwrap();
    assert_eq!(before.log.record("r3").unwrap().parent_uuid.as_deref(), Some("X"));

    // the backend shares the cache, so its append invalidates the session
    r.backend.apply_repair(&mut r.log, &relink("r3", "r2")).unwrap();
    let after = r.materializer.materialize("s").unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(after.log.record("r3").unwrap().parent_uuid.as_deref(), Some("r2"));
}

#[test]
fn test_materialized_view_is_full_replay_after_reopen() {
    let dir = tempdir().unwrap();
    let log_path = dir.path().join("log.jsonl");
    fs::write(&log_path, SOURCE).unwrap();
    let db_path = dir.path().join("repairs.db");

    {
        let store = Arc::new(EventStore::open_at(&db_path, Duration::from_secs(5)).unwrap());
        let event = RepairEvent::from_operation("s", &relink("r3", "r1")).unwrap();
        store.append(&event).unwrap();
    }

    // a fresh process sees the same view
    let store = Arc::new(EventStore::open_at(&db_path, Duration::from_secs(5)).unwrap());
    let materializer = Materializer::new(
        store,
        log_path,
        Arc::new(ViewCache::new()),
        Duration::from_secs(300),
    );
    let view = materializer.materialize("s").unwrap();
    assert_eq!(view.log.record("r3").unwrap().parent_uuid.as_deref(), Some("r1"));
}
