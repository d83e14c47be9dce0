//! Materializer: replay repair events onto the original log.
//!
//! Under the event-sourced backend the log file on disk never changes.
//! Reads go through `materialize(session_id)`, which loads the source log,
//! replays the session's events in timestamp order, and yields a view
//! identical to what the file-atomic backend would have produced for the
//! same operation sequence. Revert events cancel their target during
//! replay; stored rows are never touched.
//!
//! Views are cached per session behind a read-write guard with a bounded
//! TTL (default five minutes). Any successful append for a session
//! invalidates its entry; readers always see a whole view, never a partial
//! one.

use crate::core::error::MendError;
use crate::core::event_store::{EventStore, RepairEvent};
use crate::core::logfile::LogFile;
use crate::core::persist;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Bound on cached sessions; beyond it the entry closest to expiry is
/// evicted first.
const CACHE_CAPACITY: usize = 64;

/// A consistent, fully-replayed view of one session.
#[derive(Debug, Clone)]
pub struct MaterializedLog {
    pub session_id: String,
    /// The replayed in-memory log.
    pub log: LogFile,
    /// The session's event stream with virtual revert flags.
    pub events: Vec<RepairEvent>,
}

impl MaterializedLog {
    /// Render the view as log text, record-for-record comparable with a
    /// file the file-atomic backend produced.
    pub fn render(&self) -> String {
        self.log.render()
    }
}

#[derive(Clone)]
struct CacheEntry {
    view: Arc<MaterializedLog>,
    expires_at: Instant,
}

/// Process-local bounded TTL cache of materialized views, shared between
/// the materializer (reads) and the event backend (append invalidation).
pub struct ViewCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl ViewCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<MaterializedLog>> {
        let entries = self.entries.read().ok()?;
        let entry = entries.get(session_id)?;
        if entry.expires_at > Instant::now() {
            Some(entry.view.clone())
        } else {
            None
        }
    }

    pub fn put(&self, session_id: &str, view: Arc<MaterializedLog>, ttl: Duration) {
        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        let now = Instant::now();
        entries.retain(|_, e| e.expires_at > now);
        if entries.len() >= CACHE_CAPACITY {
            let soonest = entries
                .iter()
                .min_by_key(|(_, e)| e.expires_at)
                .map(|(k, _)| k.clone());
            if let Some(key) = soonest {
                entries.remove(&key);
            }
        }
        entries.insert(
            session_id.to_string(),
            CacheEntry {
                view,
                expires_at: now + ttl,
            },
        );
    }

    pub fn invalidate(&self, session_id: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(session_id);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }
}

impl Default for ViewCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Replays event streams over a source log into per-session views.
pub struct Materializer {
    store: Arc<EventStore>,
    source_path: PathBuf,
    cache: Arc<ViewCache>,
    ttl: Duration,
}

impl Materializer {
    pub fn new(
        store: Arc<EventStore>,
        source_path: PathBuf,
        cache: Arc<ViewCache>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            source_path,
            cache,
            ttl,
        }
    }

    /// The current view for `session_id`: cached if fresh, otherwise
    /// original log + event replay.
    pub fn materialize(&self, session_id: &str) -> Result<Arc<MaterializedLog>, MendError> {
        if let Some(view) = self.cache.get(session_id) {
            return Ok(view);
        }
        let view = Arc::new(self.rebuild(session_id)?);
        self.cache.put(session_id, view.clone(), self.ttl);
        Ok(view)
    }

    /// Explicit invalidation; the next materialize replays from scratch.
    pub fn invalidate(&self, session_id: &str) {
        self.cache.invalidate(session_id);
    }

    fn rebuild(&self, session_id: &str) -> Result<MaterializedLog, MendError> {
        let mut log = LogFile::load(&self.source_path)?;
        let events = self.store.query_for_session_resolved(session_id)?;
        for event in &events {
            if event.is_reverted || event.is_revert() {
                continue;
            }
            if let Some(kind) = event.operation()? {
                // verification inside apply makes replay tolerant of
                // operations whose subject vanished upstream
                persist::apply_operation(&mut log, &kind);
            }
        }
        Ok(MaterializedLog {
            session_id: session_id.to_string(),
            log,
            events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::{RepairOperation, RepairOperationKind};
    use crate::core::time;
    use std::fs;
    use tempfile::tempdir;

    const SOURCE: &str = concat!(
        r#"{"kind":"user","uuid":"A","session_id":"s"}"#,
        "\n",
        r#"{"kind":"user","uuid":"B","parent_uuid":"A","session_id":"s"}"#,
        "\n",
        r#"{"kind":"user","uuid":"C","parent_uuid":"X","session_id":"s"}"#,
        "\n",
    );

    fn relink_op(child: &str, new_parent: &str) -> RepairOperation {
        RepairOperation {
            event_id: time::new_event_id(),
            operator: "user".to_string(),
            timestamp: chrono::Utc::now(),
            reason: "test".to_string(),
            kind: RepairOperationKind::Relink {
                child_uuid: child.to_string(),
                old_parent: Some("X".to_string()),
                new_parent: Some(new_parent.to_string()),
                similarity_score: Some(0.82),
            },
        }
    }

    fn setup() -> (tempfile::TempDir, Arc<EventStore>, Materializer) {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("log.jsonl");
        fs::write(&log_path, SOURCE).unwrap();
        let store = Arc::new(
            EventStore::open_at(&dir.path().join("repairs.db"), Duration::from_secs(5)).unwrap(),
        );
        let mat = Materializer::new(
            store.clone(),
            log_path,
            Arc::new(ViewCache::new()),
            Duration::from_secs(300),
        );
        (dir, store, mat)
    }

    #[test]
    fn test_materialize_replays_events() {
        let (_dir, store, mat) = setup();
        let event = RepairEvent::from_operation("s", &relink_op("C", "A")).unwrap();
        store.append(&event).unwrap();
        mat.invalidate("s");

        let view = mat.materialize("s").unwrap();
        assert_eq!(
            view.log.record("C").unwrap().parent_uuid.as_deref(),
            Some("A")
        );
        // the file on disk is untouched
        assert_eq!(fs::read_to_string(&mat.source_path).unwrap(), SOURCE);
    }

    #[test]
    fn test_revert_cancels_target_in_replay() {
        let (_dir, store, mat) = setup();
        let stored = store
            .append(&RepairEvent::from_operation("s", &relink_op("C", "A")).unwrap())
            .unwrap();
        store.append(&RepairEvent::revert_of(&stored)).unwrap();

        let view = mat.materialize("s").unwrap();
        // orphan again: the relink is virtually absent
        assert_eq!(
            view.log.record("C").unwrap().parent_uuid.as_deref(),
            Some("X")
        );
        assert_eq!(view.events.len(), 2);
        assert!(view.events[0].is_reverted);
    }

    #[test]
    fn test_cache_serves_same_view_until_invalidated() {
        let (_dir, store, mat) = setup();
        let first = mat.materialize("s").unwrap();
        let again = mat.materialize("s").unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        let event = RepairEvent::from_operation("s", &relink_op("C", "B")).unwrap();
        store.append(&event).unwrap();
        // without invalidation the stale view is still served
        let stale = mat.materialize("s").unwrap();
        assert!(Arc::ptr_eq(&first, &stale));

        mat.invalidate("s");
        let fresh = mat.materialize("s").unwrap();
        assert!(!Arc::ptr_eq(&first, &fresh));
        assert_eq!(
            fresh.log.record("C").unwrap().parent_uuid.as_deref(),
            Some("B")
        );
    }

    #[test]
    fn test_ttl_expiry_evicts() {
        let cache = ViewCache::new();
        let view = Arc::new(MaterializedLog {
            session_id: "s".to_string(),
            log: LogFile::parse(PathBuf::from("x"), ""),
            events: Vec::new(),
        });
        cache.put("s", view, Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("s").is_none());
    }
}
