//! Backend B: event-sourced persistence.
//!
//! Applying a repair appends a [`RepairEvent`] to the append-only store;
//! the log file on disk is never modified. The event log *is* the backup:
//! `create_backup` captures the latest event id, and rolling back to it
//! appends revert events for everything newer, in reverse order. Original
//! data is never altered.

use crate::core::config::BackendChoice;
use crate::core::engine::RepairOperation;
use crate::core::error::MendError;
use crate::core::event_store::{EventStore, RepairEvent};
use crate::core::logfile::LogFile;
use crate::core::materialize::ViewCache;
use crate::core::persist::{
    MAX_UNDO_POINTS, PersistenceBackend, UndoPoint, session_of_operation,
};
use std::sync::Arc;

/// Synthetic backup id for "before any event existed".
pub const GENESIS_BACKUP_ID: &str = "genesis";

/// Outcome of reverting one event.
#[derive(Debug, Clone)]
pub enum RevertOutcome {
    /// The revert event that was appended.
    Reverted(RepairEvent),
    /// The target was already reverted; nothing was appended.
    AlreadyReverted,
}

/// The event-sourced backend. Shares the view cache with the materializer
/// so every successful append invalidates the session's cached view.
pub struct EventBackend {
    store: Arc<EventStore>,
    cache: Arc<ViewCache>,
}

impl EventBackend {
    pub fn new(store: Arc<EventStore>, cache: Arc<ViewCache>) -> Self {
        Self { store, cache }
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    fn session_of(log: &LogFile) -> String {
        log.primary_session()
            .unwrap_or_else(|| "unsessioned".to_string())
    }

    /// Revert a single event by id. Reverting an already-reverted event is
    /// a reported no-op; reverting a revert event is refused.
    pub fn revert_event(&self, event_id: &str) -> Result<RevertOutcome, MendError> {
        let Some(target) = self.store.event(event_id)? else {
            return Err(MendError::NotFound(format!("event {}", event_id)));
        };
        if target.is_revert() {
            return Err(MendError::InvariantViolation(format!(
                "event {} is itself a revert",
                event_id
            )));
        }
        let resolved = self.store.query_for_session_resolved(&target.session_id)?;
        let already = resolved
            .iter()
            .any(|e| e.event_id == target.event_id && e.is_reverted);
        if already {
            return Ok(RevertOutcome::AlreadyReverted);
        }
        let stored = self.store.append(&RepairEvent::revert_of(&target))?;
        self.cache.invalidate(&target.session_id);
        Ok(RevertOutcome::Reverted(stored))
    }
}

impl PersistenceBackend for EventBackend {
    /// Conceptually a no-op: the event log is the backup. The marker is
    /// the latest event id at capture time.
    fn create_backup(&self, log: &LogFile) -> Result<String, MendError> {
        let session = Self::session_of(log);
        Ok(self
            .store
            .latest_event_id(&session)?
            .unwrap_or_else(|| GENESIS_BACKUP_ID.to_string()))
    }

    fn apply_repair(&self, log: &mut LogFile, op: &RepairOperation) -> Result<bool, MendError> {
        let session = session_of_operation(log, op);
        let event = RepairEvent::from_operation(&session, op)?;
        self.store.append(&event)?;
        self.cache.invalidate(&session);
        Ok(true)
    }

    /// Roll back to the state as of `backup_id` by appending a revert for
    /// every newer non-reverted event, newest first.
    fn rollback_to_backup(&self, log: &mut LogFile, backup_id: &str) -> Result<bool, MendError> {
        let session = Self::session_of(log);
        let events = self.store.query_for_session_resolved(&session)?;

        let cut = if backup_id == GENESIS_BACKUP_ID {
            0
        } else {
            match events.iter().position(|e| e.event_id == backup_id) {
                Some(i) => i + 1,
                None => return Ok(false),
            }
        };

        for event in events[cut..].iter().rev() {
            if event.is_revert() || event.is_reverted {
                continue;
            }
            self.store.append(&RepairEvent::revert_of(event))?;
        }
        self.cache.invalidate(&session);
        Ok(true)
    }

    /// The undo history is the event stream itself, filtered to events
    /// still in effect, newest first.
    fn undo_history(&self, log: &LogFile) -> Result<Vec<UndoPoint>, MendError> {
        let session = Self::session_of(log);
        let events = self.store.query_for_session_resolved(&session)?;
        let mut points: Vec<UndoPoint> = events
            .iter()
            .rev()
            .filter(|e| !e.is_revert() && !e.is_reverted)
            .map(|e| UndoPoint {
                id: e.event_id.clone(),
                timestamp: e.timestamp.clone(),
                label: format!("{} {} ({})", e.operation_kind, e.record_uuid, e.operator),
            })
            .collect();
        points.truncate(MAX_UNDO_POINTS);
        Ok(points)
    }

    fn backend_name(&self) -> BackendChoice {
        BackendChoice::EventSourced
    }
}
