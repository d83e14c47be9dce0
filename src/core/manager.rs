//! Repair manager: the façade the external navigator drives.
//!
//! State machine:
//!
//! ```text
//! Idle ──load(log)──▶ Loaded ──scan──▶ Scanned
//! Scanned ──preview(selection)──▶ Previewing
//! Previewing ──confirm──▶ Applying ──▶ Applied | Scanned (partial report)
//! Previewing ──cancel──▶ Scanned
//! Applied ──undo(target)──▶ Applying (revert path) ──▶ Applied
//! ```
//!
//! `preview` composes the engine's operation list with a diff against the
//! current materialized view and never touches persistence. `confirm` is
//! the only transition that writes: backup first, then each operation in
//! order, halting on the first failure with a report of what succeeded.
//!
//! Configuration and the audit sink are constructor inputs; nothing here
//! reads ambient state. Within one session applies are serialized by a
//! per-session lock; different sessions may apply in parallel.

use crate::core::audit::{AuditLog, ManagerEvent};
use crate::core::config::{BackendChoice, Config};
use crate::core::engine::{self, RepairOperation, RepairPolicy, SkippedDefect, StaleDefect};
use crate::core::error::MendError;
use crate::core::event_backend::{EventBackend, RevertOutcome};
use crate::core::event_store::EventStore;
use crate::core::file_backend::FileBackend;
use crate::core::logfile::LogFile;
use crate::core::materialize::{Materializer, ViewCache};
use crate::core::persist::PersistenceBackend;
use crate::core::scanner::{self, Defect, DefectReport};
use crate::core::suggest::ParentSuggester;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Idle,
    Loaded,
    Scanned,
    Previewing,
    Applying,
    Applied,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ManagerState::Idle => "idle",
            ManagerState::Loaded => "loaded",
            ManagerState::Scanned => "scanned",
            ManagerState::Previewing => "previewing",
            ManagerState::Applying => "applying",
            ManagerState::Applied => "applied",
        };
        write!(f, "{}", name)
    }
}

/// Which defects of the current report to act on.
#[derive(Debug, Clone)]
pub enum DefectSelection {
    All,
    /// Indexes into [`DefectReport::defects`].
    Indexes(Vec<usize>),
}

/// A planned batch plus its human-readable diff against the current view.
#[derive(Debug, Clone)]
pub struct PreviewReport {
    pub operations: Vec<RepairOperation>,
    pub stale: Vec<StaleDefect>,
    pub skipped: Vec<SkippedDefect>,
    pub diff: Vec<String>,
}

/// What `confirm` accomplished.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub backup_id: String,
    pub applied: Vec<RepairOperation>,
    /// The operation that halted the batch, with its failure message.
    pub failed: Option<(RepairOperation, String)>,
    pub stale: Vec<StaleDefect>,
    pub skipped: Vec<SkippedDefect>,
}

impl ApplyOutcome {
    pub fn fully_applied(&self) -> bool {
        self.failed.is_none()
    }
}

/// What `undo` accomplished.
#[derive(Debug, Clone)]
pub enum UndoOutcome {
    /// Backend B: a revert event was appended.
    Reverted { revert_event_id: String },
    /// Revert of an already-reverted event; nothing was written.
    AlreadyReverted,
    /// Backend A: the log was restored from the named backup.
    RolledBack { backup_id: String },
}

// Per-session apply locks, shared process-wide so two managers cannot
// overlap applies for the same session.
fn session_lock(session: &str) -> Result<Arc<Mutex<()>>, MendError> {
    static LOCKS: OnceLock<Mutex<HashMap<String, Arc<Mutex<()>>>>> = OnceLock::new();
    let mut map = LOCKS
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .map_err(|_| MendError::InvariantViolation("session lock map poisoned".to_string()))?;
    Ok(map.entry(session.to_string()).or_default().clone())
}

pub struct RepairManager {
    config: Config,
    backend: Box<dyn PersistenceBackend>,
    suggester: ParentSuggester,
    audit: AuditLog,
    /// Present only under the event-sourced backend.
    store: Option<Arc<EventStore>>,
    cache: Arc<ViewCache>,
    state: ManagerState,
    log: Option<LogFile>,
    report: Option<DefectReport>,
    preview: Option<PreviewReport>,
}

impl RepairManager {
    /// Build a manager for the configured backend. Opening an unreachable
    /// event store surfaces `StoreUnavailable`; switching the configuration
    /// to `file-atomic` is the documented local fallback.
    pub fn new(config: Config, audit: AuditLog) -> Result<RepairManager, MendError> {
        let cache = Arc::new(ViewCache::new());
        let (backend, store): (Box<dyn PersistenceBackend>, Option<Arc<EventStore>>) =
            match config.backend {
                BackendChoice::FileAtomic => (Box::new(FileBackend::new()), None),
                BackendChoice::EventSourced => {
                    let store = Arc::new(EventStore::open(&config)?);
                    (
                        Box::new(EventBackend::new(store.clone(), cache.clone())),
                        Some(store),
                    )
                }
            };
        let suggester = ParentSuggester::new(config.suggester.clone());
        Ok(RepairManager {
            config,
            backend,
            suggester,
            audit,
            store,
            cache,
            state: ManagerState::Idle,
            log: None,
            report: None,
            preview: None,
        })
    }

    /// Test seam: inject a fake backend behind an arbitrary configuration.
    pub fn with_backend(
        config: Config,
        backend: Box<dyn PersistenceBackend>,
        audit: AuditLog,
    ) -> RepairManager {
        let suggester = ParentSuggester::new(config.suggester.clone());
        RepairManager {
            config,
            backend,
            suggester,
            audit,
            store: None,
            cache: Arc::new(ViewCache::new()),
            state: ManagerState::Idle,
            log: None,
            report: None,
            preview: None,
        }
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn backend_name(&self) -> BackendChoice {
        self.backend.backend_name()
    }

    pub fn log(&self) -> Option<&LogFile> {
        self.log.as_ref()
    }

    pub fn report(&self) -> Option<&DefectReport> {
        self.report.as_ref()
    }

    pub fn preview_report(&self) -> Option<&PreviewReport> {
        self.preview.as_ref()
    }

    fn expect_state(&self, allowed: &[ManagerState], op: &str) -> Result<(), MendError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(MendError::InvariantViolation(format!(
                "{} is not valid in state {}",
                op, self.state
            )))
        }
    }

    fn working_session(&self) -> String {
        self.log
            .as_ref()
            .and_then(LogFile::primary_session)
            .unwrap_or_else(|| "unsessioned".to_string())
    }

    fn materializer_for(&self, path: &Path) -> Option<Materializer> {
        self.store.as_ref().map(|store| {
            Materializer::new(
                store.clone(),
                path.to_path_buf(),
                self.cache.clone(),
                std::time::Duration::from_secs(self.config.materializer.ttl_seconds),
            )
        })
    }

    /// Load a log. Parse errors are tolerated (they ride along in the scan
    /// report); a parent-chain cycle aborts the load for this session.
    /// Under the event-sourced backend the working view is the
    /// materialization of the file plus the session's prior events.
    pub fn load(&mut self, path: &Path) -> Result<&LogFile, MendError> {
        let file_log = LogFile::load(path)?;

        let working = match &self.store {
            None => file_log,
            Some(_) => {
                let session = file_log
                    .primary_session()
                    .unwrap_or_else(|| "unsessioned".to_string());
                let materializer = self
                    .materializer_for(path)
                    .expect("store implies materializer");
                materializer.invalidate(&session);
                let view = materializer.materialize(&session)?;
                view.log.clone()
            }
        };

        let dag = crate::core::dag::MessageDag::build(working.records());
        if let Some(cycle) = dag.cycles().first() {
            self.state = ManagerState::Idle;
            self.log = None;
            return Err(MendError::StructuralError {
                cycle: cycle.clone(),
            });
        }

        self.log = Some(working);
        self.report = None;
        self.preview = None;
        self.state = ManagerState::Loaded;
        Ok(self.log.as_ref().expect("just loaded"))
    }

    /// Scan the working view.
    pub fn scan(&mut self) -> Result<&DefectReport, MendError> {
        self.expect_state(
            &[
                ManagerState::Loaded,
                ManagerState::Scanned,
                ManagerState::Applied,
            ],
            "scan",
        )?;
        let log = self.log.as_ref().expect("loaded state implies log");
        let report = scanner::scan(log, &self.config.scanner);
        self.report = Some(report);
        self.preview = None;
        self.state = ManagerState::Scanned;
        Ok(self.report.as_ref().expect("just scanned"))
    }

    fn selected_defects(&self, selection: &DefectSelection) -> Result<Vec<Defect>, MendError> {
        let report = self
            .report
            .as_ref()
            .ok_or_else(|| MendError::InvariantViolation("no scan report".to_string()))?;
        match selection {
            DefectSelection::All => Ok(report.defects.clone()),
            DefectSelection::Indexes(idxs) => idxs
                .iter()
                .map(|i| {
                    report
                        .defects
                        .get(*i)
                        .cloned()
                        .ok_or_else(|| MendError::NotFound(format!("defect index {}", i)))
                })
                .collect(),
        }
    }

    /// Plan the selection and describe the resulting edits against the
    /// current view. Free to cancel; nothing is written.
    pub fn preview(
        &mut self,
        selection: &DefectSelection,
        policy: &RepairPolicy,
        operator: &str,
    ) -> Result<&PreviewReport, MendError> {
        self.expect_state(&[ManagerState::Scanned, ManagerState::Previewing], "preview")?;
        let defects = self.selected_defects(selection)?;
        let log = self.log.as_ref().expect("scanned state implies log");
        let plan = engine::plan(log, &defects, policy, &self.suggester, operator);

        let diff = plan
            .operations
            .iter()
            .map(|op| describe_operation(log, op))
            .collect();
        self.preview = Some(PreviewReport {
            operations: plan.operations,
            stale: plan.stale,
            skipped: plan.skipped,
            diff,
        });
        self.state = ManagerState::Previewing;
        Ok(self.preview.as_ref().expect("just previewed"))
    }

    /// Abandon the preview. Free between preview and confirm.
    pub fn cancel(&mut self) -> Result<(), MendError> {
        self.expect_state(&[ManagerState::Previewing], "cancel")?;
        self.preview = None;
        self.state = ManagerState::Scanned;
        Ok(())
    }

    /// Apply the previewed operations: backup, then each operation in
    /// order under the session lock. Halts on the first failure and
    /// reports which operations succeeded.
    pub fn confirm(&mut self) -> Result<ApplyOutcome, MendError> {
        self.expect_state(&[ManagerState::Previewing], "confirm")?;
        let preview = self.preview.take().expect("previewing state implies plan");
        let session = self.working_session();
        let operator = preview
            .operations
            .first()
            .map(|op| op.operator.clone())
            .unwrap_or_else(|| "user".to_string());

        self.state = ManagerState::Applying;
        let lock = session_lock(&session)?;
        let _guard = lock
            .lock()
            .map_err(|_| MendError::InvariantViolation("session lock poisoned".to_string()))?;

        let log = self.log.as_mut().expect("previewing state implies log");
        let backup_id = match self.backend.create_backup(log) {
            Ok(id) => id,
            Err(e) => {
                self.state = ManagerState::Scanned;
                return Err(e);
            }
        };

        let mut outcome = ApplyOutcome {
            backup_id,
            applied: Vec::new(),
            failed: None,
            stale: preview.stale,
            skipped: preview.skipped,
        };
        for op in preview.operations {
            match self.backend.apply_repair(log, &op) {
                Ok(true) => outcome.applied.push(op),
                Ok(false) => {
                    outcome.failed = Some((op, "subject record no longer present".to_string()));
                    break;
                }
                Err(e) => {
                    let message = e.to_string();
                    outcome.failed = Some((op, message));
                    break;
                }
            }
        }

        self.state = if outcome.fully_applied() {
            ManagerState::Applied
        } else {
            ManagerState::Scanned
        };

        let mut audit_event = ManagerEvent::new(
            "manager.confirm",
            &operator,
            &log.path.display().to_string(),
            &self.backend.backend_name().to_string(),
        );
        audit_event.session_id = Some(session.clone());
        audit_event.status = if outcome.fully_applied() {
            "success"
        } else {
            "error"
        }
        .to_string();
        audit_event.detail = serde_json::json!({
            "backup_id": outcome.backup_id,
            "applied": outcome.applied.len(),
            "stale": outcome.stale.len(),
            "skipped": outcome.skipped.len(),
            "failed": outcome.failed.as_ref().map(|(_, msg)| msg.clone()),
        });
        self.audit.append(&audit_event)?;

        // under the event backend the working view is stale now; refresh
        if let Some(materializer) = self
            .log
            .as_ref()
            .map(|l| l.path.clone())
            .and_then(|p| self.materializer_for(&p))
        {
            let view = materializer.materialize(&session)?;
            self.log = Some(view.log.clone());
        }

        Ok(outcome)
    }

    /// Revert path. Under the event-sourced backend `target` is an event
    /// id; under the file-atomic backend it is a backup id.
    pub fn undo(&mut self, target: &str) -> Result<UndoOutcome, MendError> {
        self.expect_state(&[ManagerState::Applied, ManagerState::Scanned], "undo")?;
        let session = self.working_session();
        self.state = ManagerState::Applying;
        let lock = session_lock(&session)?;
        let _guard = lock
            .lock()
            .map_err(|_| MendError::InvariantViolation("session lock poisoned".to_string()))?;

        let outcome = match (&self.store, self.backend.backend_name()) {
            (Some(store), BackendChoice::EventSourced) => {
                let event_backend = EventBackend::new(store.clone(), self.cache.clone());
                match event_backend.revert_event(target) {
                    Ok(RevertOutcome::Reverted(ev)) => UndoOutcome::Reverted {
                        revert_event_id: ev.event_id,
                    },
                    Ok(RevertOutcome::AlreadyReverted) => UndoOutcome::AlreadyReverted,
                    Err(e) => {
                        self.state = ManagerState::Applied;
                        return Err(e);
                    }
                }
            }
            _ => {
                let log = self.log.as_mut().expect("loaded state implies log");
                match self.backend.rollback_to_backup(log, target) {
                    Ok(true) => UndoOutcome::RolledBack {
                        backup_id: target.to_string(),
                    },
                    Ok(false) => {
                        self.state = ManagerState::Applied;
                        return Err(MendError::NotFound(format!("backup {}", target)));
                    }
                    Err(e) => {
                        self.state = ManagerState::Applied;
                        return Err(e);
                    }
                }
            }
        };

        let log_path = self
            .log
            .as_ref()
            .map(|l| l.path.display().to_string())
            .unwrap_or_default();
        let mut audit_event = ManagerEvent::new(
            "manager.undo",
            "system-revert",
            &log_path,
            &self.backend.backend_name().to_string(),
        );
        audit_event.session_id = Some(session.clone());
        audit_event.detail = serde_json::json!({ "target": target });
        self.audit.append(&audit_event)?;

        // refresh the working view after a revert
        if let Some(path) = self.log.as_ref().map(|l| l.path.clone())
            && let Some(materializer) = self.materializer_for(&path)
        {
            let view = materializer.materialize(&session)?;
            self.log = Some(view.log.clone());
        }
        self.report = None;
        self.preview = None;
        self.state = ManagerState::Applied;
        Ok(outcome)
    }

    /// Undo points for the loaded log, newest first.
    pub fn undo_history(&self) -> Result<Vec<crate::core::persist::UndoPoint>, MendError> {
        let log = self
            .log
            .as_ref()
            .ok_or_else(|| MendError::InvariantViolation("no log loaded".to_string()))?;
        self.backend.undo_history(log)
    }
}

fn describe_operation(log: &LogFile, op: &RepairOperation) -> String {
    use crate::core::engine::RepairOperationKind::*;
    match &op.kind {
        Relink {
            child_uuid,
            new_parent,
            similarity_score,
            ..
        } => {
            let current = log
                .record(child_uuid)
                .and_then(|r| r.parent_uuid.clone())
                .unwrap_or_else(|| "none".to_string());
            match new_parent {
                Some(p) => format!(
                    "relink {}: parent {} -> {}{}",
                    child_uuid,
                    current,
                    p,
                    similarity_score
                        .map(|s| format!(" (score {:.2})", s))
                        .unwrap_or_default()
                ),
                None => format!("detach {}: parent {} -> none", child_uuid, current),
            }
        }
        InsertSyntheticResult {
            before_uuid,
            tool_use_id,
            synthesize,
            ..
        } => match synthesize {
            Some(spec) => format!(
                "synthesize user record {} answering {} with a cancelled result for {}",
                spec.uuid, spec.parent_uuid, tool_use_id
            ),
            None => format!(
                "insert cancelled result for {} at the front of {}",
                tool_use_id, before_uuid
            ),
        },
        Drop {
            record_uuid,
            block_index,
            tool_use_id,
            allow_malformed,
        } => format!(
            "drop {}duplicate result for {} at {}[{}]",
            if *allow_malformed { "malformed " } else { "" },
            tool_use_id,
            record_uuid,
            block_index
        ),
    }
}
