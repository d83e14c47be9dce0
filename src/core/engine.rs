//! Repair engine: turn a defect selection into an ordered operation list.
//!
//! The engine mutates nothing: it plans, and the persistence layer applies.
//! Operations verify their target before acting, which makes application
//! idempotent and commutative under the persistence contract: replaying an
//! operation whose effect is already present is a no-op.
//!
//! Ordering: orphans are resolved before duplicates before insertions,
//! because relinking may change parent chains that downstream validators
//! inspect. Within a group, ties break by older timestamp, then by
//! lexicographic uuid.

use crate::core::logfile::LogFile;
use crate::core::record::Block;
use crate::core::scanner::Defect;
use crate::core::suggest::ParentSuggester;
use crate::core::time;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::cmp::Reverse;

/// What to do with well-formed duplicate tool results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    KeepFirst,
    KeepLast,
    /// Keep the first well-formed occurrence and additionally drop
    /// malformed claimants of the same id. The only policy that touches
    /// invalid blocks.
    DropInvalid,
}

/// What to do with unanswered tool uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingPolicy {
    /// Insert a synthetic cancelled tool result.
    SynthCancel,
    Leave,
}

/// What to do with orphaned parent references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanPolicy {
    /// Relink to the suggester's best candidate, if any clears the floor.
    RelinkBest,
    /// Detach the subtree root (clear its parent reference). Records are
    /// never destroyed.
    DropSubtree,
    Leave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairPolicy {
    pub duplicates: DuplicatePolicy,
    pub missing: MissingPolicy,
    pub orphans: OrphanPolicy,
}

impl Default for RepairPolicy {
    fn default() -> Self {
        Self {
            duplicates: DuplicatePolicy::KeepFirst,
            missing: MissingPolicy::SynthCancel,
            orphans: OrphanPolicy::RelinkBest,
        }
    }
}

/// Specification of a synthetic user record to materialize before inserting
/// a tool result, used when the unanswered assistant record is the last of
/// its session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticUserSpec {
    pub uuid: String,
    pub parent_uuid: String,
    pub session_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// The minimal edit for one defect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RepairOperationKind {
    /// Point `child_uuid` at a new parent (`None` detaches it).
    Relink {
        child_uuid: String,
        old_parent: Option<String>,
        new_parent: Option<String>,
        similarity_score: Option<f64>,
    },
    /// Insert `payload` at the front of `before_uuid`'s content; when
    /// `synthesize` is set the record itself must be materialized first.
    InsertSyntheticResult {
        before_uuid: String,
        tool_use_id: String,
        payload: Value,
        synthesize: Option<SyntheticUserSpec>,
    },
    /// Drop the content block at `block_index` of `record_uuid`, verified
    /// to be a tool result for `tool_use_id` at apply time.
    /// `allow_malformed` widens the verification to malformed claimants;
    /// only the `drop_invalid` policy sets it.
    Drop {
        record_uuid: String,
        block_index: usize,
        tool_use_id: String,
        allow_malformed: bool,
    },
}

impl RepairOperationKind {
    pub fn kind_str(&self) -> &'static str {
        match self {
            RepairOperationKind::Relink { .. } => "relink",
            RepairOperationKind::InsertSyntheticResult { .. } => "insert_synthetic_result",
            RepairOperationKind::Drop { .. } => "drop",
        }
    }

    /// The record this operation is subject to.
    pub fn subject_uuid(&self) -> &str {
        match self {
            RepairOperationKind::Relink { child_uuid, .. } => child_uuid,
            RepairOperationKind::InsertSyntheticResult { before_uuid, .. } => before_uuid,
            RepairOperationKind::Drop { record_uuid, .. } => record_uuid,
        }
    }
}

/// One planned edit with its envelope. The envelope (`event_id`,
/// `timestamp`) is freshly generated per plan and excluded from semantic
/// comparison; determinism claims are about [`RepairOperationKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairOperation {
    pub event_id: String,
    pub operator: String,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    #[serde(flatten)]
    pub kind: RepairOperationKind,
}

/// A selected defect that no longer matches the log (concurrent edit).
/// Reported, never applied; does not abort the batch.
#[derive(Debug, Clone)]
pub struct StaleDefect {
    pub defect: Defect,
    pub detail: String,
}

/// A selected defect deliberately left alone (leave policy, suggestion
/// below floor, or already repaired).
#[derive(Debug, Clone)]
pub struct SkippedDefect {
    pub defect: Defect,
    pub reason: String,
}

/// The engine's product.
#[derive(Debug, Clone, Default)]
pub struct RepairPlan {
    pub operations: Vec<RepairOperation>,
    pub stale: Vec<StaleDefect>,
    pub skipped: Vec<SkippedDefect>,
}

impl RepairPlan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Plan repairs for a defect selection against the current log state.
///
/// Duplicate drop sets are recomputed from the live record rather than
/// trusted from the (possibly aged) report, so a plan is always consistent
/// with the log it will be applied to.
pub fn plan(
    log: &LogFile,
    selection: &[Defect],
    policy: &RepairPolicy,
    suggester: &ParentSuggester,
    operator: &str,
) -> RepairPlan {
    let mut plan = RepairPlan::default();
    let now = Utc::now();

    let mut relinks: Vec<RepairOperation> = Vec::new();
    let mut drops: Vec<RepairOperation> = Vec::new();
    let mut inserts: Vec<RepairOperation> = Vec::new();

    for defect in selection {
        match defect {
            Defect::OrphanParent {
                child_uuid,
                old_parent_uuid,
            } => plan_orphan(
                log, defect, child_uuid, old_parent_uuid, policy, suggester, operator, now,
                &mut relinks, &mut plan,
            ),
            Defect::DuplicateToolResult {
                user_uuid,
                tool_use_id,
                ..
            } => plan_duplicate(
                log, defect, user_uuid, tool_use_id, policy, operator, now, &mut drops, &mut plan,
            ),
            Defect::MissingToolResult {
                assistant_uuid,
                tool_use_id,
                target_user_uuid,
                synthetic_user_uuid,
            } => plan_missing(
                log,
                defect,
                assistant_uuid,
                tool_use_id,
                target_user_uuid.as_deref(),
                synthetic_user_uuid.as_deref(),
                policy,
                operator,
                now,
                &mut inserts,
                &mut plan,
            ),
        }
    }

    let ts_of = |uuid: &str| log.record(uuid).and_then(|r| r.timestamp);
    relinks.sort_by_key(|op| (ts_of(op.kind.subject_uuid()), op.kind.subject_uuid().to_string()));
    drops.sort_by_key(|op| {
        let idx = match &op.kind {
            RepairOperationKind::Drop { block_index, .. } => *block_index,
            _ => 0,
        };
        (
            ts_of(op.kind.subject_uuid()),
            op.kind.subject_uuid().to_string(),
            Reverse(idx),
        )
    });
    inserts.sort_by_key(|op| {
        let id = match &op.kind {
            RepairOperationKind::InsertSyntheticResult { tool_use_id, .. } => tool_use_id.clone(),
            _ => String::new(),
        };
        (
            ts_of(op.kind.subject_uuid()),
            op.kind.subject_uuid().to_string(),
            id,
        )
    });

    plan.operations.extend(relinks);
    plan.operations.extend(drops);
    plan.operations.extend(inserts);
    plan
}

#[allow(clippy::too_many_arguments)]
fn plan_orphan(
    log: &LogFile,
    defect: &Defect,
    child_uuid: &str,
    old_parent_uuid: &str,
    policy: &RepairPolicy,
    suggester: &ParentSuggester,
    operator: &str,
    now: DateTime<Utc>,
    relinks: &mut Vec<RepairOperation>,
    plan: &mut RepairPlan,
) {
    let Some(child) = log.record(child_uuid) else {
        plan.stale.push(StaleDefect {
            defect: defect.clone(),
            detail: format!("record {} no longer present", child_uuid),
        });
        return;
    };
    match &child.parent_uuid {
        Some(p) if p == old_parent_uuid && !log.contains(p) => {}
        _ => {
            plan.skipped.push(SkippedDefect {
                defect: defect.clone(),
                reason: "already_repaired".to_string(),
            });
            return;
        }
    }
    match policy.orphans {
        OrphanPolicy::Leave => plan.skipped.push(SkippedDefect {
            defect: defect.clone(),
            reason: "policy=leave".to_string(),
        }),
        OrphanPolicy::DropSubtree => relinks.push(RepairOperation {
            event_id: time::new_event_id(),
            operator: operator.to_string(),
            timestamp: now,
            reason: format!("detach subtree rooted at {} (parent {} unresolved)", child_uuid, old_parent_uuid),
            kind: RepairOperationKind::Relink {
                child_uuid: child_uuid.to_string(),
                old_parent: Some(old_parent_uuid.to_string()),
                new_parent: None,
                similarity_score: None,
            },
        }),
        OrphanPolicy::RelinkBest => {
            let suggestion = suggester.suggest(log, child_uuid);
            match suggestion.candidates.first() {
                None => plan.skipped.push(SkippedDefect {
                    defect: defect.clone(),
                    reason: suggestion
                        .reason
                        .unwrap_or("below_threshold")
                        .to_string(),
                }),
                Some(best) => relinks.push(RepairOperation {
                    event_id: time::new_event_id(),
                    operator: operator.to_string(),
                    timestamp: now,
                    reason: format!(
                        "relink {} from {} to best candidate {} (score {:.2})",
                        child_uuid, old_parent_uuid, best.uuid, best.score
                    ),
                    kind: RepairOperationKind::Relink {
                        child_uuid: child_uuid.to_string(),
                        old_parent: Some(old_parent_uuid.to_string()),
                        new_parent: Some(best.uuid.clone()),
                        similarity_score: Some(best.score),
                    },
                }),
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn plan_duplicate(
    log: &LogFile,
    defect: &Defect,
    user_uuid: &str,
    tool_use_id: &str,
    policy: &RepairPolicy,
    operator: &str,
    now: DateTime<Utc>,
    drops: &mut Vec<RepairOperation>,
    plan: &mut RepairPlan,
) {
    let Some(rec) = log.record(user_uuid) else {
        plan.stale.push(StaleDefect {
            defect: defect.clone(),
            detail: format!("record {} no longer present", user_uuid),
        });
        return;
    };

    // live positions, not the report's: a prior edit may have shifted them
    let mut valid = Vec::new();
    let mut invalid = Vec::new();
    for (pos, block) in rec.blocks.iter().enumerate() {
        match block {
            Block::ToolResult { tool_use_id: id, .. } if id == tool_use_id => valid.push(pos),
            b @ Block::Opaque { raw } if b.claims_tool_result() => {
                if raw
                    .get("tool_use_id")
                    .and_then(Value::as_str)
                    .map(|s| s.trim() == tool_use_id)
                    .unwrap_or(false)
                {
                    invalid.push(pos);
                }
            }
            _ => {}
        }
    }
    if valid.len() < 2 {
        plan.skipped.push(SkippedDefect {
            defect: defect.clone(),
            reason: "already_repaired".to_string(),
        });
        return;
    }

    let keep = match policy.duplicates {
        DuplicatePolicy::KeepLast => *valid.last().expect("non-empty"),
        DuplicatePolicy::KeepFirst | DuplicatePolicy::DropInvalid => valid[0],
    };
    for pos in valid.iter().filter(|p| **p != keep) {
        drops.push(drop_op(user_uuid, *pos, tool_use_id, false, operator, now));
    }
    if policy.duplicates == DuplicatePolicy::DropInvalid {
        for pos in &invalid {
            drops.push(drop_op(user_uuid, *pos, tool_use_id, true, operator, now));
        }
    }
}

fn drop_op(
    record_uuid: &str,
    block_index: usize,
    tool_use_id: &str,
    allow_malformed: bool,
    operator: &str,
    now: DateTime<Utc>,
) -> RepairOperation {
    RepairOperation {
        event_id: time::new_event_id(),
        operator: operator.to_string(),
        timestamp: now,
        reason: format!(
            "drop {}duplicate result for {} at index {}",
            if allow_malformed { "malformed " } else { "" },
            tool_use_id,
            block_index
        ),
        kind: RepairOperationKind::Drop {
            record_uuid: record_uuid.to_string(),
            block_index,
            tool_use_id: tool_use_id.to_string(),
            allow_malformed,
        },
    }
}

#[allow(clippy::too_many_arguments)]
fn plan_missing(
    log: &LogFile,
    defect: &Defect,
    assistant_uuid: &str,
    tool_use_id: &str,
    target_user_uuid: Option<&str>,
    synthetic_user_uuid: Option<&str>,
    policy: &RepairPolicy,
    operator: &str,
    now: DateTime<Utc>,
    inserts: &mut Vec<RepairOperation>,
    plan: &mut RepairPlan,
) {
    if policy.missing == MissingPolicy::Leave {
        plan.skipped.push(SkippedDefect {
            defect: defect.clone(),
            reason: "policy=leave".to_string(),
        });
        return;
    }
    let Some(assistant) = log.record(assistant_uuid) else {
        plan.stale.push(StaleDefect {
            defect: defect.clone(),
            detail: format!("record {} no longer present", assistant_uuid),
        });
        return;
    };

    let (before_uuid, synthesize) = match (target_user_uuid, synthetic_user_uuid) {
        (Some(target), _) => {
            let Some(user) = log.record(target) else {
                plan.stale.push(StaleDefect {
                    defect: defect.clone(),
                    detail: format!("record {} no longer present", target),
                });
                return;
            };
            if user.tool_result_count(tool_use_id) > 0 {
                plan.skipped.push(SkippedDefect {
                    defect: defect.clone(),
                    reason: "already_repaired".to_string(),
                });
                return;
            }
            (target.to_string(), None)
        }
        (None, Some(synth)) => {
            // the virtual slot may already have been materialized
            if let Some(existing) = log.record(synth) {
                if existing.tool_result_count(tool_use_id) > 0 {
                    plan.skipped.push(SkippedDefect {
                        defect: defect.clone(),
                        reason: "already_repaired".to_string(),
                    });
                    return;
                }
                (synth.to_string(), None)
            } else {
                (
                    synth.to_string(),
                    Some(SyntheticUserSpec {
                        uuid: synth.to_string(),
                        parent_uuid: assistant_uuid.to_string(),
                        session_id: assistant.session_id.clone(),
                        timestamp: assistant.timestamp,
                    }),
                )
            }
        }
        (None, None) => {
            plan.stale.push(StaleDefect {
                defect: defect.clone(),
                detail: "missing-result defect without a target slot".to_string(),
            });
            return;
        }
    };

    inserts.push(RepairOperation {
        event_id: time::new_event_id(),
        operator: operator.to_string(),
        timestamp: now,
        reason: format!(
            "synthesize cancelled result for interrupted tool call {}",
            tool_use_id
        ),
        kind: RepairOperationKind::InsertSyntheticResult {
            before_uuid,
            tool_use_id: tool_use_id.to_string(),
            payload: json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": "cancelled",
                "is_error": true,
            }),
            synthesize,
        },
    });
}
