//! Scanner: detect structural defects without mutating data.
//!
//! Walks a parsed log and classifies every defect into the three-kind
//! taxonomy (missing tool results, duplicate tool results, orphaned parent
//! references). The scanner is read-only; repair decisions belong to the
//! engine and the manager.
//!
//! Observability contract: every scan yields counters and a bounded list of
//! per-defect context records so operators can judge a report without
//! reopening the log.

use crate::core::config::ScannerOptions;
use crate::core::content::{self, ValidationResult};
use crate::core::dag::MessageDag;
use crate::core::logfile::LogFile;
use crate::core::output;
use crate::core::record::{Block, LineError, Record};
use crate::core::time;
use serde::Serialize;
use std::collections::BTreeMap;

/// Cap on per-defect context entries carried by one report.
const MAX_CONTEXT: usize = 50;

/// Byte budget for the content snippet in a context record.
const SNIPPET_BUDGET: usize = 96;

/// One structural defect.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Defect {
    /// An assistant emitted `tool_use_id` but the next user record does not
    /// answer it. Exactly one of `target_user_uuid` / `synthetic_user_uuid`
    /// is set: either an existing record receives the synthetic result, or
    /// a virtual trailing user slot must be materialized first.
    MissingToolResult {
        assistant_uuid: String,
        tool_use_id: String,
        target_user_uuid: Option<String>,
        synthetic_user_uuid: Option<String>,
    },
    /// The same `tool_use_id` is answered more than once within one user
    /// record. `keep_index` is the first well-formed occurrence;
    /// `drop_indexes` are the later well-formed occurrences.
    /// `invalid_indexes` are malformed claimants, reported for visibility
    /// but only droppable under the explicit `drop_invalid` policy.
    DuplicateToolResult {
        user_uuid: String,
        tool_use_id: String,
        keep_index: usize,
        drop_indexes: Vec<usize>,
        invalid_indexes: Vec<usize>,
        oom_risk: bool,
    },
    /// A record references a parent uuid that does not resolve in this log.
    OrphanParent {
        child_uuid: String,
        old_parent_uuid: String,
    },
}

impl Defect {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Defect::MissingToolResult { .. } => "missing_tool_result",
            Defect::DuplicateToolResult { .. } => "duplicate_tool_result",
            Defect::OrphanParent { .. } => "orphan_parent",
        }
    }

    /// The record this defect is anchored to.
    pub fn subject_uuid(&self) -> &str {
        match self {
            Defect::MissingToolResult { assistant_uuid, .. } => assistant_uuid,
            Defect::DuplicateToolResult { user_uuid, .. } => user_uuid,
            Defect::OrphanParent { child_uuid, .. } => child_uuid,
        }
    }
}

/// Context for one defect: enough to locate and eyeball it.
#[derive(Debug, Clone, Serialize)]
pub struct DefectContext {
    pub record_uuid: String,
    pub line_no: usize,
    pub snippet: String,
    pub hint: String,
}

/// Scan counters, stable across runs of the same log.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanCounters {
    pub blocks_examined: usize,
    pub blocks_valid: usize,
    pub blocks_invalid: usize,
    pub defects_by_kind: BTreeMap<&'static str, usize>,
    pub cycles_detected: usize,
}

/// The scanner's product: defects plus observability data. Input errors and
/// cycles ride along as report fields; they are findings, not failures of
/// the scan itself.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DefectReport {
    pub defects: Vec<Defect>,
    pub counters: ScanCounters,
    pub context: Vec<DefectContext>,
    pub line_errors: Vec<LineError>,
    pub cycles: Vec<Vec<String>>,
}

impl DefectReport {
    pub fn is_clean(&self) -> bool {
        self.defects.is_empty() && self.cycles.is_empty()
    }

    pub fn has_cycles(&self) -> bool {
        !self.cycles.is_empty()
    }
}

/// Scan one log for the three defect classes.
pub fn scan(log: &LogFile, options: &ScannerOptions) -> DefectReport {
    let mut report = DefectReport {
        line_errors: log.line_errors().into_iter().cloned().collect(),
        ..DefectReport::default()
    };

    let records: Vec<&Record> = log.records().collect();

    // block validation counters
    for rec in &records {
        for (pos, block) in rec.blocks.iter().enumerate() {
            report.counters.blocks_examined += 1;
            match content::validate_block(block.raw(), pos) {
                ValidationResult::Valid => report.counters.blocks_valid += 1,
                ValidationResult::Invalid { .. } => report.counters.blocks_invalid += 1,
            }
        }
    }

    let dag = MessageDag::build(records.iter().copied());
    report.cycles = dag.cycles().to_vec();
    report.counters.cycles_detected = report.cycles.len();

    scan_missing(&records, &mut report);
    scan_duplicates(&records, options, &mut report);
    scan_orphans(&records, &dag, &mut report);

    for defect in &report.defects {
        *report
            .counters
            .defects_by_kind
            .entry(defect.kind_str())
            .or_insert(0) += 1;
    }
    report
}

/// Unanswered tool uses: every `tool_use` in an assistant record must be
/// answered exactly once by the next user record of the same session. A
/// trailing assistant with no following user record gets a deterministic
/// virtual user slot the engine may materialize.
fn scan_missing(records: &[&Record], report: &mut DefectReport) {
    for (i, rec) in records.iter().enumerate() {
        if !rec.kind.is_assistant() {
            continue;
        }
        let tool_uses = rec.tool_use_ids();
        if tool_uses.is_empty() {
            continue;
        }
        let next_user = records[i + 1..]
            .iter()
            .find(|r| r.kind.is_user() && r.session_id == rec.session_id);

        for id in tool_uses {
            let answered = next_user.map(|u| u.tool_result_count(id)).unwrap_or(0);
            if answered > 0 {
                continue;
            }
            let (target, synthetic) = match next_user {
                Some(u) => (Some(u.uuid.clone()), None),
                None => (None, Some(time::synthetic_uuid(&rec.uuid))),
            };
            push_context(
                report,
                rec,
                format!(
                    "tool_use {} has no result in the next user record{}",
                    id,
                    if synthetic.is_some() {
                        " (virtual trailing slot)"
                    } else {
                        ""
                    }
                ),
            );
            report.defects.push(Defect::MissingToolResult {
                assistant_uuid: rec.uuid.clone(),
                tool_use_id: id.to_string(),
                target_user_uuid: target,
                synthetic_user_uuid: synthetic,
            });
        }
    }
}

/// Replayed duplicates: the same `tool_use_id` answered more than once in a
/// single user record. Malformed claimants are tracked separately and never
/// enter the default drop set.
fn scan_duplicates(records: &[&Record], options: &ScannerOptions, report: &mut DefectReport) {
    for rec in records {
        if !rec.kind.is_user() {
            continue;
        }
        // id -> (well-formed positions, malformed claimant positions)
        let mut occurrences: BTreeMap<String, (Vec<usize>, Vec<usize>)> = BTreeMap::new();
        for (pos, block) in rec.blocks.iter().enumerate() {
            match block {
                Block::ToolResult { tool_use_id, .. } => {
                    occurrences.entry(tool_use_id.clone()).or_default().0.push(pos);
                }
                b @ Block::Opaque { raw } if b.claims_tool_result() => {
                    if let Some(id) = raw.get("tool_use_id").and_then(serde_json::Value::as_str) {
                        let id = id.trim();
                        if !id.is_empty() {
                            occurrences.entry(id.to_string()).or_default().1.push(pos);
                        }
                    }
                }
                _ => {}
            }
        }
        for (id, (valid, invalid)) in occurrences {
            if valid.len() < 2 {
                continue;
            }
            let oom_risk = valid.len() + invalid.len() > options.oom_threshold;
            push_context(
                report,
                rec,
                format!(
                    "{} for {} in one record{}",
                    output::count_noun(valid.len(), "result"),
                    id,
                    if oom_risk { "; oom_risk" } else { "" }
                ),
            );
            report.defects.push(Defect::DuplicateToolResult {
                user_uuid: rec.uuid.clone(),
                tool_use_id: id,
                keep_index: valid[0],
                drop_indexes: valid[1..].to_vec(),
                invalid_indexes: invalid,
                oom_risk,
            });
        }
    }
}

/// Parentage corruption: records whose parent reference does not resolve.
fn scan_orphans(records: &[&Record], dag: &MessageDag, report: &mut DefectReport) {
    for rec in records {
        let Some(node) = dag.node(&rec.uuid) else {
            continue;
        };
        if node.class == crate::core::dag::NodeClass::Orphan
            && let Some(parent) = &rec.parent_uuid
        {
            push_context(
                report,
                rec,
                format!("parent {} not found in this log", parent),
            );
            report.defects.push(Defect::OrphanParent {
                child_uuid: rec.uuid.clone(),
                old_parent_uuid: parent.clone(),
            });
        }
    }
}

fn push_context(report: &mut DefectReport, rec: &Record, hint: String) {
    if report.context.len() >= MAX_CONTEXT {
        return;
    }
    report.context.push(DefectContext {
        record_uuid: rec.uuid.clone(),
        line_no: rec.line_no,
        snippet: context_snippet(&rec.content_text()),
        hint,
    });
}

/// Fold record text into a one-line snippet: whole words only, stopping at
/// the byte budget with an elision marker when content was cut.
fn context_snippet(text: &str) -> String {
    let mut out = String::with_capacity(SNIPPET_BUDGET);
    for word in text.split_whitespace() {
        let sep = usize::from(!out.is_empty());
        if out.len() + sep + word.len() > SNIPPET_BUDGET {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str("...");
            return out;
        }
        if sep == 1 {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}
