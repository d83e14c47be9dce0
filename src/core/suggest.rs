//! Parent suggestion for orphan reattachment.
//!
//! Ranks candidate parents for an orphaned record by a deterministic score
//! in [0, 1]: textual similarity (default weight 0.7), temporal proximity
//! with a one-hour exponential decay (0.2), and a same-session bonus (0.1).
//! The similarity measure is a swappable pure function; the default is word
//! Jaccard. Scoring never suggests the orphan itself or anything in its own
//! subtree, since reattaching there would mint a cycle.

use crate::core::config::SuggesterOptions;
use crate::core::dag::MessageDag;
use crate::core::logfile::LogFile;
use crate::core::record::Record;
use regex::Regex;
use rustc_hash::FxHashSet;
use std::sync::OnceLock;

/// Seconds of age difference at which temporal proximity decays to 1/e.
const DECAY_SECONDS: f64 = 3600.0;

/// A scored reattachment candidate.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub uuid: String,
    /// Combined score in [0, 1].
    pub score: f64,
    pub text_score: f64,
    pub time_score: f64,
    pub session_score: f64,
}

/// Result of one suggestion query.
#[derive(Debug, Clone, Default)]
pub struct Suggestion {
    /// Top-K candidates, best first. Nothing below the floor appears.
    pub candidates: Vec<Candidate>,
    /// Set when the list is empty.
    pub reason: Option<&'static str>,
}

/// Pure similarity measure over flattened record text. Implementations must
/// return values in [0, 1] and be deterministic for the same inputs.
pub type SimilarityFn = fn(&str, &str) -> f64;

pub struct ParentSuggester {
    options: SuggesterOptions,
    similarity: SimilarityFn,
}

impl ParentSuggester {
    pub fn new(options: SuggesterOptions) -> Self {
        Self {
            options,
            similarity: word_jaccard,
        }
    }

    /// Swap the similarity measure (substring ratio, n-gram Jaccard, an
    /// embedding cosine adapter) while keeping the scoring contract.
    pub fn with_similarity(options: SuggesterOptions, similarity: SimilarityFn) -> Self {
        Self {
            options,
            similarity,
        }
    }

    /// Rank candidate parents for `child_uuid` within `log`.
    pub fn suggest(&self, log: &LogFile, child_uuid: &str) -> Suggestion {
        let Some(child) = log.record(child_uuid) else {
            return Suggestion {
                candidates: Vec::new(),
                reason: Some("unknown_record"),
            };
        };

        let dag = MessageDag::build(log.records());
        let mut excluded: FxHashSet<String> = FxHashSet::default();
        excluded.insert(child_uuid.to_string());
        for uuid in dag.descendants_of(child_uuid, None) {
            excluded.insert(uuid);
        }

        let child_text = child.content_text();
        let mut candidates: Vec<Candidate> = log
            .records()
            .filter(|r| !excluded.contains(&r.uuid))
            .map(|r| self.score(child, &child_text, r))
            .filter(|c| c.score >= self.options.floor)
            .collect();

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let ts = |uuid: &str| log.record(uuid).and_then(|r| r.timestamp);
                    match (ts(&a.uuid), ts(&b.uuid)) {
                        // older timestamp first; undated candidates last
                        (Some(x), Some(y)) => x.cmp(&y),
                        (Some(_), None) => std::cmp::Ordering::Less,
                        (None, Some(_)) => std::cmp::Ordering::Greater,
                        (None, None) => std::cmp::Ordering::Equal,
                    }
                })
                .then_with(|| a.uuid.cmp(&b.uuid))
        });
        candidates.truncate(self.options.top_k);

        if candidates.is_empty() {
            Suggestion {
                candidates,
                reason: Some("below_threshold"),
            }
        } else {
            Suggestion {
                candidates,
                reason: None,
            }
        }
    }

    fn score(&self, child: &Record, child_text: &str, candidate: &Record) -> Candidate {
        let w = self.options.weights;
        let text_score = (self.similarity)(child_text, &candidate.content_text()).clamp(0.0, 1.0);
        let time_score = match (child.timestamp, candidate.timestamp) {
            (Some(a), Some(b)) => {
                let delta = (a - b).num_seconds().unsigned_abs() as f64;
                (-delta / DECAY_SECONDS).exp()
            }
            _ => 0.0,
        };
        let session_score = match (&child.session_id, &candidate.session_id) {
            (Some(a), Some(b)) if a == b => 1.0,
            _ => 0.0,
        };
        Candidate {
            uuid: candidate.uuid.clone(),
            score: w.text * text_score + w.time * time_score + w.session * session_score,
            text_score,
            time_score,
            session_score,
        }
    }
}

fn word_regex() -> &'static Regex {
    static WORD: OnceLock<Regex> = OnceLock::new();
    WORD.get_or_init(|| Regex::new(r"[A-Za-z0-9_]+").expect("static pattern"))
}

/// Default similarity: Jaccard index over lowercased word sets.
pub fn word_jaccard(a: &str, b: &str) -> f64 {
    let tokens = |s: &str| -> FxHashSet<String> {
        word_regex()
            .find_iter(s)
            .map(|m| m.as_str().to_lowercase())
            .collect()
    };
    let sa = tokens(a);
    let sb = tokens(b);
    if sa.is_empty() || sb.is_empty() {
        return 0.0;
    }
    let inter = sa.intersection(&sb).count() as f64;
    let union = sa.union(&sb).count() as f64;
    inter / union
}
