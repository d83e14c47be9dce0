//! Log source reader and writer.
//!
//! A log file is UTF-8 text, one JSON object per line, LF-terminated, no
//! trailing newline required. Lines that fail to parse stay in the entry
//! list as [`Unparsed`](Entry::Unparsed) and are preserved verbatim when
//! the file backend rewrites the log. The field set is open; unknown fields
//! round-trip unchanged.

use crate::core::error::MendError;
use crate::core::record::{LineError, Record};
use rustc_hash::FxHashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// One line of the log: parsed, or preserved raw.
#[derive(Debug, Clone)]
pub enum Entry {
    Record(Record),
    Unparsed(LineError),
}

impl Entry {
    pub fn to_line(&self) -> String {
        match self {
            Entry::Record(rec) => rec.to_line(),
            Entry::Unparsed(err) => err.raw.clone(),
        }
    }
}

/// An in-memory view of one log file.
#[derive(Debug, Clone)]
pub struct LogFile {
    pub path: PathBuf,
    entries: Vec<Entry>,
    trailing_newline: bool,
    index: FxHashMap<String, usize>,
}

impl LogFile {
    /// Load and tolerantly parse a log file.
    pub fn load(path: &Path) -> Result<LogFile, MendError> {
        if !path.exists() {
            return Err(MendError::NotFound(format!(
                "log file {} does not exist",
                path.display()
            )));
        }
        let text = fs::read_to_string(path)?;
        Ok(Self::parse(path.to_path_buf(), &text))
    }

    /// Parse log text. Exposed for tests and for the materializer, which
    /// replays onto a source view without touching the file again.
    pub fn parse(path: PathBuf, text: &str) -> LogFile {
        let (body, trailing_newline) = match text.strip_suffix('\n') {
            Some(stripped) => (stripped, true),
            None => (text, false),
        };
        let mut entries = Vec::new();
        if !body.is_empty() {
            for (i, line) in body.split('\n').enumerate() {
                let line_no = i + 1;
                match Record::parse_line(line.as_bytes(), line_no) {
                    Ok(rec) => entries.push(Entry::Record(rec)),
                    Err(err) => entries.push(Entry::Unparsed(err)),
                }
            }
        }
        let mut log = LogFile {
            path,
            entries,
            trailing_newline,
            index: FxHashMap::default(),
        };
        log.rebuild_index();
        log
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (i, entry) in self.entries.iter().enumerate() {
            if let Entry::Record(rec) = entry {
                self.index.insert(rec.uuid.clone(), i);
            }
        }
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.entries.iter().filter_map(|e| match e {
            Entry::Record(rec) => Some(rec),
            Entry::Unparsed(_) => None,
        })
    }

    pub fn line_errors(&self) -> Vec<&LineError> {
        self.entries
            .iter()
            .filter_map(|e| match e {
                Entry::Unparsed(err) => Some(err),
                Entry::Record(_) => None,
            })
            .collect()
    }

    pub fn record(&self, uuid: &str) -> Option<&Record> {
        let i = *self.index.get(uuid)?;
        match &self.entries[i] {
            Entry::Record(rec) => Some(rec),
            Entry::Unparsed(_) => None,
        }
    }

    pub fn record_mut(&mut self, uuid: &str) -> Option<&mut Record> {
        let i = *self.index.get(uuid)?;
        match &mut self.entries[i] {
            Entry::Record(rec) => Some(rec),
            Entry::Unparsed(_) => None,
        }
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.index.contains_key(uuid)
    }

    /// First session id seen in log order. Logs produced by one session
    /// carry exactly one; mixed logs use this as the locking key.
    pub fn primary_session(&self) -> Option<String> {
        self.records().find_map(|r| r.session_id.clone())
    }

    /// Distinct session ids in first-seen order.
    pub fn session_ids(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for rec in self.records() {
            if let Some(sid) = &rec.session_id
                && !seen.iter().any(|s| s == sid)
            {
                seen.push(sid.clone());
            }
        }
        seen
    }

    /// Insert a record directly after the entry holding `anchor_uuid`.
    /// Falls back to appending when the anchor is gone.
    pub fn insert_record_after(&mut self, anchor_uuid: &str, record: Record) {
        let at = self
            .index
            .get(anchor_uuid)
            .map(|i| i + 1)
            .unwrap_or(self.entries.len());
        self.entries.insert(at, Entry::Record(record));
        self.rebuild_index();
    }

    pub fn is_dirty(&self) -> bool {
        self.records().any(|r| r.is_dirty())
    }

    /// Render the whole log back to text. Untouched lines are emitted
    /// byte-identical; the original trailing-newline style is kept.
    pub fn render(&self) -> String {
        let mut out = self
            .entries
            .iter()
            .map(Entry::to_line)
            .collect::<Vec<_>>()
            .join("\n");
        if self.trailing_newline && !out.is_empty() {
            out.push('\n');
        }
        out
    }
}
