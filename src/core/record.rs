//! Record codec: parse and emit one log line.
//!
//! The unit of a conversation log is one JSON object per line. Parsing is
//! tolerant: a line that fails JSON decoding or lacks `kind`/`uuid` is
//! reported as a [`LineError`] carrying the raw bytes, line number, and
//! diagnostic; the caller chooses whether to skip or abort.
//!
//! Round-trip fidelity is the load-bearing property here. A parsed record
//! keeps its full field map in original key order (unknown fields included)
//! plus the original line text. Records that were never mutated re-emit
//! their original bytes; mutated records serialize deterministically from
//! the field map.

use crate::core::time;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// Record kind discriminator. Unrecognized kind strings are carried as
/// `Other` and pass through the pipeline opaquely; only a missing or
/// non-string `kind` is a parse error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordKind {
    User,
    Assistant,
    System,
    Summary,
    Other(String),
}

impl RecordKind {
    pub fn parse(s: &str) -> RecordKind {
        match s {
            "user" => RecordKind::User,
            "assistant" => RecordKind::Assistant,
            "system" => RecordKind::System,
            "summary" => RecordKind::Summary,
            other => RecordKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RecordKind::User => "user",
            RecordKind::Assistant => "assistant",
            RecordKind::System => "system",
            RecordKind::Summary => "summary",
            RecordKind::Other(s) => s,
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, RecordKind::User)
    }

    pub fn is_assistant(&self) -> bool {
        matches!(self, RecordKind::Assistant)
    }
}

/// A line that could not be parsed into a [`Record`]. Non-fatal: the
/// scanner skips it and the file backend preserves it verbatim.
#[derive(Debug, Clone, Serialize)]
pub struct LineError {
    pub line_no: usize,
    pub raw: String,
    pub detail: String,
}

/// One element of a record's content list.
///
/// Only `tool_use` and well-formed `tool_result` blocks are of interest to
/// the repair pipeline; everything else (text chunks, malformed tool
/// results, future block types) is `Opaque` and passes through unchanged.
#[derive(Debug, Clone)]
pub enum Block {
    ToolUse { id: String, raw: Value },
    ToolResult { tool_use_id: String, raw: Value },
    Opaque { raw: Value },
}

impl Block {
    /// Classify a raw content value. Malformed tool blocks become `Opaque`
    /// rather than errors; the validator reports them, nothing drops them.
    pub fn from_value(value: Value) -> Block {
        if let Some(obj) = value.as_object() {
            match obj.get("type").and_then(Value::as_str) {
                Some("tool_use") => {
                    if let Some(id) = obj.get("id").and_then(Value::as_str) {
                        let id = id.trim();
                        if !id.is_empty() {
                            return Block::ToolUse {
                                id: id.to_string(),
                                raw: value,
                            };
                        }
                    }
                }
                Some("tool_result") => {
                    if let Some(id) = obj.get("tool_use_id").and_then(Value::as_str) {
                        let id = id.trim();
                        if !id.is_empty() {
                            return Block::ToolResult {
                                tool_use_id: id.to_string(),
                                raw: value,
                            };
                        }
                    }
                }
                _ => {}
            }
        }
        Block::Opaque { raw: value }
    }

    pub fn raw(&self) -> &Value {
        match self {
            Block::ToolUse { raw, .. } => raw,
            Block::ToolResult { raw, .. } => raw,
            Block::Opaque { raw } => raw,
        }
    }

    /// True for any block whose `type` claims `tool_result`, well-formed or
    /// not. Used by the scanner's invalid-duplicate bookkeeping.
    pub fn claims_tool_result(&self) -> bool {
        match self {
            Block::ToolResult { .. } => true,
            Block::Opaque { raw } => {
                raw.get("type").and_then(Value::as_str) == Some("tool_result")
            }
            Block::ToolUse { .. } => false,
        }
    }
}

/// One parsed record of the log.
#[derive(Debug, Clone)]
pub struct Record {
    pub kind: RecordKind,
    pub uuid: String,
    pub parent_uuid: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub session_id: Option<String>,
    pub blocks: Vec<Block>,
    pub line_no: usize,
    fields: Map<String, Value>,
    raw: String,
    dirty: bool,
}

fn line_err(line_no: usize, raw: &str, detail: impl Into<String>) -> LineError {
    LineError {
        line_no,
        raw: raw.to_string(),
        detail: detail.into(),
    }
}

impl Record {
    /// Parse one line (without its terminator) into a record.
    pub fn parse_line(bytes: &[u8], line_no: usize) -> Result<Record, LineError> {
        let raw = String::from_utf8_lossy(bytes).into_owned();
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| line_err(line_no, &raw, format!("invalid JSON: {}", e)))?;
        let Value::Object(fields) = value else {
            return Err(line_err(line_no, &raw, "line is not a JSON object"));
        };

        let kind = match fields.get("kind") {
            Some(Value::String(s)) => RecordKind::parse(s),
            Some(_) => return Err(line_err(line_no, &raw, "'kind' is not a string")),
            None => return Err(line_err(line_no, &raw, "missing 'kind'")),
        };
        let uuid = match fields.get("uuid") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            Some(Value::String(_)) => return Err(line_err(line_no, &raw, "'uuid' is empty")),
            Some(_) => return Err(line_err(line_no, &raw, "'uuid' is not a string")),
            None => return Err(line_err(line_no, &raw, "missing 'uuid'")),
        };
        let parent_uuid = match fields.get("parent_uuid") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(_) => return Err(line_err(line_no, &raw, "'parent_uuid' is not a string")),
        };
        let timestamp = fields
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(time::parse_iso);
        let session_id = fields
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let blocks = match fields.get("content") {
            Some(Value::Array(items)) => items.iter().cloned().map(Block::from_value).collect(),
            Some(_) => return Err(line_err(line_no, &raw, "'content' is not a list")),
            None => Vec::new(),
        };

        Ok(Record {
            kind,
            uuid,
            parent_uuid,
            timestamp,
            session_id,
            blocks,
            line_no,
            fields,
            raw,
            dirty: false,
        })
    }

    /// Build a synthetic user record answering an interrupted tool call.
    /// Starts dirty: it has no original bytes to fall back to.
    pub fn synthetic_user(
        uuid: &str,
        parent_uuid: &str,
        session_id: Option<&str>,
        timestamp: Option<DateTime<Utc>>,
        line_no: usize,
    ) -> Record {
        let mut fields = Map::new();
        fields.insert("kind".to_string(), Value::String("user".to_string()));
        fields.insert("uuid".to_string(), Value::String(uuid.to_string()));
        fields.insert(
            "parent_uuid".to_string(),
            Value::String(parent_uuid.to_string()),
        );
        if let Some(ts) = timestamp {
            fields.insert(
                "timestamp".to_string(),
                Value::String(time::format_iso(ts)),
            );
        }
        if let Some(sid) = session_id {
            fields.insert("session_id".to_string(), Value::String(sid.to_string()));
        }
        fields.insert("content".to_string(), Value::Array(Vec::new()));
        Record {
            kind: RecordKind::User,
            uuid: uuid.to_string(),
            parent_uuid: Some(parent_uuid.to_string()),
            timestamp,
            session_id: session_id.map(str::to_string),
            blocks: Vec::new(),
            line_no,
            fields,
            raw: String::new(),
            dirty: true,
        }
    }

    /// Deterministic serialization: original key order (unknown fields
    /// included), compact separators, no trailing whitespace. The line
    /// terminator is the writer's responsibility.
    pub fn serialize(&self) -> String {
        let mut fields = self.fields.clone();
        if fields.contains_key("content") || !self.blocks.is_empty() {
            let content: Vec<Value> = self.blocks.iter().map(|b| b.raw().clone()).collect();
            fields.insert("content".to_string(), Value::Array(content));
        }
        // The map is mirrored on every mutation, so this cannot fail.
        serde_json::to_string(&Value::Object(fields)).unwrap_or_default()
    }

    /// Emit this record as a log line: original bytes when untouched,
    /// canonical serialization once mutated.
    pub fn to_line(&self) -> String {
        if self.dirty {
            self.serialize()
        } else {
            self.raw.clone()
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Relink (or detach, with `None`) this record's parent reference.
    pub fn set_parent_uuid(&mut self, parent: Option<String>) {
        match &parent {
            Some(p) => {
                self.fields
                    .insert("parent_uuid".to_string(), Value::String(p.clone()));
            }
            None => {
                self.fields.shift_remove("parent_uuid");
            }
        }
        self.parent_uuid = parent;
        self.dirty = true;
    }

    /// Insert a content block at the front (tool results answer the tool
    /// use that the *previous* record emitted, so they lead the content).
    pub fn insert_block_front(&mut self, value: Value) {
        self.blocks.insert(0, Block::from_value(value));
        self.dirty = true;
    }

    /// Drop the block at `index` iff it is a well-formed tool result for
    /// `tool_use_id`. Returns false (and leaves the record untouched) when
    /// the index no longer holds that block, which makes replayed drops
    /// no-ops instead of collateral damage.
    pub fn drop_tool_result(&mut self, index: usize, tool_use_id: &str) -> bool {
        match self.blocks.get(index) {
            Some(Block::ToolResult { tool_use_id: id, .. }) if id == tool_use_id => {
                self.blocks.remove(index);
                self.dirty = true;
                true
            }
            _ => false,
        }
    }

    /// Drop the block at `index` iff it *claims* to be a tool result for
    /// `tool_use_id`, malformed blocks included. Only the explicit
    /// `drop_invalid` policy reaches for this.
    pub fn drop_claimed_tool_result(&mut self, index: usize, tool_use_id: &str) -> bool {
        let matches = match self.blocks.get(index) {
            Some(Block::ToolResult { tool_use_id: id, .. }) => id == tool_use_id,
            Some(b @ Block::Opaque { raw }) => {
                b.claims_tool_result()
                    && raw
                        .get("tool_use_id")
                        .and_then(Value::as_str)
                        .map(|s| s.trim() == tool_use_id)
                        .unwrap_or(false)
            }
            _ => false,
        };
        if matches {
            self.blocks.remove(index);
            self.dirty = true;
        }
        matches
    }

    /// Ids of `tool_use` blocks, in content order.
    pub fn tool_use_ids(&self) -> Vec<&str> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                Block::ToolUse { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Number of well-formed tool results answering `tool_use_id`.
    pub fn tool_result_count(&self, tool_use_id: &str) -> usize {
        self.blocks
            .iter()
            .filter(|b| matches!(b, Block::ToolResult { tool_use_id: id, .. } if id == tool_use_id))
            .count()
    }

    /// Flattened text content for similarity scoring: text blocks plus
    /// string payloads of tool results.
    pub fn content_text(&self) -> String {
        let mut out = String::new();
        for block in &self.blocks {
            collect_text(block.raw(), &mut out);
        }
        out
    }
}

fn collect_text(value: &Value, out: &mut String) {
    match value {
        Value::Object(obj) => {
            if let Some(Value::String(s)) = obj.get("text") {
                push_text(out, s);
            }
            match obj.get("content") {
                Some(Value::String(s)) => push_text(out, s),
                Some(Value::Array(items)) => {
                    for item in items {
                        collect_text(item, out);
                    }
                }
                _ => {}
            }
        }
        Value::String(s) => push_text(out, s),
        _ => {}
    }
}

fn push_text(out: &mut String, s: &str) {
    if !out.is_empty() {
        out.push(' ');
    }
    out.push_str(s);
}
