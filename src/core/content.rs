//! Content-block validation.
//!
//! A single pure check over one content block. The validator never mutates
//! and never drops: downstream components decide what to do with invalid
//! blocks (the repair engine preserves them verbatim; only well-formed
//! duplicates are droppable).

use serde_json::Value;

/// Why a block failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidKind {
    /// Block is not a JSON mapping.
    NotAMapping,
    /// `tool_result` block without a `tool_use_id` field.
    MissingToolUseId,
    /// `tool_use_id` present but not a string.
    NonStringToolUseId,
    /// `tool_use_id` is empty after whitespace trim.
    EmptyToolUseId,
}

impl InvalidKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidKind::NotAMapping => "not_a_mapping",
            InvalidKind::MissingToolUseId => "missing_tool_use_id",
            InvalidKind::NonStringToolUseId => "non_string_tool_use_id",
            InvalidKind::EmptyToolUseId => "empty_tool_use_id",
        }
    }
}

/// Outcome of validating one block at a given content position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    Invalid {
        kind: InvalidKind,
        detail: String,
        position: usize,
    },
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }
}

/// Validate one content block.
///
/// Non-mapping blocks are invalid outright. Mapping blocks that are not
/// `tool_result` are opaque to the core and therefore valid. A
/// `tool_result` must carry a `tool_use_id` that is a non-empty string
/// after whitespace trim.
pub fn validate_block(block: &Value, position: usize) -> ValidationResult {
    let Some(obj) = block.as_object() else {
        return ValidationResult::Invalid {
            kind: InvalidKind::NotAMapping,
            detail: format!("expected a mapping, got {}", type_name(block)),
            position,
        };
    };

    if obj.get("type").and_then(Value::as_str) != Some("tool_result") {
        return ValidationResult::Valid;
    }

    match obj.get("tool_use_id") {
        None => ValidationResult::Invalid {
            kind: InvalidKind::MissingToolUseId,
            detail: "tool_result without tool_use_id".to_string(),
            position,
        },
        Some(Value::String(s)) if s.trim().is_empty() => ValidationResult::Invalid {
            kind: InvalidKind::EmptyToolUseId,
            detail: "tool_use_id is empty after trim".to_string(),
            position,
        },
        Some(Value::String(_)) => ValidationResult::Valid,
        Some(other) => ValidationResult::Invalid {
            kind: InvalidKind::NonStringToolUseId,
            detail: format!("tool_use_id is {}", type_name(other)),
            position,
        },
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_opaque_blocks_are_valid() {
        assert!(validate_block(&json!({"type":"text","text":"hi"}), 0).is_valid());
        assert!(validate_block(&json!({"type":"thinking"}), 0).is_valid());
    }

    #[test]
    fn test_non_mapping_is_invalid() {
        let res = validate_block(&json!("just a string"), 2);
        assert_eq!(
            res,
            ValidationResult::Invalid {
                kind: InvalidKind::NotAMapping,
                detail: "expected a mapping, got a string".to_string(),
                position: 2,
            }
        );
    }

    #[test]
    fn test_tool_result_requires_tool_use_id() {
        let res = validate_block(&json!({"type":"tool_result","content":"ok"}), 1);
        assert!(matches!(
            res,
            ValidationResult::Invalid {
                kind: InvalidKind::MissingToolUseId,
                ..
            }
        ));
    }

    #[test]
    fn test_tool_result_rejects_blank_id() {
        let res = validate_block(&json!({"type":"tool_result","tool_use_id":"  \t"}), 0);
        assert!(matches!(
            res,
            ValidationResult::Invalid {
                kind: InvalidKind::EmptyToolUseId,
                ..
            }
        ));
    }

    #[test]
    fn test_tool_result_rejects_numeric_id() {
        let res = validate_block(&json!({"type":"tool_result","tool_use_id":7}), 0);
        assert!(matches!(
            res,
            ValidationResult::Invalid {
                kind: InvalidKind::NonStringToolUseId,
                ..
            }
        ));
    }

    #[test]
    fn test_well_formed_tool_result_is_valid() {
        assert!(validate_block(&json!({"type":"tool_result","tool_use_id":"T1"}), 0).is_valid());
    }
}
