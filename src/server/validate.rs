//! Request validation
//!
//! The wire surface accepts exactly two shapes: a symbolication request and,
//! from the loopback interface only, a debug request. Debug validation is
//! looser (extra fields pass through); a malformed debug request falls back
//! to symbolication validation, which then rejects it.

use serde_json::Value;

use crate::error::ValidationError;
use crate::models::module::ModuleId;
use crate::models::request::{DebugRequest, Frame, ParsedRequest, SymbolicationRequest};

pub fn validate_request(body: &[u8], loopback: bool) -> Result<ParsedRequest, ValidationError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|_| ValidationError::NotJson)?;
    let object = value.as_object().ok_or(ValidationError::NotAnObject)?;

    if loopback {
        if let Some(debug_request) = validate_debug(object) {
            tracing::warn!("received debug request: {}", debug_request.action);
            return Ok(ParsedRequest::Debug(debug_request));
        }
    }

    validate_symbolication(object).map(ParsedRequest::Symbolication)
}

/// Debug requests must carry `debug: true` and a string `action`. Anything
/// less specific is not treated as a debug request at all.
fn validate_debug(object: &serde_json::Map<String, Value>) -> Option<DebugRequest> {
    if object.get("debug") != Some(&Value::Bool(true)) {
        return None;
    }
    let action = object.get("action")?.as_str()?;

    Some(DebugRequest {
        debug: true,
        action: action.to_string(),
        lib_name: field_str(object, "libName"),
        breakpad_id: field_str(object, "breakpadId"),
        offset: object.get("offset").and_then(Value::as_u64),
        enabled: object.get("enabled").and_then(Value::as_bool),
    })
}

fn field_str(object: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    object.get(key).and_then(Value::as_str).map(str::to_string)
}

fn validate_symbolication(
    object: &serde_json::Map<String, Value>,
) -> Result<SymbolicationRequest, ValidationError> {
    let stacks = object
        .get("stacks")
        .ok_or(ValidationError::MissingField("stacks"))?;
    let memory_map = object
        .get("memoryMap")
        .ok_or(ValidationError::MissingField("memoryMap"))?;
    let version = object
        .get("version")
        .ok_or(ValidationError::MissingField("version"))?;

    let version = version.as_i64().unwrap_or(-1);
    if version != 3 && version != 4 {
        return Err(ValidationError::UnsupportedVersion(version));
    }

    let memory_map = validate_memory_map(memory_map)?;
    let stacks = validate_stacks(stacks, memory_map.len())?;

    Ok(SymbolicationRequest {
        version: version as u8,
        memory_map,
        stacks,
    })
}

fn validate_memory_map(value: &Value) -> Result<Vec<ModuleId>, ValidationError> {
    let entries = value
        .as_array()
        .ok_or(ValidationError::BadMemoryMap("the request's memoryMap is not a list"))?;

    let mut memory_map = Vec::with_capacity(entries.len());
    for entry in entries {
        let pair = entry
            .as_array()
            .ok_or(ValidationError::BadMemoryMap("an element of the memoryMap is not a list"))?;
        if pair.len() != 2 {
            return Err(ValidationError::BadMemoryMap(
                "a memoryMap element does not have exactly two members",
            ));
        }
        let (Some(lib_name), Some(breakpad_id)) = (pair[0].as_str(), pair[1].as_str()) else {
            return Err(ValidationError::BadMemoryMap(
                "a memoryMap element member is not a string",
            ));
        };
        memory_map.push(ModuleId::new(lib_name, breakpad_id));
    }
    Ok(memory_map)
}

fn validate_stacks(value: &Value, module_count: usize) -> Result<Vec<Vec<Frame>>, ValidationError> {
    let stacks = value
        .as_array()
        .ok_or(ValidationError::BadStack("the request's stacks are not a list"))?;

    let mut validated = Vec::with_capacity(stacks.len());
    for stack in stacks {
        let frames = stack
            .as_array()
            .ok_or(ValidationError::BadStack("one of the request's stacks is not a list"))?;

        let mut validated_stack = Vec::with_capacity(frames.len());
        for frame in frames {
            let pair = frame.as_array().ok_or(ValidationError::BadStack(
                "one of the request's stack frames is not a list",
            ))?;
            if pair.len() != 2 {
                return Err(ValidationError::BadStack(
                    "a stack frame does not have exactly two members",
                ));
            }
            let module_index = pair[0].as_i64().ok_or(ValidationError::BadStack(
                "a stack frame module index is not an integer",
            ))?;
            if module_index >= module_count as i64 {
                return Err(ValidationError::BadStack(
                    "a stack frame module index is out of range",
                ));
            }
            let offset = pair[1].as_u64().ok_or(ValidationError::BadStack(
                "a stack frame offset is not a non-negative integer",
            ))?;
            validated_stack.push(Frame(module_index, offset));
        }
        validated.push(validated_stack);
    }
    Ok(validated)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{
        "stacks": [[[0, 11723767], [1, 65802]]],
        "memoryMap": [
            ["xul.pdb", "44E4EC8C2F41492B9369D6B9A059577C2"],
            ["wntdll.pdb", "D74F79EB1F8D4A45ABCD2F476CCABACC2"]
        ],
        "version": 4
    }"#;

    fn validate(body: &str) -> Result<ParsedRequest, ValidationError> {
        validate_request(body.as_bytes(), false)
    }

    #[test]
    fn test_valid_request() {
        let ParsedRequest::Symbolication(request) = validate(VALID).unwrap() else {
            panic!("expected a symbolication request");
        };
        assert_eq!(request.version, 4);
        assert_eq!(request.memory_map.len(), 2);
        assert_eq!(request.stacks[0][0], Frame(0, 11723767));
    }

    #[test]
    fn test_not_json() {
        assert!(matches!(validate("not json"), Err(ValidationError::NotJson)));
    }

    #[test]
    fn test_not_an_object() {
        assert!(matches!(validate("[1, 2]"), Err(ValidationError::NotAnObject)));
    }

    #[test]
    fn test_missing_memory_map() {
        let body = r#"{"stacks": [], "version": 4}"#;
        assert!(matches!(
            validate(body),
            Err(ValidationError::MissingField("memoryMap"))
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let body = r#"{"stacks": [], "memoryMap": [], "version": 5}"#;
        assert!(matches!(
            validate(body),
            Err(ValidationError::UnsupportedVersion(5))
        ));
    }

    #[test]
    fn test_negative_module_index_allowed() {
        let body = r#"{
            "stacks": [[[-1, 1234]]],
            "memoryMap": [["xul.pdb", "44E4"]],
            "version": 3
        }"#;
        let ParsedRequest::Symbolication(request) = validate(body).unwrap() else {
            panic!("expected a symbolication request");
        };
        assert_eq!(request.stacks[0][0].module_index(), -1);
    }

    #[test]
    fn test_out_of_range_module_index_rejected() {
        let body = r#"{
            "stacks": [[[1, 1234]]],
            "memoryMap": [["xul.pdb", "44E4"]],
            "version": 4
        }"#;
        assert!(matches!(validate(body), Err(ValidationError::BadStack(_))));
    }

    #[test]
    fn test_every_stack_is_validated() {
        let body = r#"{
            "stacks": [[[0, 1]], [[0, "bad"]]],
            "memoryMap": [["xul.pdb", "44E4"]],
            "version": 4
        }"#;
        assert!(matches!(validate(body), Err(ValidationError::BadStack(_))));
    }

    #[test]
    fn test_memory_map_element_shape() {
        let body = r#"{
            "stacks": [],
            "memoryMap": [["xul.pdb", "44E4", "extra"]],
            "version": 4
        }"#;
        assert!(matches!(validate(body), Err(ValidationError::BadMemoryMap(_))));

        let body = r#"{
            "stacks": [],
            "memoryMap": [["xul.pdb", 7]],
            "version": 4
        }"#;
        assert!(matches!(validate(body), Err(ValidationError::BadMemoryMap(_))));
    }

    #[test]
    fn test_debug_requires_loopback() {
        let body = r#"{"debug": true, "action": "heartbeat"}"#;

        let parsed = validate_request(body.as_bytes(), true).unwrap();
        assert!(parsed.is_debug());

        // From a remote address the same body falls through to
        // symbolication validation and is rejected
        assert!(validate_request(body.as_bytes(), false).is_err());
    }

    #[test]
    fn test_malformed_debug_falls_through() {
        let body = r#"{"debug": true, "action": 42}"#;
        assert!(matches!(
            validate_request(body.as_bytes(), true),
            Err(ValidationError::MissingField("stacks"))
        ));
    }

    #[test]
    fn test_debug_keeps_optional_fields() {
        let body = r#"{
            "debug": true,
            "action": "cacheEvict",
            "libName": "xul.pdb",
            "breakpadId": "44E4",
            "offset": 65802,
            "unknownExtra": [1, 2, 3]
        }"#;
        let ParsedRequest::Debug(debug) = validate_request(body.as_bytes(), true).unwrap()
        else {
            panic!("expected a debug request");
        };
        assert_eq!(debug.action, "cacheEvict");
        assert_eq!(debug.offset, Some(65802));
        assert!(debug.module().is_some());
    }
}
