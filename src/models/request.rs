//! Wire request types
//!
//! A parsed request is either a symbolication request or a localhost-only
//! debug request. The split is a tagged enum so dispatch stays a `match`.

use serde::{Deserialize, Serialize};

use super::module::ModuleId;

/// One stack frame on the wire: `[moduleIndex, offset]`. A negative module
/// index means "no module"; such frames are echoed back as bare hex and
/// never symbolicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame(pub i64, pub u64);

impl Frame {
    pub fn module_index(&self) -> i64 {
        self.0
    }

    pub fn offset(&self) -> u64 {
        self.1
    }
}

/// A symbolication request, shared by both tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolicationRequest {
    pub version: u8,
    pub memory_map: Vec<ModuleId>,
    pub stacks: Vec<Vec<Frame>>,
}

impl SymbolicationRequest {
    /// Empty version-4 request used as the starting point for sub-requests
    /// sent from the SymServer down to the DiskCache.
    pub fn empty_sub_request() -> Self {
        Self {
            version: 4,
            memory_map: Vec::new(),
            stacks: vec![Vec::new()],
        }
    }

    pub fn frame_count(&self) -> usize {
        self.stacks.iter().map(Vec::len).sum()
    }
}

/// A debug request. Loopback-only; extra fields are accepted and ignored.
/// `debug` is kept so a forwarded request serialises back with the marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugRequest {
    #[serde(default = "debug_marker")]
    pub debug: bool,

    pub action: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub lib_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakpad_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

fn debug_marker() -> bool {
    true
}

impl DebugRequest {
    pub fn heartbeat() -> Self {
        Self {
            debug: true,
            action: "heartbeat".to_string(),
            lib_name: None,
            breakpad_id: None,
            offset: None,
            enabled: None,
        }
    }

    /// The module named by `libName`/`breakpadId`, when both are present.
    pub fn module(&self) -> Option<ModuleId> {
        match (&self.lib_name, &self.breakpad_id) {
            (Some(lib), Some(id)) => Some(ModuleId::new(lib.clone(), id.clone())),
            _ => None,
        }
    }
}

/// A validated incoming request.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedRequest {
    Symbolication(SymbolicationRequest),
    Debug(DebugRequest),
}

impl ParsedRequest {
    pub fn is_debug(&self) -> bool {
        matches!(self, Self::Debug(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_wire_form() {
        let frame = Frame(0, 11723767);
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, "[0,11723767]");
        let back: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn test_request_round_trip() {
        let raw = r#"{
            "version": 4,
            "memoryMap": [["xul.pdb", "44E4EC8C2F41492B9369D6B9A059577C2"]],
            "stacks": [[[0, 11723767], [-1, 65802]]]
        }"#;
        let request: SymbolicationRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.version, 4);
        assert_eq!(request.memory_map.len(), 1);
        assert_eq!(request.stacks[0][1].module_index(), -1);
        assert_eq!(request.frame_count(), 2);

        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("memoryMap").is_some());
        assert!(json.get("stacks").is_some());
    }

    #[test]
    fn test_debug_request_accepts_extra_fields() {
        let raw = r#"{
            "debug": true,
            "action": "cacheExists",
            "libName": "xul.pdb",
            "breakpadId": "44E4",
            "somethingElse": 12
        }"#;
        let request: DebugRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.action, "cacheExists");
        assert!(request.module().is_some());
        assert!(request.offset.is_none());
    }

    #[test]
    fn test_debug_request_serialises_with_marker() {
        let json = serde_json::to_value(DebugRequest::heartbeat()).unwrap();
        assert_eq!(json.get("debug"), Some(&serde_json::Value::Bool(true)));
        assert_eq!(json.get("action").and_then(|a| a.as_str()), Some("heartbeat"));
    }
}
