//! Response templates and wire shaping
//!
//! A response starts life as a template full of `0x… (in lib)` placeholders
//! and is filled in frame by frame as symbols resolve. Version 3 clients get
//! the bare `symbolicatedStacks` array; version 4 clients get the full
//! object.

use serde::{Deserialize, Serialize};

use super::request::SymbolicationRequest;

/// Hex rendering used for placeholders and the preprocessed file format.
pub fn hex(offset: u64) -> String {
    format!("{offset:#x}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolicationResponse {
    pub symbolicated_stacks: Vec<Vec<String>>,
    pub known_modules: Vec<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_hits: Option<Vec<Vec<bool>>>,
}

impl SymbolicationResponse {
    /// Placeholder template: every frame rendered as unresolved, every
    /// module unknown.
    pub fn template(request: &SymbolicationRequest) -> Self {
        let symbolicated_stacks = request
            .stacks
            .iter()
            .map(|stack| {
                stack
                    .iter()
                    .map(|frame| {
                        let index = frame.module_index();
                        if index < 0 {
                            hex(frame.offset())
                        } else {
                            let module = &request.memory_map[index as usize];
                            format!("{} (in {})", hex(frame.offset()), module.lib_name)
                        }
                    })
                    .collect()
            })
            .collect();

        Self {
            symbolicated_stacks,
            known_modules: vec![false; request.memory_map.len()],
            cache_hits: None,
        }
    }

    /// Template with a parallel all-false `cacheHits` grid attached.
    pub fn template_with_cache_hits(request: &SymbolicationRequest) -> Self {
        let mut response = Self::template(request);
        response.cache_hits = Some(
            request
                .stacks
                .iter()
                .map(|stack| vec![false; stack.len()])
                .collect(),
        );
        response
    }

    /// Record a resolved symbol for one frame and mark its module known.
    pub fn record_symbol(
        &mut self,
        stack_index: usize,
        frame_index: usize,
        module_index: usize,
        rendered: String,
    ) {
        self.symbolicated_stacks[stack_index][frame_index] = rendered;
        self.known_modules[module_index] = true;
    }

    /// Shape for the requested protocol version. Version 3 predates the
    /// wrapping object and returns the stacks array alone.
    pub fn into_wire(self, version: u8) -> serde_json::Value {
        if version == 3 {
            serde_json::to_value(self.symbolicated_stacks).unwrap_or_default()
        } else {
            serde_json::to_value(self).unwrap_or_default()
        }
    }
}
