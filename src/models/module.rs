//! Module identity and symbol file naming

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A module referenced by stack frames: the library name plus the opaque
/// breakpad id distinguishing builds. On the wire this is the two-element
/// array `[libName, breakpadId]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(String, String)", into = "(String, String)")]
pub struct ModuleId {
    pub lib_name: String,
    pub breakpad_id: String,
}

impl ModuleId {
    pub fn new(lib_name: impl Into<String>, breakpad_id: impl Into<String>) -> Self {
        Self {
            lib_name: lib_name.into(),
            breakpad_id: breakpad_id.into(),
        }
    }

    /// Name of the symbol file on disk. `.pdb` libraries swap the suffix for
    /// `.sym`; everything else appends it.
    pub fn symbol_file_name(&self) -> String {
        match self.lib_name.strip_suffix(".pdb") {
            Some(stem) => format!("{stem}.sym"),
            None => format!("{}.sym", self.lib_name),
        }
    }

    /// Relative path of the symbol file below a cache root. The directory
    /// uses the original library name, not the rewritten file name.
    pub fn rel_path(&self) -> PathBuf {
        PathBuf::from(&self.lib_name)
            .join(&self.breakpad_id)
            .join(self.symbol_file_name())
    }

    /// Key identifying a single frame of this module in the L1 string-KV.
    /// Each segment is URL-quoted so the key carries no whitespace.
    pub fn frame_key(&self, offset: u64) -> String {
        format!(
            "{}/{}/{}",
            urlencoding::encode(&self.lib_name),
            urlencoding::encode(&self.breakpad_id),
            urlencoding::encode(&offset.to_string())
        )
    }
}

impl From<(String, String)> for ModuleId {
    fn from((lib_name, breakpad_id): (String, String)) -> Self {
        Self {
            lib_name,
            breakpad_id,
        }
    }
}

impl From<ModuleId> for (String, String) {
    fn from(module: ModuleId) -> Self {
        (module.lib_name, module.breakpad_id)
    }
}
