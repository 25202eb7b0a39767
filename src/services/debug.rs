//! DiskCache debug actions
//!
//! Loopback-only maintenance operations, executed on the worker thread so
//! they serialise with normal symbolication work. Unknown actions answer
//! with an error message rather than failing the request.

use std::path::PathBuf;

use serde_json::{Value, json};

use crate::error::{CacheError, ServerError, SymtierError, SymtierResult};
use crate::models::module::ModuleId;
use crate::models::request::DebugRequest;
use crate::services::symfile;

use super::scheduler::Worker;

impl Worker {
    pub(crate) fn handle_debug(&mut self, id: &str, debug_request: &DebugRequest) -> SymtierResult<Value> {
        tracing::info!("{id} handling debug action: {}", debug_request.action);
        let mut response = serde_json::Map::new();

        match debug_request.action.as_str() {
            // Proves the cache plane is reachable; the size query touches
            // both the index and the database file.
            "heartbeat" => {
                self.index.size()?;
            }

            // Store the upstream file as-is, replacing any existing entry.
            // Raw entries exercise the MODULE-format lookup path.
            "cacheAddRaw" => {
                let (module, cache_file) = self.debug_entry(debug_request)?;
                match self.index.evict(&cache_file) {
                    Ok(()) | Err(CacheError::NoSuchKey(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                match self.supplier.fetch(&module, &module.symbol_file_name()) {
                    Some(data) => {
                        self.index.add(&cache_file, &data)?;
                        response.insert("path".to_string(), json!(cache_file));
                    }
                    None => {
                        response.insert("path".to_string(), Value::Null);
                    }
                }
            }

            "cacheGet" => {
                let (module, cache_file) = self.debug_entry(debug_request)?;
                if let Some(path) = self.overlay.get(&module.rel_path()) {
                    response.insert("path".to_string(), json!(path));
                } else {
                    match self.index.touch(&cache_file) {
                        Ok(()) => {
                            response.insert("path".to_string(), json!(cache_file));
                        }
                        Err(CacheError::NoSuchKey(_)) => {
                            let file_name = module.symbol_file_name();
                            match self.supplier.fetch(&module, &file_name) {
                                Some(data) => {
                                    let source_id = format!(
                                        "{}/{}/{file_name}",
                                        module.lib_name, module.breakpad_id
                                    );
                                    let preprocessed = symfile::preprocess(&data, &source_id);
                                    self.index.add(&cache_file, preprocessed.as_bytes())?;
                                    response.insert("path".to_string(), json!(cache_file));
                                }
                                None => {
                                    response.insert("path".to_string(), Value::Null);
                                }
                            }
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }

            "cacheEvict" => {
                let (_, cache_file) = self.debug_entry(debug_request)?;
                self.index.evict(&cache_file)?;
                response.insert("success".to_string(), json!(true));
            }

            "cacheExists" => {
                let (module, cache_file) = self.debug_entry(debug_request)?;
                let exists = self.overlay.contains(&module.rel_path())
                    || match self.index.touch(&cache_file) {
                        Ok(()) => true,
                        Err(CacheError::NoSuchKey(_)) => false,
                        Err(e) => return Err(e.into()),
                    };
                response.insert("exists".to_string(), json!(exists));
            }

            other => {
                tracing::error!("{id} invalid debug action: {other}");
                response.insert("message".to_string(), json!("Invalid action"));
            }
        }

        Ok(Value::Object(response))
    }

    fn debug_entry(&self, debug_request: &DebugRequest) -> SymtierResult<(ModuleId, PathBuf)> {
        let module = debug_request.module().ok_or_else(|| {
            SymtierError::Server(ServerError::Internal(format!(
                "debug action '{}' requires libName and breakpadId",
                debug_request.action
            )))
        })?;
        let cache_file = self.cache_path.join(module.rel_path());
        Ok((module, cache_file))
    }
}
