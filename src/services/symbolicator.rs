//! SymServer symbolication flow
//!
//! Each request runs on its own task. Frames are first looked up in the L1
//! string-KV; the misses are coalesced into a single sub-request for the
//! DiskCache tier, and resolved symbols are written back into the L1 on the
//! way out. A DiskCache outage degrades to placeholder output, never to a
//! failed request.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::error::{ServerError, SymtierError, SymtierResult};
use crate::infra::kv::KvStore;
use crate::models::module::ModuleId;
use crate::models::request::{DebugRequest, Frame, SymbolicationRequest};
use crate::models::response::SymbolicationResponse;

/// Seam to the DiskCache tier.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Transport and protocol failures surface as errors; the caller falls
    /// back to placeholders, never to a failed request.
    async fn symbolicate(
        &self,
        request: &SymbolicationRequest,
        id: &str,
    ) -> Result<SymbolicationResponse, ServerError>;

    /// Whether the tier answers a debug heartbeat.
    async fn heartbeat(&self) -> bool;
}

pub struct HttpUpstream {
    client: reqwest::Client,
    url: String,
}

impl HttpUpstream {
    /// `url` must already carry a scheme.
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }

    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response, ServerError> {
        match self.client.post(&self.url).json(body).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => Ok(response),
            Ok(response) => Err(ServerError::Transport(format!(
                "got HTTP {} when querying DiskCache at {}",
                response.status(),
                self.url
            ))),
            Err(e) => Err(ServerError::Transport(format!(
                "exception when querying DiskCache at {}: {e}",
                self.url
            ))),
        }
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstream {
    async fn symbolicate(
        &self,
        request: &SymbolicationRequest,
        id: &str,
    ) -> Result<SymbolicationResponse, ServerError> {
        tracing::debug!("{id} sending sub-request to DiskCache");
        let body = serde_json::to_value(request)
            .map_err(|e| ServerError::Internal(e.to_string()))?;
        let response = self.post(&body).await?;
        response
            .json()
            .await
            .map_err(|e| ServerError::Transport(format!("unparsable response from DiskCache: {e}")))
    }

    async fn heartbeat(&self) -> bool {
        let body = serde_json::to_value(DebugRequest::heartbeat()).unwrap_or_default();
        self.post(&body).await.is_ok()
    }
}

/// Front-end symbolication service. Shared by all request tasks; the only
/// mutable state is the debug-toggled `outputCacheHits` flag.
pub struct Symbolicator {
    l1: Option<Arc<dyn KvStore>>,
    upstream: Arc<dyn UpstreamClient>,
    output_cache_hits: AtomicBool,
}

impl Symbolicator {
    pub fn new(l1: Option<Arc<dyn KvStore>>, upstream: Arc<dyn UpstreamClient>) -> Self {
        Self {
            l1,
            upstream,
            output_cache_hits: AtomicBool::new(false),
        }
    }

    pub fn upstream(&self) -> &Arc<dyn UpstreamClient> {
        &self.upstream
    }

    /// Resolve a request and shape it for the requested protocol version.
    pub async fn symbolicate(&self, request: SymbolicationRequest, id: &str) -> serde_json::Value {
        let output_cache_hits = self.output_cache_hits.load(Ordering::Relaxed);
        let mut response = if output_cache_hits {
            SymbolicationResponse::template_with_cache_hits(&request)
        } else {
            SymbolicationResponse::template(&request)
        };

        let mut sub_request = SymbolicationRequest::empty_sub_request();
        let mut sub_module_index: HashMap<ModuleId, usize> = HashMap::new();
        // (stack, frame, module, position in the sub-request stack)
        let mut unresolved: Vec<(usize, usize, usize, usize)> = Vec::new();

        for (stack_index, stack) in request.stacks.iter().enumerate() {
            for (frame_index, frame) in stack.iter().enumerate() {
                let module_index = frame.module_index();
                if module_index < 0 {
                    continue;
                }
                let module_index = module_index as usize;
                let module = &request.memory_map[module_index];

                if let Some(l1) = &self.l1 {
                    let key = module.frame_key(frame.offset());
                    if let Some(symbol) = l1.get(&key).await {
                        response.record_symbol(stack_index, frame_index, module_index, symbol);
                        if let Some(hits) = &mut response.cache_hits {
                            hits[stack_index][frame_index] = true;
                        }
                        continue;
                    }
                }

                // L1 miss: route the frame to the DiskCache, reusing the
                // module slot if an earlier frame already added it
                let sub_index = match sub_module_index.get(module) {
                    Some(&index) => index,
                    None => {
                        sub_request.memory_map.push(module.clone());
                        let index = sub_request.memory_map.len() - 1;
                        sub_module_index.insert(module.clone(), index);
                        index
                    }
                };
                sub_request.stacks[0].push(Frame(sub_index as i64, frame.offset()));
                unresolved.push((
                    stack_index,
                    frame_index,
                    module_index,
                    sub_request.stacks[0].len() - 1,
                ));
            }
        }

        if !unresolved.is_empty() {
            tracing::info!("{id} {} frames not in L1 cache", unresolved.len());
            match self.upstream.symbolicate(&sub_request, id).await {
                Ok(sub_response) => {
                    self.apply_sub_response(
                        &request,
                        &mut response,
                        &sub_module_index,
                        &unresolved,
                        &sub_response,
                    )
                    .await;
                }
                Err(e) => tracing::error!("{id} bad response from DiskCache: {e}"),
            }
        }

        response.into_wire(request.version)
    }

    async fn apply_sub_response(
        &self,
        request: &SymbolicationRequest,
        response: &mut SymbolicationResponse,
        sub_module_index: &HashMap<ModuleId, usize>,
        unresolved: &[(usize, usize, usize, usize)],
        sub_response: &SymbolicationResponse,
    ) {
        let Some(sub_stack) = sub_response.symbolicated_stacks.first() else {
            return;
        };

        for &(stack_index, frame_index, module_index, sub_frame_index) in unresolved {
            let module = &request.memory_map[module_index];
            let Some(&sub_module) = sub_module_index.get(module) else {
                continue;
            };
            if sub_response.known_modules.get(sub_module) != Some(&true) {
                continue;
            }
            let Some(symbol) = sub_stack.get(sub_frame_index) else {
                continue;
            };

            response.record_symbol(stack_index, frame_index, module_index, symbol.clone());
            if let Some(l1) = &self.l1 {
                let offset = request.stacks[stack_index][frame_index].offset();
                l1.set(&module.frame_key(offset), symbol).await;
            }
        }
    }

    /// Debug actions on the front-end tier.
    pub async fn handle_debug(&self, debug: &DebugRequest, id: &str) -> SymtierResult<serde_json::Value> {
        match debug.action.as_str() {
            "outputCacheHits" => {
                let enabled = debug.enabled.unwrap_or(false);
                self.output_cache_hits.store(enabled, Ordering::Relaxed);
                tracing::warn!("{id} outputCacheHits set to: {enabled}");
                Ok(serde_json::json!({ "success": true }))
            }
            "cacheEvict" => {
                let l1 = self.l1.as_ref().ok_or_else(|| {
                    SymtierError::Server(ServerError::Internal(
                        "cacheEvict requires an L1 cache".to_string(),
                    ))
                })?;
                let module = debug.module().ok_or_else(|| {
                    SymtierError::Server(ServerError::Internal(
                        "cacheEvict requires libName and breakpadId".to_string(),
                    ))
                })?;
                let offset = debug.offset.ok_or_else(|| {
                    SymtierError::Server(ServerError::Internal(
                        "cacheEvict requires an offset".to_string(),
                    ))
                })?;

                let key = module.frame_key(offset);
                l1.delete(&key).await;
                tracing::warn!("{id} L1 cache item manually evicted: {key}");
                Ok(serde_json::json!({ "success": true }))
            }
            other => {
                tracing::error!("{id} unknown debug action requested: {other}");
                Ok(serde_json::json!({ "message": "Invalid action" }))
            }
        }
    }
}
