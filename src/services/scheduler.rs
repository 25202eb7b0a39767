//! DiskCache request scheduler
//!
//! A single worker thread owns the cache index, the static overlay and the
//! upstream supplier. Requests arrive through a thread-safe intake channel
//! and are drained into an ordered work list the worker is free to inspect.
//! The head item drives each iteration, but while a symbol file is open the
//! worker resolves matching frames from every queued item, so concurrent
//! requests for the same module cost one fetch and one file scan.
//!
//! Batching is purely opportunistic: a request that got its frames filled in
//! early simply finds its modules already known when it reaches the head.

use std::collections::{HashMap, HashSet};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tokio::sync::oneshot;

use crate::config::DiskCacheConfig;
use crate::error::{CacheError, ServerError, SymtierError, SymtierResult};
use crate::infra::cache::{LruIndex, StaticOverlay};
use crate::infra::fetch::SymbolSupplier;
use crate::models::request::{ParsedRequest, SymbolicationRequest};
use crate::models::response::SymbolicationResponse;
use crate::services::symfile;

/// Handle the HTTP layer holds while a request is queued. Dropping it
/// before the worker reaches the item cancels the item silently.
pub type CompletionHandle = oneshot::Receiver<SymtierResult<serde_json::Value>>;

pub(crate) struct WorkItem {
    pub(crate) id: String,
    pub(crate) payload: WorkPayload,
    pub(crate) completion: oneshot::Sender<SymtierResult<serde_json::Value>>,
}

pub(crate) enum WorkPayload {
    Symbolicate {
        request: SymbolicationRequest,
        response: SymbolicationResponse,
    },
    Debug(crate::models::request::DebugRequest),
}

/// Client side of the DiskCache worker.
pub struct DiskCacheScheduler {
    intake: Sender<WorkItem>,
}

impl DiskCacheScheduler {
    /// Open the cache plane and start the worker thread.
    pub fn start(
        config: &DiskCacheConfig,
        supplier: Box<dyn SymbolSupplier>,
    ) -> SymtierResult<Self> {
        let index = LruIndex::open(&config.cache_path, config.max_size_bytes())?;
        let overlay = StaticOverlay::load(&config.local_symbol_dirs);
        let (intake_tx, intake_rx) = unbounded();

        let worker = Worker {
            intake: intake_rx,
            work_list: Vec::new(),
            index,
            overlay,
            supplier,
            cache_path: config.cache_path.clone(),
        };
        std::thread::Builder::new()
            .name("diskcache-worker".to_string())
            .spawn(move || worker.run())?;

        Ok(Self { intake: intake_tx })
    }

    /// Enqueue a request and return its one-shot completion handle. The
    /// response template is built here, before the item is visible to the
    /// worker.
    pub fn submit(&self, request: ParsedRequest, id: String) -> CompletionHandle {
        let payload = match request {
            ParsedRequest::Symbolication(request) => {
                let response = SymbolicationResponse::template(&request);
                WorkPayload::Symbolicate { request, response }
            }
            ParsedRequest::Debug(debug) => WorkPayload::Debug(debug),
        };

        let (completion, handle) = oneshot::channel();
        tracing::debug!("{id} work submitted to DiskCache worker");
        if let Err(rejected) = self.intake.send(WorkItem {
            id,
            payload,
            completion,
        }) {
            let _ = rejected
                .0
                .completion
                .send(Err(ServerError::WorkerGone.into()));
        }
        handle
    }
}

/// One frame that references the module currently being resolved.
/// `work_index` 0 is the head item; `i + 1` is `work_list[i]`.
struct FrameRef {
    work_index: usize,
    stack_index: usize,
    frame_index: usize,
    module_index: usize,
    offset: u64,
}

pub(crate) struct Worker {
    pub(crate) intake: Receiver<WorkItem>,
    pub(crate) work_list: Vec<WorkItem>,
    pub(crate) index: LruIndex,
    pub(crate) overlay: StaticOverlay,
    pub(crate) supplier: Box<dyn SymbolSupplier>,
    pub(crate) cache_path: PathBuf,
}

impl Worker {
    fn run(mut self) {
        loop {
            if !self.fill_work_list() {
                tracing::debug!("DiskCache intake closed, worker exiting");
                return;
            }
            self.process_head();
        }
    }

    /// Ensure at least one item is queued, blocking on the intake only when
    /// the work list is empty, then drain whatever else has arrived.
    fn fill_work_list(&mut self) -> bool {
        if self.work_list.is_empty() {
            match self.intake.recv() {
                Ok(item) => self.work_list.push(item),
                Err(_) => return false,
            }
        }
        self.drain_intake();
        true
    }

    pub(crate) fn drain_intake(&mut self) {
        while let Ok(item) = self.intake.try_recv() {
            self.work_list.push(item);
        }
    }

    /// Handle one head item. The head is removed from the list up front so
    /// a failure can never leave it to be re-examined; batching treats the
    /// detached head as work index 0.
    fn process_head(&mut self) {
        let WorkItem {
            id,
            payload,
            completion,
        } = self.work_list.remove(0);

        if completion.is_closed() {
            tracing::debug!("{id} work was cancelled before running");
            return;
        }
        tracing::debug!("{id} worker got work");

        let result = match payload {
            WorkPayload::Debug(debug) => self.handle_debug(&id, &debug),
            WorkPayload::Symbolicate {
                request,
                mut response,
            } => self
                .symbolicate(&request, &mut response)
                .and_then(|()| {
                    serde_json::to_value(response)
                        .map_err(|e| SymtierError::Server(ServerError::Internal(e.to_string())))
                }),
        };

        if let Err(e) = &result {
            tracing::error!("{id} worker caught error while working: {e}");
        } else {
            tracing::debug!("{id} worker work done");
        }
        let _ = completion.send(result);
    }

    /// Resolve every unknown module of the head request, folding in frames
    /// from queued items that reference the same module. The intake is
    /// drained again after each module: a slow fetch may have queued new
    /// requests that can share the remaining modules.
    fn symbolicate(
        &mut self,
        request: &SymbolicationRequest,
        response: &mut SymbolicationResponse,
    ) -> SymtierResult<()> {
        for module_index in 0..request.memory_map.len() {
            if response.known_modules[module_index] {
                continue;
            }
            let module = request.memory_map[module_index].clone();

            let (frame_refs, offsets) = self.collect_frames(request, module_index, &module);
            if offsets.is_empty() {
                continue;
            }

            let rel_path = module.rel_path();
            let mut symbols: HashMap<u64, String> = HashMap::new();

            if let Some(static_path) = self.overlay.get(&rel_path) {
                let static_path = static_path.to_path_buf();
                self.read_static_symbols(&static_path, &offsets, &mut symbols);
            } else {
                let cache_file = self.cache_path.join(&rel_path);
                match self.read_cached_symbols(&cache_file, &offsets, &mut symbols) {
                    Ok(()) => {}
                    Err(CacheError::NoSuchKey(_)) => {
                        let file_name = module.symbol_file_name();
                        let Some(data) = self.supplier.fetch(&module, &file_name) else {
                            // Unable to download; the module stays unresolved
                            continue;
                        };
                        let source_id = format!(
                            "{}/{}/{file_name}",
                            module.lib_name, module.breakpad_id
                        );
                        let preprocessed = symfile::preprocess(&data, &source_id);
                        self.index.add(&cache_file, preprocessed.as_bytes())?;
                        self.read_cached_symbols(&cache_file, &offsets, &mut symbols)?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            for frame_ref in &frame_refs {
                let Some(symbol) = symbols.get(&frame_ref.offset) else {
                    continue;
                };
                let rendered = format!("{symbol} (in {})", module.lib_name);
                let target = match frame_ref.work_index {
                    0 => &mut *response,
                    i => match &mut self.work_list[i - 1].payload {
                        WorkPayload::Symbolicate { response, .. } => response,
                        WorkPayload::Debug(_) => continue,
                    },
                };
                target.record_symbol(
                    frame_ref.stack_index,
                    frame_ref.frame_index,
                    frame_ref.module_index,
                    rendered,
                );
            }

            self.drain_intake();
        }
        Ok(())
    }

    /// Collect every frame across the head request and all queued
    /// symbolication items that references `module`, together with the
    /// deduplicated offset set.
    fn collect_frames(
        &self,
        head: &SymbolicationRequest,
        head_module_index: usize,
        module: &crate::models::module::ModuleId,
    ) -> (Vec<FrameRef>, Vec<u64>) {
        let mut frame_refs = Vec::new();
        let mut offsets = HashSet::new();

        collect_from(head, 0, head_module_index, &mut frame_refs, &mut offsets);

        for (list_index, item) in self.work_list.iter().enumerate() {
            let WorkPayload::Symbolicate { request, .. } = &item.payload else {
                continue;
            };
            let Some(module_index) = request.memory_map.iter().position(|m| m == module) else {
                continue;
            };
            collect_from(
                request,
                list_index + 1,
                module_index,
                &mut frame_refs,
                &mut offsets,
            );
        }

        (frame_refs, offsets.into_iter().collect())
    }

    fn read_static_symbols(
        &self,
        path: &Path,
        offsets: &[u64],
        symbols: &mut HashMap<u64, String>,
    ) {
        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(e) => {
                tracing::error!("unable to open static symbol file {}: {e}", path.display());
                return;
            }
        };
        if let Err(e) = symfile::read_symbols(
            BufReader::new(file),
            &path.display().to_string(),
            offsets,
            symbols,
        ) {
            tracing::error!("exception when reading symbols from {}: {e}", path.display());
        }
    }

    /// Read symbols from a cached entry. A cache miss propagates so the
    /// caller can fetch and retry; everything else degrades to whatever
    /// symbols were matched before the failure.
    pub(crate) fn read_cached_symbols(
        &self,
        path: &Path,
        offsets: &[u64],
        symbols: &mut HashMap<u64, String>,
    ) -> Result<(), CacheError> {
        let reader = self.index.open_entry(path)?;
        if let Err(e) = symfile::read_symbols(
            BufReader::new(reader),
            &path.display().to_string(),
            offsets,
            symbols,
        ) {
            tracing::error!("exception when reading symbols from {}: {e}", path.display());
        }
        Ok(())
    }
}

fn collect_from(
    request: &SymbolicationRequest,
    work_index: usize,
    module_index: usize,
    frame_refs: &mut Vec<FrameRef>,
    offsets: &mut HashSet<u64>,
) {
    for (stack_index, stack) in request.stacks.iter().enumerate() {
        for (frame_index, frame) in stack.iter().enumerate() {
            if frame.module_index() == module_index as i64 {
                frame_refs.push(FrameRef {
                    work_index,
                    stack_index,
                    frame_index,
                    module_index,
                    offset: frame.offset(),
                });
                offsets.insert(frame.offset());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::module::ModuleId;
    use crate::models::request::Frame;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const XUL_RAW: &str = "MODULE windows x86 44E4 xul.pdb\n\
                           FUNC b2e000 400 0 nsAppRunner::Run()\n\
                           PUBLIC b2f000 0 XRE_main\n";
    const NTDLL_RAW: &str = "MODULE windows x86 D74F wntdll.pdb\n\
                             PUBLIC 10000 0 KiFastSystemCallRet\n";

    struct StubSupplier {
        files: HashMap<String, Vec<u8>>,
        calls: Arc<AtomicUsize>,
    }

    impl StubSupplier {
        fn new(files: &[(&str, &str)]) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let supplier = Self {
                files: files
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
                    .collect(),
                calls: Arc::clone(&calls),
            };
            (supplier, calls)
        }
    }

    impl SymbolSupplier for StubSupplier {
        fn fetch(&self, module: &ModuleId, file_name: &str) -> Option<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let key = format!("{}/{}/{file_name}", module.lib_name, module.breakpad_id);
            self.files.get(&key).cloned()
        }
    }

    fn config(root: &Path) -> DiskCacheConfig {
        DiskCacheConfig {
            cache_path: root.to_path_buf(),
            ..DiskCacheConfig::default()
        }
    }

    fn two_module_request() -> ParsedRequest {
        ParsedRequest::Symbolication(SymbolicationRequest {
            version: 4,
            memory_map: vec![
                ModuleId::new("xul.pdb", "44E4"),
                ModuleId::new("wntdll.pdb", "D74F"),
            ],
            stacks: vec![vec![Frame(0, 0xb2e3f7), Frame(1, 0x10123)]],
        })
    }

    fn stub_files() -> Vec<(&'static str, &'static str)> {
        vec![
            ("xul.pdb/44E4/xul.sym", XUL_RAW),
            ("wntdll.pdb/D74F/wntdll.sym", NTDLL_RAW),
        ]
    }

    #[tokio::test]
    async fn test_symbolicates_request_and_caches_files() {
        let root = tempfile::tempdir().unwrap();
        let (supplier, calls) = StubSupplier::new(&stub_files());
        let scheduler =
            DiskCacheScheduler::start(&config(root.path()), Box::new(supplier)).unwrap();

        let first = scheduler
            .submit(two_module_request(), "req-1".to_string())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            first["symbolicatedStacks"][0][0],
            "nsAppRunner::Run() (in xul.pdb)"
        );
        assert_eq!(
            first["symbolicatedStacks"][0][1],
            "KiFastSystemCallRet (in wntdll.pdb)"
        );
        assert_eq!(first["knownModules"], serde_json::json!([true, true]));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Identical request answers byte-equal from cache, with no fetch
        let second = scheduler
            .submit(two_module_request(), "req-2".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unavailable_module_keeps_placeholder() {
        let root = tempfile::tempdir().unwrap();
        let (supplier, _) = StubSupplier::new(&[("xul.pdb/44E4/xul.sym", XUL_RAW)]);
        let scheduler =
            DiskCacheScheduler::start(&config(root.path()), Box::new(supplier)).unwrap();

        let response = scheduler
            .submit(two_module_request(), "req-1".to_string())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            response["symbolicatedStacks"][0][0],
            "nsAppRunner::Run() (in xul.pdb)"
        );
        assert_eq!(
            response["symbolicatedStacks"][0][1],
            "0x10123 (in wntdll.pdb)"
        );
        assert_eq!(response["knownModules"], serde_json::json!([true, false]));
    }

    #[tokio::test]
    async fn test_negative_module_index_stays_bare_hex() {
        let root = tempfile::tempdir().unwrap();
        let (supplier, _) = StubSupplier::new(&stub_files());
        let scheduler =
            DiskCacheScheduler::start(&config(root.path()), Box::new(supplier)).unwrap();

        let request = ParsedRequest::Symbolication(SymbolicationRequest {
            version: 4,
            memory_map: vec![ModuleId::new("xul.pdb", "44E4")],
            stacks: vec![vec![Frame(-1, 0xb2e3f7), Frame(0, 0xb2e3f7)]],
        });
        let response = scheduler
            .submit(request, "req-1".to_string())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(response["symbolicatedStacks"][0][0], "0xb2e3f7");
        assert_eq!(
            response["symbolicatedStacks"][0][1],
            "nsAppRunner::Run() (in xul.pdb)"
        );
    }

    #[tokio::test]
    async fn test_static_overlay_bypasses_lru() {
        let root = tempfile::tempdir().unwrap();
        let static_dir = tempfile::tempdir().unwrap();
        let sym_path = static_dir.path().join("xul.pdb/44E4/xul.sym");
        std::fs::create_dir_all(sym_path.parent().unwrap()).unwrap();
        std::fs::write(&sym_path, XUL_RAW).unwrap();

        let mut config = config(root.path());
        config.local_symbol_dirs = vec![static_dir.path().to_path_buf()];
        let (supplier, calls) = StubSupplier::new(&[]);
        let scheduler = DiskCacheScheduler::start(&config, Box::new(supplier)).unwrap();

        let request = ParsedRequest::Symbolication(SymbolicationRequest {
            version: 4,
            memory_map: vec![ModuleId::new("xul.pdb", "44E4")],
            stacks: vec![vec![Frame(0, 0xb2f010)]],
        });
        let response = scheduler
            .submit(request, "req-1".to_string())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(response["symbolicatedStacks"][0][0], "XRE_main (in xul.pdb)");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        // Nothing was pulled into the LRU cache directory
        assert!(!root.path().join("xul.pdb").exists());
    }

    /// A supplier that parks on the first xul fetch until the test says go,
    /// so another request can be queued mid-fetch.
    struct GatedSupplier {
        inner: StubSupplier,
        started: crossbeam_channel::Sender<()>,
        release: crossbeam_channel::Receiver<()>,
    }

    impl SymbolSupplier for GatedSupplier {
        fn fetch(&self, module: &ModuleId, file_name: &str) -> Option<Vec<u8>> {
            if module.lib_name == "xul.pdb" {
                let _ = self.started.send(());
                let _ = self.release.recv();
            }
            self.inner.fetch(module, file_name)
        }
    }

    #[tokio::test]
    async fn test_requests_queued_during_fetch_share_later_modules() {
        let root = tempfile::tempdir().unwrap();
        let (inner, calls) = StubSupplier::new(&stub_files());
        let (started_tx, started_rx) = crossbeam_channel::bounded(1);
        let (release_tx, release_rx) = crossbeam_channel::bounded(1);
        let supplier = GatedSupplier {
            inner,
            started: started_tx,
            release: release_rx,
        };
        let scheduler =
            DiskCacheScheduler::start(&config(root.path()), Box::new(supplier)).unwrap();

        // Head request needs xul (slow) then wntdll
        let head = scheduler.submit(two_module_request(), "head".to_string());

        // While the xul fetch is in flight, queue a request that only needs
        // wntdll; it rides along with the head's wntdll pass
        started_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .unwrap();
        let tail_request = ParsedRequest::Symbolication(SymbolicationRequest {
            version: 4,
            memory_map: vec![ModuleId::new("wntdll.pdb", "D74F")],
            stacks: vec![vec![Frame(0, 0x10042)]],
        });
        let tail = scheduler.submit(tail_request, "tail".to_string());
        release_tx.send(()).unwrap();

        let head_response = head.await.unwrap().unwrap();
        let tail_response = tail.await.unwrap().unwrap();

        assert_eq!(head_response["knownModules"], serde_json::json!([true, true]));
        assert_eq!(
            tail_response["symbolicatedStacks"][0][0],
            "KiFastSystemCallRet (in wntdll.pdb)"
        );
        assert_eq!(tail_response["knownModules"], serde_json::json!([true]));
        // One fetch per module across both requests
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_identical_requests_answer_identically() {
        let root = tempfile::tempdir().unwrap();
        let (supplier, _) = StubSupplier::new(&stub_files());
        let scheduler = Arc::new(
            DiskCacheScheduler::start(&config(root.path()), Box::new(supplier)).unwrap(),
        );

        let priming = scheduler
            .submit(two_module_request(), "prime".to_string())
            .await
            .unwrap()
            .unwrap();

        let handles: Vec<_> = (0..32)
            .map(|i| scheduler.submit(two_module_request(), format!("req-{i}")))
            .collect();
        for handle in handles {
            let response = handle.await.unwrap().unwrap();
            assert_eq!(response, priming);
        }
    }

    #[tokio::test]
    async fn test_cancelled_item_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        let (supplier, _) = StubSupplier::new(&stub_files());
        let scheduler =
            DiskCacheScheduler::start(&config(root.path()), Box::new(supplier)).unwrap();

        drop(scheduler.submit(two_module_request(), "cancelled".to_string()));

        let response = scheduler
            .submit(two_module_request(), "live".to_string())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response["knownModules"], serde_json::json!([true, true]));
    }

    #[tokio::test]
    async fn test_failed_add_completes_handle_with_error() {
        let root = tempfile::tempdir().unwrap();
        let (supplier, _) = StubSupplier::new(&stub_files());
        let mut config = config(root.path());
        // Budget below the fixed overhead: every add fails with NoSpace
        config.max_size_mb = 1;
        let scheduler = DiskCacheScheduler::start(&config, Box::new(supplier)).unwrap();

        let result = scheduler
            .submit(two_module_request(), "req-1".to_string())
            .await
            .unwrap();
        assert!(result.is_err());
    }
}
