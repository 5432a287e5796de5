//! Token-chunk keyed cache engine over the configured storage backends

use mtds_controller::{CacheEngine, KvAdmitMsg, KvEvictMsg, Msg, Worker};
use mtds_memory::{AllocatorStats, MemoryAllocator, MemoryObject};
use mtds_storage::{
    completion, create_memory_allocator, create_storage_backends, Completion, PutTask,
    StorageBackend, StorageBackends,
};
use mtds_types::{CacheEngineKey, EngineConfig, EngineMetadata, MtdsError, Result};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Chained SHA-256 over `tokens`, one hex digest per chunk of `chunk_size`.
///
/// Each digest covers the previous digest and the chunk's tokens, so a hash
/// identifies the whole prefix up to the end of its chunk. A trailing partial
/// chunk gets a hash too.
pub fn chunk_hashes(tokens: &[u32], chunk_size: usize) -> Vec<String> {
    let mut hashes = Vec::with_capacity(tokens.len().div_ceil(chunk_size.max(1)));
    let mut prev: Option<String> = None;
    for chunk in tokens.chunks(chunk_size.max(1)) {
        let mut hasher = Sha256::new();
        if let Some(prev) = &prev {
            hasher.update(prev.as_bytes());
        }
        for token in chunk {
            hasher.update(token.to_le_bytes());
        }
        let digest = hex::encode(hasher.finalize());
        hashes.push(digest.clone());
        prev = Some(digest);
    }
    hashes
}

/// A put that a backend refused at submission
#[derive(Debug)]
pub struct StoreFailure {
    pub backend: String,
    pub key: CacheEngineKey,
    pub error: MtdsError,
}

/// Puts issued by [`StorageEngine::store`].
///
/// Every submitted task is returned even when other tiers refused theirs,
/// so callers can always wait for the writes that do read their objects.
#[derive(Debug, Default)]
pub struct StoreOutcome {
    pub tasks: Vec<PutTask>,
    pub failures: Vec<StoreFailure>,
}

impl StoreOutcome {
    /// Nothing was submitted and nothing failed
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty() && self.failures.is_empty()
    }

    /// Wait for every submitted put, then report the first failure, refused
    /// submissions first
    pub fn wait(self) -> Result<()> {
        let mut first_error = self.failures.into_iter().next().map(|f| f.error);
        for task in self.tasks {
            if let Err(e) = task.wait() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

type WorkerSlot = Arc<Mutex<Option<Worker>>>;

fn notify(worker: &WorkerSlot, msg: Msg) {
    if let Some(worker) = worker.lock().as_ref() {
        if let Err(e) = worker.put_msg(msg) {
            warn!("Dropping cache event: {}", e);
        }
    }
}

/// Stores KV chunks of token sequences across every configured backend
#[derive(Debug)]
pub struct StorageEngine {
    config: EngineConfig,
    metadata: EngineMetadata,
    allocator: Arc<dyn MemoryAllocator>,
    backends: StorageBackends,
    runtime: Handle,
    worker: WorkerSlot,
}

impl StorageEngine {
    /// Build the allocator and backends named by `config`; backend transfers
    /// are scheduled on `runtime`
    pub fn new(config: EngineConfig, metadata: EngineMetadata, runtime: Handle) -> Result<Self> {
        config.validate()?;
        let allocator = create_memory_allocator(&config)?;
        let backends = create_storage_backends(&config, runtime.clone(), allocator.clone())?;
        info!(
            "Storage engine for {} (worker {}/{}) ready with chunk size {}",
            metadata.model_name, metadata.worker_id, metadata.world_size, config.chunk_size
        );
        Ok(Self {
            config,
            metadata,
            allocator,
            backends,
            runtime,
            worker: Arc::new(Mutex::new(None)),
        })
    }

    /// Start the control-plane worker if the controller is enabled.
    ///
    /// The worker only holds a weak handle, so dropping the last `Arc` of the
    /// engine deregisters and stops it.
    pub fn start_worker(self: &Arc<Self>) -> Result<()> {
        if !self.config.enable_controller {
            return Ok(());
        }
        let mut slot = self.worker.lock();
        if slot.is_some() {
            return Err(MtdsError::already_exists("Worker already started"));
        }
        let engine: Arc<dyn CacheEngine> = self.clone();
        let engine: Weak<dyn CacheEngine> = Arc::downgrade(&engine);
        *slot = Some(Worker::new(&self.config, &self.metadata, engine)?);
        Ok(())
    }

    /// Deregister and stop the worker, if one is running
    pub fn close(&self) {
        // Release the slot before joining; the worker thread may be inside
        // `clear`, which takes the same lock to report evictions
        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            worker.close();
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metadata(&self) -> &EngineMetadata {
        &self.metadata
    }

    pub fn backends(&self) -> &StorageBackends {
        &self.backends
    }

    pub fn memory_allocator(&self) -> &Arc<dyn MemoryAllocator> {
        &self.allocator
    }

    pub fn allocator_stats(&self) -> AllocatorStats {
        self.allocator.stats()
    }

    /// One key per chunk of `tokens`
    pub fn keys_for(&self, tokens: &[u32]) -> Vec<CacheEngineKey> {
        chunk_hashes(tokens, self.config.chunk_size)
            .into_iter()
            .map(|hash| self.metadata.key_for(hash))
            .collect()
    }

    fn admit_event(&self, key: &CacheEngineKey, backend: &str) -> Msg {
        KvAdmitMsg {
            instance_id: self.config.instance_id.clone(),
            worker_id: self.metadata.worker_id,
            key: key.to_string(),
            location: backend.to_string(),
        }
        .into()
    }

    fn evict_event(&self, key: &CacheEngineKey, backend: &str) -> Msg {
        KvEvictMsg {
            instance_id: self.config.instance_id.clone(),
            worker_id: self.metadata.worker_id,
            key: key.to_string(),
            location: backend.to_string(),
        }
        .into()
    }

    /// Report the admission once `task` succeeds. Already resolved tasks are
    /// handled inline; the rest are watched on the runtime.
    fn admit_on_success(&self, task: PutTask, admit: Msg) -> PutTask {
        if task.is_done() {
            let result = task.wait();
            if result.is_ok() {
                notify(&self.worker, admit);
            }
            return Completion::ready(result);
        }
        let (resolver, watched) = completion();
        let worker = self.worker.clone();
        self.runtime.spawn(async move {
            let result = task.await;
            if result.is_ok() {
                notify(&worker, admit);
            }
            resolver.resolve(result);
        });
        watched
    }

    /// Put one object per chunk of `tokens` into every backend that does not
    /// already hold it. Chunks beyond `objs.len()` are ignored.
    ///
    /// A backend refusing a put does not stop the others. Wait for every
    /// returned task before reusing `objs`.
    pub fn store(&self, tokens: &[u32], objs: &[MemoryObject]) -> StoreOutcome {
        let mut outcome = StoreOutcome::default();
        for (key, obj) in self.keys_for(tokens).iter().zip(objs) {
            for (name, backend) in self.backends.iter() {
                if backend.contains(key, true) {
                    continue;
                }
                match backend.submit_put_task(key, obj) {
                    Ok(task) => {
                        let admit = self.admit_event(key, name);
                        outcome.tasks.push(self.admit_on_success(task, admit));
                    }
                    Err(error) => {
                        warn!("{} refused chunk {}: {}", name, key, error);
                        outcome.failures.push(StoreFailure {
                            backend: name.to_string(),
                            key: key.clone(),
                            error,
                        });
                    }
                }
            }
        }
        debug!(
            "Submitted {} puts for {} tokens ({} refused)",
            outcome.tasks.len(),
            tokens.len(),
            outcome.failures.len()
        );
        outcome
    }

    fn find(&self, key: &CacheEngineKey) -> Option<&Arc<dyn StorageBackend>> {
        self.backends
            .iter()
            .map(|(_, backend)| backend)
            .find(|backend| backend.contains(key, false))
    }

    /// Number of leading tokens whose chunks are all stored somewhere
    pub fn lookup(&self, tokens: &[u32]) -> usize {
        let chunk_size = self.config.chunk_size;
        let hits = self
            .keys_for(tokens)
            .iter()
            .take_while(|key| self.find(key).is_some())
            .count();
        (hits * chunk_size).min(tokens.len())
    }

    /// Fetch the stored prefix of `tokens`, stopping at the first missing chunk
    pub fn retrieve(&self, tokens: &[u32]) -> Result<Vec<MemoryObject>> {
        let mut objs = Vec::new();
        for key in self.keys_for(tokens) {
            let Some(backend) = self.find(&key) else {
                break;
            };
            objs.push(backend.get_blocking(&key)?);
        }
        Ok(objs)
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        self.close();
    }
}

impl CacheEngine for StorageEngine {
    fn clear(&self, tokens: Option<&[u32]>) -> Result<usize> {
        let mut removed = 0;
        match tokens {
            None => {
                for (name, backend) in self.backends.iter() {
                    for key in backend.keys() {
                        notify(&self.worker, self.evict_event(&key, name));
                    }
                    removed += backend.clear()?;
                }
            }
            Some(tokens) => {
                for key in self.keys_for(tokens) {
                    for (name, backend) in self.backends.iter() {
                        if backend.remove(&key)? {
                            removed += 1;
                            notify(&self.worker, self.evict_event(&key, name));
                        }
                    }
                }
            }
        }
        info!("Cleared {} cache entries", removed);
        Ok(removed)
    }
}
