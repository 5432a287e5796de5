//! Storage backend interface and in-flight put bookkeeping

use crate::completion::Completion;
use mtds_memory::{MemoryAllocator, MemoryObject};
use mtds_types::{CacheEngineKey, MtdsError, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Resolves once the put is durable
pub type PutTask = Completion<()>;
/// Resolves to a freshly allocated object holding the stored bytes
pub type GetTask = Completion<MemoryObject>;

/// A medium that stores memory objects under cache keys.
///
/// `submit_put_task` and `get_non_blocking` never block the caller; work runs
/// on the runtime the backend was built with. Only `get_blocking` may block.
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Registry name of this backend
    fn name(&self) -> &str;

    /// Whether `key` is durably stored, or, with `check_in_flight`, being put
    fn contains(&self, key: &CacheEngineKey, check_in_flight: bool) -> bool;

    /// Whether a put for `key` has been submitted and not yet resolved
    fn exists_in_put_tasks(&self, key: &CacheEngineKey) -> bool;

    /// Start writing `obj` under `key`.
    ///
    /// Fails with `AlreadyExists` if a put for `key` is still in flight. The
    /// caller keeps `obj` alive; the backend holds its own handle only until
    /// the task resolves.
    fn submit_put_task(&self, key: &CacheEngineKey, obj: &MemoryObject) -> Result<PutTask>;

    /// Fetch a stored object, blocking the calling thread
    fn get_blocking(&self, key: &CacheEngineKey) -> Result<MemoryObject>;

    /// Fetch a stored object asynchronously. Absent keys fail immediately.
    fn get_non_blocking(&self, key: &CacheEngineKey) -> Result<GetTask>;

    /// Drop one stored entry; returns whether anything was removed
    fn remove(&self, key: &CacheEngineKey) -> Result<bool>;

    /// Drop every stored entry; returns how many were removed
    fn clear(&self) -> Result<usize>;

    /// Keys currently stored
    fn keys(&self) -> Vec<CacheEngineKey>;

    /// Allocator used for objects returned by gets
    fn memory_allocator(&self) -> &Arc<dyn MemoryAllocator>;
}

/// Set of keys with an outstanding put
#[derive(Debug, Default, Clone)]
pub struct PutTaskTracker {
    keys: Arc<Mutex<HashSet<CacheEngineKey>>>,
}

impl PutTaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `key` in flight, rejecting a second concurrent put
    pub fn begin(&self, key: &CacheEngineKey) -> Result<PutTaskGuard> {
        if !self.keys.lock().insert(key.clone()) {
            return Err(MtdsError::already_exists(format!(
                "Put for {} is already in flight",
                key
            )));
        }
        Ok(PutTaskGuard {
            keys: self.keys.clone(),
            key: key.clone(),
        })
    }

    pub fn contains(&self, key: &CacheEngineKey) -> bool {
        self.keys.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }
}

/// Clears the in-flight entry when dropped, whatever the put's outcome
#[derive(Debug)]
pub struct PutTaskGuard {
    keys: Arc<Mutex<HashSet<CacheEngineKey>>>,
    key: CacheEngineKey,
}

impl PutTaskGuard {
    pub fn key(&self) -> &CacheEngineKey {
        &self.key
    }
}

impl Drop for PutTaskGuard {
    fn drop(&mut self) {
        self.keys.lock().remove(&self.key);
    }
}
