//! In-memory backend holding chunks in pooled host buffers

use crate::completion::Completion;
use crate::traits::{GetTask, PutTask, PutTaskTracker, StorageBackend};
use mtds_memory::{HostMemoryAllocator, MemoryAllocator, MemoryObject};
use mtds_types::config::LOCAL_CPU_BACKEND;
use mtds_types::{CacheEngineKey, MtdsError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Keeps a private copy of each stored chunk in its own host pool.
///
/// The pool is sized to the byte budget and accounts aligned region sizes,
/// so a full tier rejects puts with `ResourceExhausted` and never drains the
/// shared allocator that gets are served from. Puts complete before
/// `submit_put_task` returns, so a put is never observable as in flight.
#[derive(Debug)]
pub struct LocalCPUBackend {
    allocator: Arc<dyn MemoryAllocator>,
    store_allocator: HostMemoryAllocator,
    entries: RwLock<HashMap<CacheEngineKey, MemoryObject>>,
    put_tasks: PutTaskTracker,
}

impl LocalCPUBackend {
    /// `allocator` serves gets; stored copies live in a separate pool of
    /// `capacity_bytes`
    pub fn new(allocator: Arc<dyn MemoryAllocator>, capacity_bytes: u64) -> Result<Self> {
        let capacity = usize::try_from(capacity_bytes).map_err(|_| {
            MtdsError::config(format!(
                "{} budget of {} bytes is too large",
                LOCAL_CPU_BACKEND, capacity_bytes
            ))
        })?;
        let store_allocator = HostMemoryAllocator::new(capacity)?;
        info!(
            "Created {} with a budget of {} bytes, gets served by {}",
            LOCAL_CPU_BACKEND,
            capacity_bytes,
            allocator.name()
        );
        Ok(Self {
            allocator,
            store_allocator,
            entries: RwLock::new(HashMap::new()),
            put_tasks: PutTaskTracker::new(),
        })
    }

    /// Bytes held by stored chunks, alignment included
    pub fn used_bytes(&self) -> u64 {
        self.store_allocator.stats().leased_bytes as u64
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.store_allocator.stats().capacity_bytes as u64
    }

    fn stored(&self, key: &CacheEngineKey) -> Result<MemoryObject> {
        self.entries.read().get(key).cloned().ok_or_else(|| {
            MtdsError::not_found(format!("{} has no chunk {}", LOCAL_CPU_BACKEND, key))
        })
    }

    fn copy_out(&self, stored: &MemoryObject) -> Result<MemoryObject> {
        let fresh = self.allocator.allocate(stored.shape(), stored.dtype())?;
        fresh.copy_from_slice(&stored.data())?;
        Ok(fresh)
    }
}

impl StorageBackend for LocalCPUBackend {
    fn name(&self) -> &str {
        LOCAL_CPU_BACKEND
    }

    fn contains(&self, key: &CacheEngineKey, check_in_flight: bool) -> bool {
        self.entries.read().contains_key(key)
            || (check_in_flight && self.put_tasks.contains(key))
    }

    fn exists_in_put_tasks(&self, key: &CacheEngineKey) -> bool {
        self.put_tasks.contains(key)
    }

    fn submit_put_task(&self, key: &CacheEngineKey, obj: &MemoryObject) -> Result<PutTask> {
        let guard = self.put_tasks.begin(key)?;
        let existing = self.entries.read().get(key).cloned();
        let copy = match existing {
            // Stored copies are never handed out, so the region can be rewritten
            Some(old) if old.shape() == obj.shape() && old.dtype() == obj.dtype() => old,
            _ => {
                // Free the old region first so an overwrite fits in the budget
                self.entries.write().remove(key);
                self.store_allocator.allocate(obj.shape(), obj.dtype())?
            }
        };
        copy.copy_from_slice(&obj.data())?;
        self.entries.write().insert(key.clone(), copy);
        drop(guard);
        debug!("{} stored {}", LOCAL_CPU_BACKEND, key);
        Ok(Completion::ready(Ok(())))
    }

    fn get_blocking(&self, key: &CacheEngineKey) -> Result<MemoryObject> {
        self.copy_out(&self.stored(key)?)
    }

    fn get_non_blocking(&self, key: &CacheEngineKey) -> Result<GetTask> {
        let stored = self.stored(key)?;
        Ok(Completion::ready(self.copy_out(&stored)))
    }

    fn remove(&self, key: &CacheEngineKey) -> Result<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }

    fn clear(&self) -> Result<usize> {
        let mut entries = self.entries.write();
        let removed = entries.len();
        entries.clear();
        Ok(removed)
    }

    fn keys(&self) -> Vec<CacheEngineKey> {
        self.entries.read().keys().cloned().collect()
    }

    fn memory_allocator(&self) -> &Arc<dyn MemoryAllocator> {
        &self.allocator
    }
}
