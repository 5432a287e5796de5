//! File-backed storage media
//!
//! One implementation serves the direct-storage backend, its
//! network-filesystem variant and the plain local-disk backend. They differ
//! in name, root path, transfer concurrency, capacity budget and which
//! allocators they accept.

use crate::completion::completion;
use crate::layout::{chunk_path, key_from_path, TMP_SUFFIX};
use crate::metadata::{pack_metadata, TensorDescriptor, METADATA_REGION_BYTES};
use crate::backends::transfer::{DirectTransfer, PosixTransfer};
use crate::traits::{GetTask, PutTask, PutTaskTracker, StorageBackend};
use crate::FORMAT_VERSION;
use mtds_memory::{CuFileMemoryAllocator, MemoryAllocator, MemoryObject};
use mtds_types::config::{GDS_BACKEND, LOCAL_DISK_BACKEND, WEKA_GDS_BACKEND};
use mtds_types::{CacheEngineKey, MtdsError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Kind of medium behind a [`FileBackend`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileMedium {
    /// Local NVMe reached through direct storage
    Gds,
    /// Network filesystem mount reached through direct storage
    WekaGds,
    /// Ordinary host filesystem
    LocalDisk,
}

impl FileMedium {
    pub fn backend_name(&self) -> &'static str {
        match self {
            FileMedium::Gds => GDS_BACKEND,
            FileMedium::WekaGds => WEKA_GDS_BACKEND,
            FileMedium::LocalDisk => LOCAL_DISK_BACKEND,
        }
    }

    /// Transfers allowed in flight at once
    pub fn default_io_concurrency(&self) -> usize {
        match self {
            FileMedium::Gds => 1,
            FileMedium::WekaGds => 4,
            FileMedium::LocalDisk => 1,
        }
    }

    /// Whether the medium needs driver-registered buffers
    pub fn requires_registered_buffers(&self) -> bool {
        matches!(self, FileMedium::Gds | FileMedium::WekaGds)
    }
}

/// Construction parameters of a [`FileBackend`]
#[derive(Debug, Clone)]
pub struct FileBackendConfig {
    pub medium: FileMedium,
    pub root: PathBuf,
    pub io_concurrency: usize,
    /// Upper bound on bytes stored, headers included
    pub capacity_bytes: Option<u64>,
}

impl FileBackendConfig {
    pub fn new(medium: FileMedium, root: impl Into<PathBuf>) -> Self {
        Self {
            medium,
            root: root.into(),
            io_concurrency: medium.default_io_concurrency(),
            capacity_bytes: None,
        }
    }

    pub fn with_io_concurrency(mut self, io_concurrency: usize) -> Self {
        self.io_concurrency = io_concurrency;
        self
    }

    pub fn with_capacity_bytes(mut self, capacity_bytes: u64) -> Self {
        self.capacity_bytes = Some(capacity_bytes);
        self
    }
}

#[derive(Debug, Clone)]
struct ChunkEntry {
    path: PathBuf,
    stored_bytes: u64,
}

/// Durable index plus byte accounting
#[derive(Debug, Default)]
struct FileStore {
    entries: HashMap<CacheEngineKey, ChunkEntry>,
    used_bytes: u64,
    reserved_bytes: u64,
}

#[derive(Debug)]
struct FileBackendInner {
    medium: FileMedium,
    root: PathBuf,
    capacity_bytes: Option<u64>,
    transfer: Arc<dyn DirectTransfer>,
    allocator: Arc<dyn MemoryAllocator>,
    store: RwLock<FileStore>,
    put_tasks: PutTaskTracker,
    io_permits: Arc<Semaphore>,
}

/// Space held for a put until it either lands or fails
struct Reservation {
    inner: Arc<FileBackendInner>,
    bytes: u64,
}

impl Reservation {
    fn commit(mut self, key: CacheEngineKey, path: PathBuf) {
        let mut store = self.inner.store.write();
        store.reserved_bytes -= self.bytes;
        store.used_bytes += self.bytes;
        if let Some(old) = store.entries.insert(
            key,
            ChunkEntry {
                path,
                stored_bytes: self.bytes,
            },
        ) {
            store.used_bytes -= old.stored_bytes;
        }
        drop(store);
        self.bytes = 0;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.inner.store.write().reserved_bytes -= self.bytes;
    }
}

/// Storage backend keeping one file per chunk under a root directory
#[derive(Debug)]
pub struct FileBackend {
    inner: Arc<FileBackendInner>,
    runtime: Handle,
}

impl FileBackend {
    /// Build a backend over `config.root`, rebuilding the index from any
    /// chunk files already present
    pub fn new(
        config: FileBackendConfig,
        runtime: Handle,
        allocator: Arc<dyn MemoryAllocator>,
    ) -> Result<Self> {
        Self::with_transfer(config, runtime, allocator, Arc::new(PosixTransfer))
    }

    pub fn with_transfer(
        config: FileBackendConfig,
        runtime: Handle,
        allocator: Arc<dyn MemoryAllocator>,
        transfer: Arc<dyn DirectTransfer>,
    ) -> Result<Self> {
        let name = config.medium.backend_name();
        if config.io_concurrency == 0 {
            return Err(MtdsError::config(format!(
                "{} needs an I/O concurrency of at least 1",
                name
            )));
        }
        if config.medium.requires_registered_buffers()
            && allocator
                .as_any()
                .downcast_ref::<CuFileMemoryAllocator>()
                .is_none()
        {
            return Err(MtdsError::config(format!(
                "{} requires a CuFileMemoryAllocator, got {}",
                name,
                allocator.name()
            )));
        }
        fs::create_dir_all(&config.root).map_err(|e| {
            MtdsError::config(format!(
                "Cannot create {} root {}: {}",
                name,
                config.root.display(),
                e
            ))
        })?;

        let inner = Arc::new(FileBackendInner {
            medium: config.medium,
            root: config.root,
            capacity_bytes: config.capacity_bytes,
            transfer,
            allocator,
            store: RwLock::new(FileStore::default()),
            put_tasks: PutTaskTracker::new(),
            io_permits: Arc::new(Semaphore::new(config.io_concurrency)),
        });
        let recovered = inner.recover()?;
        info!(
            "Created {} at {} ({} transfer, {} chunks recovered)",
            name,
            inner.root.display(),
            inner.transfer.name(),
            recovered
        );
        Ok(Self { inner, runtime })
    }

    pub fn medium(&self) -> FileMedium {
        self.inner.medium
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Bytes held by durable chunks, headers included
    pub fn used_bytes(&self) -> u64 {
        self.inner.store.read().used_bytes
    }
}

impl FileBackendInner {
    fn name(&self) -> &'static str {
        self.medium.backend_name()
    }

    /// Walk the root and index every readable chunk file. Unreadable
    /// subdirectories and malformed chunks are skipped.
    fn recover(&self) -> Result<usize> {
        let mut pending = vec![self.root.clone()];
        let mut store = self.store.write();
        while let Some(dir) = pending.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if dir == self.root => return Err(e.into()),
                Err(e) => {
                    warn!("Skipping unreadable directory {}: {}", dir.display(), e);
                    continue;
                }
            };
            for entry in entries {
                let path = match entry {
                    Ok(entry) => entry.path(),
                    Err(e) => {
                        warn!("Skipping entry of {}: {}", dir.display(), e);
                        continue;
                    }
                };
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }
                if path.to_string_lossy().ends_with(TMP_SUFFIX) {
                    debug!("Removing stale staging file {}", path.display());
                    if let Err(e) = fs::remove_file(&path) {
                        warn!("Failed to remove {}: {}", path.display(), e);
                    }
                    continue;
                }
                let key = match key_from_path(&path) {
                    Some(Ok(key)) => key,
                    Some(Err(e)) => {
                        warn!("Skipping chunk file {}: {}", path.display(), e);
                        continue;
                    }
                    None => continue,
                };
                match self.transfer.read_header(&path) {
                    Ok(meta) => {
                        let stored_bytes =
                            (meta.nbytes as u64).saturating_add(METADATA_REGION_BYTES as u64);
                        store.used_bytes = store.used_bytes.saturating_add(stored_bytes);
                        store.entries.insert(key, ChunkEntry { path, stored_bytes });
                    }
                    Err(e) => warn!("Skipping unreadable chunk {}: {}", path.display(), e),
                }
            }
        }
        Ok(store.entries.len())
    }

    /// Hold `bytes` for a put of `key`. An entry the put will replace is
    /// netted out, since its space is released on commit.
    fn reserve(self: &Arc<Self>, key: &CacheEngineKey, bytes: u64) -> Result<Reservation> {
        let mut store = self.store.write();
        if let Some(capacity) = self.capacity_bytes {
            let replaced = store.entries.get(key).map_or(0, |e| e.stored_bytes);
            let needed = (store.used_bytes + store.reserved_bytes + bytes).saturating_sub(replaced);
            if needed > capacity {
                return Err(MtdsError::resource_exhausted(format!(
                    "{} budget of {} bytes cannot take {} more ({} in use)",
                    self.name(),
                    capacity,
                    bytes,
                    store.used_bytes + store.reserved_bytes
                )));
            }
        }
        store.reserved_bytes += bytes;
        Ok(Reservation {
            inner: self.clone(),
            bytes,
        })
    }

    fn lookup(&self, key: &CacheEngineKey) -> Result<PathBuf> {
        self.store
            .read()
            .entries
            .get(key)
            .map(|entry| entry.path.clone())
            .ok_or_else(|| MtdsError::not_found(format!("{} has no chunk {}", self.name(), key)))
    }

    fn unlink(&self, entry: &ChunkEntry) -> Result<()> {
        match fs::remove_file(&entry.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn join_error(e: tokio::task::JoinError) -> MtdsError {
    if e.is_cancelled() {
        MtdsError::cancelled("transfer task cancelled")
    } else {
        MtdsError::internal(format!("transfer task panicked: {}", e))
    }
}

impl StorageBackend for FileBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn contains(&self, key: &CacheEngineKey, check_in_flight: bool) -> bool {
        if self.inner.store.read().entries.contains_key(key) {
            return true;
        }
        check_in_flight && self.inner.put_tasks.contains(key)
    }

    fn exists_in_put_tasks(&self, key: &CacheEngineKey) -> bool {
        self.inner.put_tasks.contains(key)
    }

    fn submit_put_task(&self, key: &CacheEngineKey, obj: &MemoryObject) -> Result<PutTask> {
        let guard = self.inner.put_tasks.begin(key)?;
        let header = pack_metadata(
            &TensorDescriptor::new(obj.shape(), obj.dtype()),
            FORMAT_VERSION,
        )?;
        let reservation = self
            .inner
            .reserve(key, (header.len() + obj.size_bytes()) as u64)?;

        let (resolver, task) = completion();
        let inner = self.inner.clone();
        let key = key.clone();
        let obj = obj.clone();
        self.runtime.spawn(async move {
            let result: Result<PathBuf> = async {
                let _permit = inner
                    .io_permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| MtdsError::cancelled("I/O permits closed"))?;
                let path = chunk_path(&inner.root, &key);
                let transfer = inner.transfer.clone();
                let target = path.clone();
                tokio::task::spawn_blocking(move || transfer.write(&target, &header, &obj))
                    .await
                    .map_err(join_error)??;
                Ok::<_, MtdsError>(path)
            }
            .await;

            let result = match result {
                Ok(path) => {
                    debug!("{} stored {}", inner.name(), key);
                    reservation.commit(key, path);
                    Ok(())
                }
                Err(e) => {
                    error!("{} failed to store {}: {}", inner.name(), key, e);
                    drop(reservation);
                    Err(e)
                }
            };
            drop(guard);
            resolver.resolve(result);
        });
        Ok(task)
    }

    fn get_blocking(&self, key: &CacheEngineKey) -> Result<MemoryObject> {
        let path = self.inner.lookup(key)?;
        self.inner
            .transfer
            .read(&path, self.inner.allocator.as_ref())
    }

    fn get_non_blocking(&self, key: &CacheEngineKey) -> Result<GetTask> {
        let path = self.inner.lookup(key)?;
        let (resolver, task) = completion();
        let inner = self.inner.clone();
        self.runtime.spawn(async move {
            let result: Result<MemoryObject> = async {
                let _permit = inner
                    .io_permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| MtdsError::cancelled("I/O permits closed"))?;
                let transfer = inner.transfer.clone();
                let allocator = inner.allocator.clone();
                tokio::task::spawn_blocking(move || transfer.read(&path, allocator.as_ref()))
                    .await
                    .map_err(join_error)?
            }
            .await;
            resolver.resolve(result);
        });
        Ok(task)
    }

    fn remove(&self, key: &CacheEngineKey) -> Result<bool> {
        let entry = {
            let mut store = self.inner.store.write();
            match store.entries.remove(key) {
                Some(entry) => {
                    store.used_bytes -= entry.stored_bytes;
                    entry
                }
                None => return Ok(false),
            }
        };
        self.inner.unlink(&entry)?;
        Ok(true)
    }

    fn clear(&self) -> Result<usize> {
        let entries: Vec<ChunkEntry> = {
            let mut store = self.inner.store.write();
            store.used_bytes = 0;
            store.entries.drain().map(|(_, entry)| entry).collect()
        };
        let mut removed = 0;
        for entry in &entries {
            match self.inner.unlink(entry) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to delete {}: {}", entry.path.display(), e),
            }
        }
        info!("{} cleared {} chunks", self.inner.name(), removed);
        Ok(removed)
    }

    fn keys(&self) -> Vec<CacheEngineKey> {
        self.inner.store.read().entries.keys().cloned().collect()
    }

    fn memory_allocator(&self) -> &Arc<dyn MemoryAllocator> {
        &self.inner.allocator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mtds_memory::HostMemoryAllocator;
    use mtds_types::DataType;
    use tempfile::TempDir;

    fn key(hash: &str) -> CacheEngineKey {
        CacheEngineKey::new("vllm", "model", 1, 0, hash)
    }

    fn host_allocator() -> Arc<dyn MemoryAllocator> {
        Arc::new(HostMemoryAllocator::new(1 << 24).unwrap())
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn test_direct_storage_requires_cufile_allocator() {
        let dir = TempDir::new().unwrap();
        let rt = runtime();
        let err = FileBackend::new(
            FileBackendConfig::new(FileMedium::Gds, dir.path()),
            rt.handle().clone(),
            host_allocator(),
        )
        .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_budget_rejects_oversized_put() {
        let dir = TempDir::new().unwrap();
        let rt = runtime();
        let alloc = host_allocator();
        let backend = FileBackend::new(
            FileBackendConfig::new(FileMedium::LocalDisk, dir.path())
                .with_capacity_bytes(METADATA_REGION_BYTES as u64 + 1024),
            rt.handle().clone(),
            alloc.clone(),
        )
        .unwrap();

        let small = alloc.allocate(&[1024], DataType::U8).unwrap();
        backend.submit_put_task(&key("a"), &small).unwrap().wait().unwrap();
        assert_eq!(backend.used_bytes(), METADATA_REGION_BYTES as u64 + 1024);

        let err = backend.submit_put_task(&key("b"), &small).unwrap_err();
        assert!(matches!(err, MtdsError::ResourceExhausted { .. }));
        assert!(!backend.exists_in_put_tasks(&key("b")));

        assert!(backend.remove(&key("a")).unwrap());
        assert_eq!(backend.used_bytes(), 0);
        backend.submit_put_task(&key("b"), &small).unwrap().wait().unwrap();
    }

    #[test]
    fn test_overwrite_within_budget() {
        let dir = TempDir::new().unwrap();
        let rt = runtime();
        let alloc = host_allocator();
        let chunk = METADATA_REGION_BYTES as u64 + 1024;
        let backend = FileBackend::new(
            FileBackendConfig::new(FileMedium::LocalDisk, dir.path()).with_capacity_bytes(chunk),
            rt.handle().clone(),
            alloc.clone(),
        )
        .unwrap();

        let obj = alloc.allocate(&[1024], DataType::U8).unwrap();
        obj.data_mut().fill(1);
        backend.submit_put_task(&key("a"), &obj).unwrap().wait().unwrap();
        obj.data_mut().fill(2);
        backend.submit_put_task(&key("a"), &obj).unwrap().wait().unwrap();
        assert_eq!(backend.used_bytes(), chunk);
        assert!(backend
            .get_blocking(&key("a"))
            .unwrap()
            .data()
            .iter()
            .all(|&b| b == 2));
    }

    #[test]
    fn test_recovery_skips_overflowing_header() {
        let dir = TempDir::new().unwrap();
        let rt = runtime();
        let k = key("corrupt");
        let path = chunk_path(dir.path(), &k);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let json =
            br#"{"kvcache":{"dtype":"U8","shape":[4294967296,4294967296,16],"data_offsets":[0,0]}}"#;
        let mut bytes = (json.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(json);
        fs::write(&path, bytes).unwrap();

        let backend = FileBackend::new(
            FileBackendConfig::new(FileMedium::LocalDisk, dir.path()),
            rt.handle().clone(),
            host_allocator(),
        )
        .unwrap();
        assert!(!backend.contains(&k, false));
        assert_eq!(backend.used_bytes(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_recovery_skips_unreadable_directory() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let rt = runtime();
        let locked = dir.path().join("zz");
        fs::create_dir(&locked).unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        if fs::read_dir(&locked).is_ok() {
            // Permissions are not enforced for this user
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let backend = FileBackend::new(
            FileBackendConfig::new(FileMedium::LocalDisk, dir.path()),
            rt.handle().clone(),
            host_allocator(),
        );
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
        assert!(backend.unwrap().keys().is_empty());
    }

    #[test]
    fn test_failed_put_clears_in_flight_entry() {
        let dir = TempDir::new().unwrap();
        let rt = runtime();
        let alloc = host_allocator();
        let backend = FileBackend::new(
            FileBackendConfig::new(FileMedium::LocalDisk, dir.path()),
            rt.handle().clone(),
            alloc.clone(),
        )
        .unwrap();

        // A regular file where the shard directory should be makes the write fail
        let k = key("blocked");
        let path = chunk_path(dir.path(), &k);
        let shard = path.parent().unwrap().parent().unwrap();
        fs::write(shard, b"not a directory").unwrap();

        let obj = alloc.allocate(&[64], DataType::U8).unwrap();
        let err = backend.submit_put_task(&k, &obj).unwrap().wait().unwrap_err();
        assert!(matches!(err, MtdsError::IO { .. }));
        assert!(!backend.exists_in_put_tasks(&k));
        assert!(!backend.contains(&k, true));
    }

    #[test]
    fn test_clear_and_keys() {
        let dir = TempDir::new().unwrap();
        let rt = runtime();
        let alloc = host_allocator();
        let backend = FileBackend::new(
            FileBackendConfig::new(FileMedium::LocalDisk, dir.path()),
            rt.handle().clone(),
            alloc.clone(),
        )
        .unwrap();

        let obj = alloc.allocate(&[8], DataType::U8).unwrap();
        for h in ["a", "b", "c"] {
            backend.submit_put_task(&key(h), &obj).unwrap().wait().unwrap();
        }
        let mut keys = backend.keys();
        keys.sort();
        assert_eq!(keys, vec![key("a"), key("b"), key("c")]);

        assert_eq!(backend.clear().unwrap(), 3);
        assert!(backend.keys().is_empty());
        assert!(!chunk_path(dir.path(), &key("a")).exists());
        assert!(!backend.remove(&key("a")).unwrap());
    }
}
