//! Backend registry: builds the configured backends by name

use crate::backends::{FileBackend, FileBackendConfig, FileMedium, LocalCPUBackend};
use crate::traits::StorageBackend;
use mtds_memory::{CuFileMemoryAllocator, MemoryAllocator, PinnedMemoryAllocator};
use mtds_types::config::{GDS_BACKEND, LOCAL_CPU_BACKEND, LOCAL_DISK_BACKEND, WEKA_GDS_BACKEND};
use mtds_types::{EngineConfig, MtdsError, Result};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::info;

const GIB: f64 = (1u64 << 30) as f64;

/// Device the registered transfer buffers live on
const CUFILE_DEVICE_KEY: &str = "cufile_device";

/// Backends in construction order, addressable by name
#[derive(Debug, Clone, Default)]
pub struct StorageBackends {
    backends: Vec<(String, Arc<dyn StorageBackend>)>,
}

impl StorageBackends {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a backend; a second backend under the same name is rejected
    pub fn insert(&mut self, name: impl Into<String>, backend: Arc<dyn StorageBackend>) -> Result<()> {
        let name = name.into();
        if self.contains_key(&name) {
            return Err(MtdsError::config(format!("Backend {} configured twice", name)));
        }
        self.backends.push((name, backend));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn StorageBackend>> {
        self.backends
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, backend)| backend)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.backends.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn StorageBackend>)> {
        self.backends.iter().map(|(n, b)| (n.as_str(), b))
    }
}

fn extra_usize(config: &EngineConfig, key: &str) -> Result<Option<usize>> {
    let Some(raw) = config.extra_config.as_ref().and_then(|m| m.get(key)) else {
        return Ok(None);
    };
    raw.parse()
        .map(Some)
        .map_err(|_| MtdsError::config(format!("extra_config {} must be an integer, got {:?}", key, raw)))
}

/// Allocator shared by every backend of `config`.
///
/// Direct-storage backends need buffers registered with the driver, so any
/// of them in the backend list selects the cuFile allocator sized by
/// `cufile_buffer_size`; otherwise buffers come from pinned host memory sized
/// by `max_local_cpu_size`.
pub fn create_memory_allocator(config: &EngineConfig) -> Result<Arc<dyn MemoryAllocator>> {
    if config.uses_cufile() {
        let mib = config.cufile_buffer_size.ok_or_else(|| {
            MtdsError::config("cufile_buffer_size must be set for direct-storage backends")
        })?;
        let device = extra_usize(config, CUFILE_DEVICE_KEY)?.unwrap_or(0);
        return Ok(Arc::new(CuFileMemoryAllocator::with_tracking(mib, device)?));
    }
    let allocator = PinnedMemoryAllocator::with_gib(config.max_local_cpu_size)
        .map_err(|e| MtdsError::config(format!("Invalid max_local_cpu_size: {}", e)))?;
    Ok(Arc::new(allocator))
}

fn file_backend(
    config: &EngineConfig,
    medium: FileMedium,
    root: Option<&String>,
    runtime: &Handle,
    allocator: &Arc<dyn MemoryAllocator>,
) -> Result<Arc<dyn StorageBackend>> {
    let name = medium.backend_name();
    let root = root.ok_or_else(|| MtdsError::config(format!("{} has no root path configured", name)))?;

    let mut backend_config = FileBackendConfig::new(medium, root);
    let concurrency_key = format!("{}_io_concurrency", name);
    if let Some(n) = extra_usize(config, &concurrency_key)? {
        backend_config = backend_config.with_io_concurrency(n);
    }
    if medium == FileMedium::LocalDisk {
        backend_config =
            backend_config.with_capacity_bytes((config.max_local_disk_size * GIB) as u64);
    }
    Ok(Arc::new(FileBackend::new(
        backend_config,
        runtime.clone(),
        allocator.clone(),
    )?))
}

/// Build every backend named by `config`, all sharing `allocator` and
/// scheduling their transfers on `runtime`. The CPU tier keeps its stored
/// chunks in a pool of its own and only uses `allocator` for gets.
///
/// Any unsupported or misconfigured backend aborts the whole construction.
pub fn create_storage_backends(
    config: &EngineConfig,
    runtime: Handle,
    allocator: Arc<dyn MemoryAllocator>,
) -> Result<StorageBackends> {
    config.validate()?;

    let mut backends = StorageBackends::new();
    for name in config.backend_names() {
        let backend: Arc<dyn StorageBackend> = match name.as_str() {
            LOCAL_CPU_BACKEND => Arc::new(
                LocalCPUBackend::new(allocator.clone(), (config.max_local_cpu_size * GIB) as u64)
                    .map_err(|e| MtdsError::config(format!("Invalid max_local_cpu_size: {}", e)))?,
            ),
            LOCAL_DISK_BACKEND => file_backend(
                config,
                FileMedium::LocalDisk,
                config.local_disk.as_ref(),
                &runtime,
                &allocator,
            )?,
            GDS_BACKEND => file_backend(
                config,
                FileMedium::Gds,
                config.gds_path.as_ref(),
                &runtime,
                &allocator,
            )?,
            WEKA_GDS_BACKEND => file_backend(
                config,
                FileMedium::WekaGds,
                config.weka_path.as_ref(),
                &runtime,
                &allocator,
            )?,
            other => {
                return Err(MtdsError::config(format!(
                    "Unsupported storage backend: {}",
                    other
                )))
            }
        };
        backends.insert(name, backend)?;
    }

    info!(
        "Created storage backends [{}] on {}",
        backends.names().join(", "),
        allocator.name()
    );
    Ok(backends)
}
