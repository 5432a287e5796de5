//! # MTDS
//!
//! Tiered offload of inference KV caches.
//!
//! ## Crates
//!
//! - [`mtds_types`]: keys, data types, errors and configuration
//! - [`mtds_memory`]: pooled, reference-counted buffers and allocators
//! - [`mtds_storage`]: storage backends, chunk file format and backend registry
//! - [`mtds_controller`]: control-plane messages, transport and worker
//!
//! This crate ties them together in [`StorageEngine`] and sets up logging.
//!
//! ## Example
//!
//! ```no_run
//! use mtds::{EngineConfig, EngineMetadata, DataType, StorageEngine};
//!
//! let runtime = tokio::runtime::Runtime::new()?;
//! let config = EngineConfig::from_file("mtds.yaml")?;
//! mtds::logging::init_logging(&config.logging.level, &config.logging.format)?;
//!
//! let metadata = EngineMetadata::new("my-model", 1, 0, "vllm", DataType::BF16);
//! let engine = StorageEngine::new(config, metadata, runtime.handle().clone())?;
//! let cached = engine.lookup(&[1, 2, 3]);
//! # let _ = cached;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod engine;
pub mod logging;

pub use engine::{chunk_hashes, StorageEngine, StoreFailure, StoreOutcome};

pub use mtds_controller::{CacheEngine, Worker};
pub use mtds_memory::{
    AllocatorStats, CuFileMemoryAllocator, HostMemoryAllocator, MemoryAllocator, MemoryObject,
    PinnedMemoryAllocator,
};
pub use mtds_storage::{
    create_memory_allocator, create_storage_backends, Completion, GetTask, PutTask,
    StorageBackend, StorageBackends,
};
pub use mtds_types::{
    CacheEngineKey, DataType, EngineConfig, EngineMetadata, MemoryLocation, MtdsError, Result,
};

pub use mtds_controller;
pub use mtds_memory;
pub use mtds_storage;
pub use mtds_types;
