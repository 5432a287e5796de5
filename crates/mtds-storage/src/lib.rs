//! # MTDS Storage
//!
//! Asynchronous put/get of memory objects against persistent media.
//!
//! ## Overview
//!
//! Every medium implements [`StorageBackend`]. Puts and non-blocking gets run
//! on a tokio runtime handed in at construction and report through a
//! [`Completion`], a single-assignment result slot that can be awaited or
//! waited on from a plain thread. At most one put per key is in flight; a
//! second one is rejected with `AlreadyExists`.
//!
//! Files written by the file-backed media start with a fixed-size header in
//! the single-tensor file convention (see [`metadata`]), so third-party
//! readers can open them directly.

pub mod backends;
pub mod completion;
pub mod layout;
pub mod metadata;
pub mod registry;
pub mod traits;

pub use backends::*;
pub use completion::*;
pub use metadata::{pack_metadata, unpack_metadata, PackedMetadata, TensorDescriptor};
pub use registry::*;
pub use traits::*;

pub use mtds_memory::{MemoryAllocator, MemoryObject};
pub use mtds_types::{CacheEngineKey, DataType, MtdsError, Result};

/// Written into the `version` metadata field of every chunk file
pub const FORMAT_VERSION: &str = env!("CARGO_PKG_VERSION");
