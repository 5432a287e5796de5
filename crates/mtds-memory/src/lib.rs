//! # MTDS Memory
//!
//! Reusable typed buffers for zero-copy cache I/O.
//!
//! Buffers are carved from a [`BufferPool`] and handed out as
//! [`MemoryObject`] handles. Cloning a handle bumps a reference count; when
//! the last handle is dropped the backing region goes back to the pool's idle
//! list instead of being freed, so expensive device or pinned allocations are
//! paid for once.

pub mod allocator;
pub mod object;
pub mod pool;
pub mod stats;

pub use allocator::*;
pub use object::*;
pub use pool::*;
pub use stats::*;

pub use mtds_types::{DataType, MemoryLocation, MtdsError, Result};
