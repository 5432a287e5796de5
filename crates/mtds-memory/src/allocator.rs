//! Memory allocators handing out pooled memory objects

use crate::object::{MemoryObjMetadata, MemoryObject};
use crate::pool::{BufferPool, BufferPoolConfig, BufferRegistrar};
use crate::stats::AllocatorStats;
use mtds_types::{DataType, MemoryLocation, MtdsError, Result};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Host allocations are aligned for vectorised copies
pub const HOST_ALIGNMENT: usize = 64;
/// Pinned and registered allocations are page aligned for direct I/O
pub const PAGE_ALIGNMENT: usize = 4096;

const GIB: f64 = (1u64 << 30) as f64;
const MIB: usize = 1 << 20;

/// Source of memory objects shared by storage backends.
///
/// `allocate` never blocks: when the pool cannot satisfy a request it fails
/// with a retryable `ResourceExhausted` error and the caller decides whether
/// to back off.
pub trait MemoryAllocator: Send + Sync + fmt::Debug {
    /// Lease a buffer able to hold a dense `shape` tensor of `dtype`
    fn allocate(&self, shape: &[usize], dtype: DataType) -> Result<MemoryObject>;

    /// Give a handle back. The region returns to the pool once no other
    /// handle references it.
    fn release(&self, obj: MemoryObject) {
        drop(obj);
    }

    /// Location of every buffer this allocator hands out
    fn location(&self) -> MemoryLocation;

    fn stats(&self) -> AllocatorStats;

    /// Allocator type name, for logs
    fn name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;
}

fn allocate_from(pool: &Arc<BufferPool>, shape: &[usize], dtype: DataType) -> Result<MemoryObject> {
    if shape.is_empty() {
        return Err(MtdsError::invalid_parameter("Shape must have at least one dimension"));
    }
    let metadata = MemoryObjMetadata::new(shape, dtype, pool.location())?;
    let buffer = pool.lease(metadata.size_bytes)?;
    Ok(MemoryObject::leased(metadata, buffer, pool.clone()))
}

fn gib_to_bytes(gib: f64) -> Result<usize> {
    if !(gib > 0.0) {
        return Err(MtdsError::invalid_parameter(format!(
            "Memory budget must be positive, got {} GiB",
            gib
        )));
    }
    Ok((gib * GIB) as usize)
}

/// Allocator over ordinary pageable host memory
#[derive(Debug)]
pub struct HostMemoryAllocator {
    pool: Arc<BufferPool>,
}

impl HostMemoryAllocator {
    pub fn new(capacity_bytes: usize) -> Result<Self> {
        let pool = BufferPool::new(
            BufferPoolConfig {
                location: MemoryLocation::Host,
                capacity_bytes,
                alignment: HOST_ALIGNMENT,
            },
            None,
        )?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }
}

impl MemoryAllocator for HostMemoryAllocator {
    fn allocate(&self, shape: &[usize], dtype: DataType) -> Result<MemoryObject> {
        allocate_from(&self.pool, shape, dtype)
    }

    fn location(&self) -> MemoryLocation {
        MemoryLocation::Host
    }

    fn stats(&self) -> AllocatorStats {
        self.pool.stats()
    }

    fn name(&self) -> &'static str {
        "HostMemoryAllocator"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Allocator over page-locked host memory
#[derive(Debug)]
pub struct PinnedMemoryAllocator {
    pool: Arc<BufferPool>,
}

impl PinnedMemoryAllocator {
    pub fn new(capacity_bytes: usize) -> Result<Self> {
        let pool = BufferPool::new(
            BufferPoolConfig {
                location: MemoryLocation::PinnedHost,
                capacity_bytes,
                alignment: PAGE_ALIGNMENT,
            },
            None,
        )?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Size the pool from a GiB budget
    pub fn with_gib(gib: f64) -> Result<Self> {
        Self::new(gib_to_bytes(gib)?)
    }
}

impl MemoryAllocator for PinnedMemoryAllocator {
    fn allocate(&self, shape: &[usize], dtype: DataType) -> Result<MemoryObject> {
        allocate_from(&self.pool, shape, dtype)
    }

    fn location(&self) -> MemoryLocation {
        MemoryLocation::PinnedHost
    }

    fn stats(&self) -> AllocatorStats {
        self.pool.stats()
    }

    fn name(&self) -> &'static str {
        "PinnedMemoryAllocator"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Registrar that keeps its own table of live registrations.
///
/// Stands in for the driver binding on hosts without one.
#[derive(Debug, Default)]
pub struct TrackingRegistrar {
    live: Mutex<HashSet<u64>>,
    registrations: AtomicU64,
}

impl TrackingRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers currently registered
    pub fn live(&self) -> usize {
        self.live.lock().len()
    }

    /// Registrations performed over the registrar's lifetime
    pub fn total_registrations(&self) -> u64 {
        self.registrations.load(Ordering::Relaxed)
    }
}

impl BufferRegistrar for TrackingRegistrar {
    fn register(&self, buffer_id: u64, region: &[u8]) -> Result<()> {
        if !self.live.lock().insert(buffer_id) {
            return Err(MtdsError::already_exists(format!(
                "Buffer {} is already registered",
                buffer_id
            )));
        }
        self.registrations.fetch_add(1, Ordering::Relaxed);
        debug!("Registered buffer {} ({} bytes)", buffer_id, region.len());
        Ok(())
    }

    fn deregister(&self, buffer_id: u64) {
        self.live.lock().remove(&buffer_id);
    }
}

/// Allocator for buffers registered with the direct-storage driver.
///
/// Registration happens once per region when the pool grows; recycled
/// regions stay registered, so steady-state transfers pay nothing extra.
#[derive(Debug)]
pub struct CuFileMemoryAllocator {
    pool: Arc<BufferPool>,
    registrar: Arc<dyn BufferRegistrar>,
}

impl CuFileMemoryAllocator {
    /// Pool of `buffer_size_mib` MiB on `device`, registered through `registrar`
    pub fn new(
        buffer_size_mib: usize,
        device: usize,
        registrar: Arc<dyn BufferRegistrar>,
    ) -> Result<Self> {
        let pool = BufferPool::new(
            BufferPoolConfig {
                location: MemoryLocation::Device(device),
                capacity_bytes: buffer_size_mib * MIB,
                alignment: PAGE_ALIGNMENT,
            },
            Some(registrar.clone()),
        )?;
        info!(
            "Created cuFile allocator on cuda:{} with {} MiB of registered buffers",
            device, buffer_size_mib
        );
        Ok(Self {
            pool: Arc::new(pool),
            registrar,
        })
    }

    /// Same as `new` with a [`TrackingRegistrar`]
    pub fn with_tracking(buffer_size_mib: usize, device: usize) -> Result<Self> {
        Self::new(buffer_size_mib, device, Arc::new(TrackingRegistrar::new()))
    }

    pub fn registrar(&self) -> &Arc<dyn BufferRegistrar> {
        &self.registrar
    }
}

impl MemoryAllocator for CuFileMemoryAllocator {
    fn allocate(&self, shape: &[usize], dtype: DataType) -> Result<MemoryObject> {
        allocate_from(&self.pool, shape, dtype)
    }

    fn location(&self) -> MemoryLocation {
        self.pool.location()
    }

    fn stats(&self) -> AllocatorStats {
        self.pool.stats()
    }

    fn name(&self) -> &'static str {
        "CuFileMemoryAllocator"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_reports_shape_and_size() {
        let alloc = HostMemoryAllocator::new(1 << 20).unwrap();
        let obj = alloc.allocate(&[3, 10], DataType::F32).unwrap();
        assert_eq!(obj.shape(), &[3, 10]);
        assert_eq!(obj.size_bytes(), 120);
        assert_eq!(obj.data().len(), 120);
        assert_eq!(obj.location(), MemoryLocation::Host);
    }

    #[test]
    fn test_empty_shape_rejected() {
        let alloc = HostMemoryAllocator::new(1 << 20).unwrap();
        assert!(alloc.allocate(&[], DataType::U8).is_err());
    }

    #[test]
    fn test_overflowing_shape_rejected() {
        let alloc = HostMemoryAllocator::new(1 << 20).unwrap();
        let err = alloc.allocate(&[usize::MAX, 2], DataType::U8).unwrap_err();
        assert!(matches!(err, MtdsError::InvalidParameter { .. }));
        let err = alloc.allocate(&[usize::MAX], DataType::U8).unwrap_err();
        assert!(matches!(err, MtdsError::InvalidParameter { .. }));
        assert_eq!(alloc.stats().leased_bytes, 0);
    }

    #[test]
    fn test_gib_budget_must_be_positive() {
        assert!(PinnedMemoryAllocator::with_gib(0.0).is_err());
        assert!(PinnedMemoryAllocator::with_gib(f64::NAN).is_err());
        let alloc = PinnedMemoryAllocator::with_gib(0.5).unwrap();
        assert_eq!(alloc.stats().capacity_bytes, 1 << 29);
    }
}
