//! Buffer pool with an idle free-list

use crate::stats::{AllocatorStats, AllocatorStatsTracker};
use mtds_types::{MemoryLocation, MtdsError, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Hook for media that require buffers to be registered before DMA.
///
/// Implementations bind to a direct-storage driver. The pool registers a
/// buffer once when it is first created and deregisters it only when the
/// buffer leaves the pool for good.
pub trait BufferRegistrar: Send + Sync + fmt::Debug {
    /// Register a freshly created region
    fn register(&self, buffer_id: u64, region: &[u8]) -> Result<()>;

    /// Release a registration
    fn deregister(&self, buffer_id: u64);
}

/// Backing region of a memory object
#[derive(Debug, Default)]
pub struct Buffer {
    id: u64,
    data: Vec<u8>,
}

impl Buffer {
    /// Pool-unique id, 0 for unpooled buffers
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Bytes available in the region
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub(crate) fn unpooled(data: Vec<u8>) -> Self {
        Self { id: 0, data }
    }
}

/// Buffer pool configuration
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Location every buffer in the pool lives in
    pub location: MemoryLocation,
    /// Upper bound on bytes held by the pool (idle + leased)
    pub capacity_bytes: usize,
    /// Region sizes are rounded up to this power of two
    pub alignment: usize,
}

#[derive(Debug, Default)]
struct PoolState {
    /// capacity -> idle buffers of that capacity
    idle: BTreeMap<usize, Vec<Buffer>>,
    total_bytes: usize,
    leased_bytes: usize,
    idle_buffers: usize,
    next_id: u64,
}

/// Pool of reusable regions shared by every handle it leased out
pub struct BufferPool {
    config: BufferPoolConfig,
    state: Mutex<PoolState>,
    registrar: Option<Arc<dyn BufferRegistrar>>,
    stats: AllocatorStatsTracker,
}

impl BufferPool {
    /// Create new buffer pool
    pub fn new(
        config: BufferPoolConfig,
        registrar: Option<Arc<dyn BufferRegistrar>>,
    ) -> Result<Self> {
        if config.capacity_bytes == 0 {
            return Err(MtdsError::invalid_parameter(
                "Buffer pool capacity must be positive",
            ));
        }
        if !config.alignment.is_power_of_two() {
            return Err(MtdsError::invalid_parameter(format!(
                "Buffer alignment must be a power of two, got {}",
                config.alignment
            )));
        }

        debug!(
            "Creating buffer pool: location={}, capacity={} bytes, alignment={}",
            config.location, config.capacity_bytes, config.alignment
        );

        Ok(Self {
            config,
            state: Mutex::new(PoolState {
                next_id: 1,
                ..Default::default()
            }),
            registrar,
            stats: AllocatorStatsTracker::new(),
        })
    }

    pub fn location(&self) -> MemoryLocation {
        self.config.location
    }

    pub fn capacity_bytes(&self) -> usize {
        self.config.capacity_bytes
    }

    /// Lease a region of at least `size` bytes.
    ///
    /// Reuses the smallest idle region that fits. Otherwise grows the pool,
    /// reclaiming idle regions that are too small if that makes room. Fails
    /// with `ResourceExhausted` when neither works.
    pub fn lease(&self, size: usize) -> Result<Buffer> {
        let needed = align_size(size.max(1), self.config.alignment).ok_or_else(|| {
            MtdsError::invalid_parameter(format!(
                "Buffer of {} bytes cannot be aligned to {}",
                size, self.config.alignment
            ))
        })?;
        let mut state = self.state.lock();

        let fit = state.idle.range(needed..).next().map(|(&cap, _)| cap);
        if let Some(cap) = fit {
            if let Some(buffer) = pop_idle(&mut state, cap) {
                state.leased_bytes += cap;
                self.stats.record_reuse();
                trace!("Reused idle buffer {} ({} bytes)", buffer.id, cap);
                return Ok(buffer);
            }
        }

        while state.total_bytes + needed > self.config.capacity_bytes {
            let smallest = state.idle.keys().next().copied();
            let Some(cap) = smallest else { break };
            if let Some(victim) = pop_idle(&mut state, cap) {
                state.total_bytes -= cap;
                self.retire(victim);
            }
        }

        if state.total_bytes + needed > self.config.capacity_bytes {
            self.stats.record_failure();
            return Err(MtdsError::resource_exhausted(format!(
                "Buffer pool on {} exhausted: {} leased, {} requested, {} capacity",
                self.config.location, state.leased_bytes, needed, self.config.capacity_bytes
            )));
        }

        let id = state.next_id;
        state.next_id += 1;
        let buffer = Buffer {
            id,
            data: vec![0u8; needed],
        };
        if let Some(registrar) = &self.registrar {
            if let Err(e) = registrar.register(id, &buffer.data) {
                self.stats.record_failure();
                return Err(e);
            }
        }

        state.total_bytes += needed;
        state.leased_bytes += needed;
        self.stats.record_allocation();
        debug!("Allocated new buffer {} of {} bytes", id, needed);
        Ok(buffer)
    }

    /// Return a leased region to the idle list
    pub fn restore(&self, buffer: Buffer) {
        if buffer.id == 0 {
            warn!("Ignoring unpooled buffer returned to pool");
            return;
        }
        let cap = buffer.capacity();
        let mut state = self.state.lock();
        state.leased_bytes = state.leased_bytes.saturating_sub(cap);
        state.idle_buffers += 1;
        state.idle.entry(cap).or_default().push(buffer);
        self.stats.record_release();
        trace!("Buffer of {} bytes returned to pool", cap);
    }

    /// Get pool statistics
    pub fn stats(&self) -> AllocatorStats {
        let state = self.state.lock();
        self.stats.snapshot(
            self.config.capacity_bytes,
            state.leased_bytes,
            state.total_bytes - state.leased_bytes,
            state.idle_buffers,
        )
    }

    fn retire(&self, buffer: Buffer) {
        if let Some(registrar) = &self.registrar {
            registrar.deregister(buffer.id);
        }
        debug!("Reclaimed idle buffer {} ({} bytes)", buffer.id, buffer.capacity());
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let state = std::mem::take(self.state.get_mut());
        for buffer in state.idle.into_values().flatten() {
            self.retire(buffer);
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BufferPool")
            .field("location", &self.config.location)
            .field("capacity_bytes", &self.config.capacity_bytes)
            .field("total_bytes", &state.total_bytes)
            .field("leased_bytes", &state.leased_bytes)
            .finish()
    }
}

fn pop_idle(state: &mut PoolState, cap: usize) -> Option<Buffer> {
    let list = state.idle.get_mut(&cap)?;
    let buffer = list.pop();
    if list.is_empty() {
        state.idle.remove(&cap);
    }
    if buffer.is_some() {
        state.idle_buffers -= 1;
    }
    buffer
}

/// Align size to specified boundary, `None` on overflow
pub(crate) fn align_size(size: usize, alignment: usize) -> Option<usize> {
    size.checked_add(alignment - 1).map(|s| s & !(alignment - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(capacity: usize) -> BufferPool {
        BufferPool::new(
            BufferPoolConfig {
                location: MemoryLocation::Host,
                capacity_bytes: capacity,
                alignment: 256,
            },
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_lease_rounds_to_alignment() {
        let pool = pool(4096);
        let buffer = pool.lease(10).unwrap();
        assert_eq!(buffer.capacity(), 256);
        assert_eq!(pool.stats().leased_bytes, 256);
    }

    #[test]
    fn test_restore_and_reuse() {
        let pool = pool(4096);
        let buffer = pool.lease(1000).unwrap();
        let id = buffer.id();
        pool.restore(buffer);
        assert_eq!(pool.stats().idle_buffers, 1);

        let again = pool.lease(600).unwrap();
        assert_eq!(again.id(), id);
        let stats = pool.stats();
        assert_eq!(stats.reuses, 1);
        assert_eq!(stats.idle_buffers, 0);
    }

    #[test]
    fn test_exhaustion_is_retryable() {
        let pool = pool(512);
        let _a = pool.lease(512).unwrap();
        let err = pool.lease(1).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(pool.stats().failures, 1);
    }

    #[test]
    fn test_small_idle_buffers_are_reclaimed_for_growth() {
        let pool = pool(1024);
        let a = pool.lease(256).unwrap();
        let b = pool.lease(256).unwrap();
        pool.restore(a);
        pool.restore(b);

        let big = pool.lease(1024).unwrap();
        assert_eq!(big.capacity(), 1024);
        let stats = pool.stats();
        assert_eq!(stats.idle_buffers, 0);
        assert_eq!(stats.leased_bytes, 1024);
    }

    #[test]
    fn test_align_size_overflow() {
        assert_eq!(align_size(10, 256), Some(256));
        assert_eq!(align_size(usize::MAX, 256), None);
        assert!(pool(4096).lease(usize::MAX).is_err());
    }

    #[test]
    fn test_invalid_config() {
        let err = BufferPool::new(
            BufferPoolConfig {
                location: MemoryLocation::Host,
                capacity_bytes: 1024,
                alignment: 3,
            },
            None,
        );
        assert!(err.is_err());
    }
}
