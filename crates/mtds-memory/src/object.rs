//! Reference-counted tensor buffer handles

use crate::pool::{Buffer, BufferPool};
use mtds_types::{DataType, MemoryLocation, MtdsError, Result};
use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Shape, element type and placement of a memory object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryObjMetadata {
    pub shape: Vec<usize>,
    pub dtype: DataType,
    /// Always `product(shape) * dtype.size_bytes()`
    pub size_bytes: usize,
    pub location: MemoryLocation,
}

impl MemoryObjMetadata {
    /// Fails with `InvalidParameter` if the byte size overflows `usize`
    pub fn new(shape: &[usize], dtype: DataType, location: MemoryLocation) -> Result<Self> {
        let size_bytes = dtype.checked_nbytes(shape).ok_or_else(|| {
            MtdsError::invalid_parameter(format!(
                "Shape {:?} of {} overflows the address space",
                shape, dtype
            ))
        })?;
        Ok(Self {
            shape: shape.to_vec(),
            dtype,
            size_bytes,
            location,
        })
    }
}

struct ObjectInner {
    metadata: MemoryObjMetadata,
    buffer: RwLock<Buffer>,
    pool: Option<Arc<BufferPool>>,
}

impl Drop for ObjectInner {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.restore(std::mem::take(self.buffer.get_mut()));
        }
    }
}

/// Handle to one allocated typed buffer.
///
/// Clones share the same region. The region goes back to its pool when the
/// last handle is dropped, on every exit path. Shape and size are fixed for
/// the life of the object.
#[derive(Clone)]
pub struct MemoryObject {
    inner: Arc<ObjectInner>,
}

impl MemoryObject {
    /// Wrap a region leased from `pool`
    pub(crate) fn leased(metadata: MemoryObjMetadata, buffer: Buffer, pool: Arc<BufferPool>) -> Self {
        Self {
            inner: Arc::new(ObjectInner {
                metadata,
                buffer: RwLock::new(buffer),
                pool: Some(pool),
            }),
        }
    }

    /// Build an object that owns `data` outright and never touches a pool
    pub fn from_vec(
        shape: &[usize],
        dtype: DataType,
        location: MemoryLocation,
        data: Vec<u8>,
    ) -> Result<Self> {
        let metadata = MemoryObjMetadata::new(shape, dtype, location)?;
        if data.len() != metadata.size_bytes {
            return Err(MtdsError::invalid_parameter(format!(
                "Buffer of {} bytes does not match shape {:?} of {} ({} bytes)",
                data.len(),
                shape,
                dtype,
                metadata.size_bytes
            )));
        }
        Ok(Self {
            inner: Arc::new(ObjectInner {
                metadata,
                buffer: RwLock::new(Buffer::unpooled(data)),
                pool: None,
            }),
        })
    }

    pub fn metadata(&self) -> &MemoryObjMetadata {
        &self.inner.metadata
    }

    pub fn shape(&self) -> &[usize] {
        &self.inner.metadata.shape
    }

    pub fn dtype(&self) -> DataType {
        self.inner.metadata.dtype
    }

    /// Logical size in bytes
    pub fn size_bytes(&self) -> usize {
        self.inner.metadata.size_bytes
    }

    pub fn location(&self) -> MemoryLocation {
        self.inner.metadata.location
    }

    /// Number of live handles to this buffer
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether the region came from a pool
    pub fn is_pooled(&self) -> bool {
        self.inner.pool.is_some()
    }

    /// Read access to the logical bytes
    pub fn data(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        let size = self.size_bytes();
        RwLockReadGuard::map(self.inner.buffer.read(), |b| &b.as_slice()[..size])
    }

    /// Write access to the logical bytes
    pub fn data_mut(&self) -> MappedRwLockWriteGuard<'_, [u8]> {
        let size = self.size_bytes();
        RwLockWriteGuard::map(self.inner.buffer.write(), |b| {
            &mut b.as_mut_slice()[..size]
        })
    }

    /// Copy `src` into the buffer; lengths must match exactly
    pub fn copy_from_slice(&self, src: &[u8]) -> Result<()> {
        if src.len() != self.size_bytes() {
            return Err(MtdsError::invalid_parameter(format!(
                "Source of {} bytes does not fit memory object of {} bytes",
                src.len(),
                self.size_bytes()
            )));
        }
        self.data_mut().copy_from_slice(src);
        Ok(())
    }
}

impl fmt::Debug for MemoryObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryObject")
            .field("shape", &self.inner.metadata.shape)
            .field("dtype", &self.inner.metadata.dtype)
            .field("size_bytes", &self.inner.metadata.size_bytes)
            .field("location", &self.inner.metadata.location)
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_checks_size() {
        let ok = MemoryObject::from_vec(&[2, 2], DataType::F32, MemoryLocation::Host, vec![0; 16]);
        assert!(ok.is_ok());
        let bad = MemoryObject::from_vec(&[2, 2], DataType::F32, MemoryLocation::Host, vec![0; 15]);
        assert!(bad.is_err());
    }

    #[test]
    fn test_clones_share_bytes() {
        let obj =
            MemoryObject::from_vec(&[4], DataType::U8, MemoryLocation::Host, vec![0; 4]).unwrap();
        let other = obj.clone();
        assert_eq!(obj.ref_count(), 2);

        other.copy_from_slice(&[1, 2, 3, 4]).unwrap();
        assert_eq!(&*obj.data(), &[1, 2, 3, 4]);
        drop(other);
        assert_eq!(obj.ref_count(), 1);
        assert!(!obj.is_pooled());
    }
}
