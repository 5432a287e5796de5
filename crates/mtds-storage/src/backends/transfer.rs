//! Byte movement between memory objects and chunk files

use crate::layout::tmp_path;
use crate::metadata::{header_len, unpack_metadata, PackedMetadata};
use mtds_memory::{MemoryAllocator, MemoryObject};
use mtds_types::{MtdsError, Result};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, warn};

/// Moves one chunk between a memory object and a file.
///
/// A driver binding would implement this with registered-buffer DMA; the
/// file layout is the same either way.
pub trait DirectTransfer: Send + Sync + fmt::Debug {
    /// Write `header` followed by the bytes of `obj` to `path`.
    ///
    /// `path` must not become visible until every byte is durable.
    fn write(&self, path: &Path, header: &[u8], obj: &MemoryObject) -> Result<()>;

    /// Read the chunk at `path` into an object leased from `allocator`
    fn read(&self, path: &Path, allocator: &dyn MemoryAllocator) -> Result<MemoryObject>;

    /// Decode only the header of the chunk at `path`
    fn read_header(&self, path: &Path) -> Result<PackedMetadata>;

    fn name(&self) -> &'static str;
}

/// Host-staged transfer over ordinary file I/O, equivalent to the direct
/// storage driver's compatibility mode
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixTransfer;

impl PosixTransfer {
    fn write_staged(tmp: &Path, header: &[u8], obj: &MemoryObject) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(tmp)?;
        file.write_all(header)?;
        file.write_all(&*obj.data())?;
        file.sync_data()?;
        Ok(())
    }
}

fn read_header_from(file: &mut File) -> Result<PackedMetadata> {
    let mut prefix = [0u8; 8];
    file.read_exact(&mut prefix)?;
    let len = header_len(&prefix)?;
    let mut header = vec![0u8; len];
    header[..8].copy_from_slice(&prefix);
    file.read_exact(&mut header[8..])?;
    unpack_metadata(&header)
}

impl DirectTransfer for PosixTransfer {
    fn write(&self, path: &Path, header: &[u8], obj: &MemoryObject) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = tmp_path(path);
        if let Err(e) = Self::write_staged(&tmp, header, obj) {
            if let Err(cleanup) = fs::remove_file(&tmp) {
                warn!("Failed to remove staging file {}: {}", tmp.display(), cleanup);
            }
            return Err(e);
        }
        fs::rename(&tmp, path)?;
        if let Some(parent) = path.parent() {
            File::open(parent)?.sync_all()?;
        }
        debug!("Wrote {} bytes to {}", obj.size_bytes(), path.display());
        Ok(())
    }

    fn read(&self, path: &Path, allocator: &dyn MemoryAllocator) -> Result<MemoryObject> {
        let mut file = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MtdsError::not_found(format!("Chunk file {} is missing", path.display()))
            } else {
                MtdsError::from(e)
            }
        })?;
        let meta = read_header_from(&mut file)?;
        let obj = allocator.allocate(&meta.shape, meta.dtype)?;
        file.read_exact(&mut *obj.data_mut()).map_err(|e| {
            MtdsError::io(format!(
                "Short read of {} bytes from {}: {}",
                meta.nbytes,
                path.display(),
                e
            ))
        })?;
        Ok(obj)
    }

    fn read_header(&self, path: &Path) -> Result<PackedMetadata> {
        let mut file = File::open(path)?;
        read_header_from(&mut file)
    }

    fn name(&self) -> &'static str {
        "posix"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{pack_metadata, TensorDescriptor, METADATA_REGION_BYTES};
    use mtds_memory::HostMemoryAllocator;
    use mtds_types::DataType;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/chunk.kvcache.safetensors");
        let alloc = HostMemoryAllocator::new(1 << 20).unwrap();

        let obj = alloc.allocate(&[4, 8], DataType::F16).unwrap();
        obj.data_mut().iter_mut().enumerate().for_each(|(i, b)| *b = i as u8);
        let header = pack_metadata(&TensorDescriptor::new(&[4, 8], DataType::F16), "t").unwrap();

        PosixTransfer.write(&path, &header, &obj).unwrap();
        assert!(!tmp_path(&path).exists());
        let len = fs::metadata(&path).unwrap().len() as usize;
        assert_eq!(len, METADATA_REGION_BYTES + 64);

        let meta = PosixTransfer.read_header(&path).unwrap();
        assert_eq!(meta.shape, vec![4, 8]);

        let back = PosixTransfer.read(&path, &alloc).unwrap();
        assert_eq!(back.dtype(), DataType::F16);
        assert_eq!(&*back.data(), &*obj.data());
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let alloc = HostMemoryAllocator::new(1 << 20).unwrap();
        let err = PosixTransfer
            .read(&dir.path().join("nope"), &alloc)
            .unwrap_err();
        assert!(matches!(err, MtdsError::NotFound { .. }));
    }

    #[test]
    fn test_truncated_file_fails_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.kvcache.safetensors");
        let mut bytes = pack_metadata(&TensorDescriptor::new(&[16], DataType::U8), "t").unwrap();
        bytes.extend_from_slice(&[0; 4]);
        fs::write(&path, bytes).unwrap();

        let alloc = HostMemoryAllocator::new(1 << 20).unwrap();
        assert!(PosixTransfer.read(&path, &alloc).is_err());
    }
}
