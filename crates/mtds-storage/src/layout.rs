//! Key to file path mapping for file-backed media
//!
//! Chunks are spread over two levels of 256 directories picked from a
//! SHA-256 of the escaped key, so no single directory grows unbounded. The
//! file name is the escaped key itself, which keeps the mapping reversible.

use mtds_types::{CacheEngineKey, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Suffix of every chunk file
pub const CHUNK_SUFFIX: &str = ".kvcache.safetensors";
/// Suffix of a chunk file still being written
pub const TMP_SUFFIX: &str = ".tmp";

/// Path of the chunk file for `key` under `root`
pub fn chunk_path(root: &Path, key: &CacheEngineKey) -> PathBuf {
    let stem = key.to_file_stem();
    let digest = hex::encode(Sha256::digest(stem.as_bytes()));
    root.join(&digest[0..2])
        .join(&digest[2..4])
        .join(format!("{}{}", stem, CHUNK_SUFFIX))
}

/// Path the chunk is staged at before the final rename
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(TMP_SUFFIX);
    PathBuf::from(os)
}

/// Recover the key from a chunk file path; `None` for foreign files
pub fn key_from_path(path: &Path) -> Option<Result<CacheEngineKey>> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(CHUNK_SUFFIX)?;
    Some(CacheEngineKey::from_file_stem(stem))
}
