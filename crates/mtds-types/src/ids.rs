//! Identifier types for cache chunks and engine instances

use crate::{DataType, MtdsError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const KEY_SEPARATOR: char = '@';

/// Content-addressed identifier of one cache chunk.
///
/// A key names exactly one chunk for one (model, parallelism, worker) tuple.
/// Equality and hashing cover all five fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheEngineKey {
    pub fmt: String,
    pub model_name: String,
    pub world_size: u32,
    pub worker_id: u32,
    pub chunk_hash: String,
}

impl CacheEngineKey {
    pub fn new(
        fmt: impl Into<String>,
        model_name: impl Into<String>,
        world_size: u32,
        worker_id: u32,
        chunk_hash: impl Into<String>,
    ) -> Self {
        Self {
            fmt: fmt.into(),
            model_name: model_name.into(),
            world_size,
            worker_id,
            chunk_hash: chunk_hash.into(),
        }
    }

    /// Reversible form that is safe to use as a single path component.
    ///
    /// Each field is escaped on its own so that distinct keys never map to
    /// the same name.
    pub fn to_file_stem(&self) -> String {
        [
            escape_component(&self.fmt),
            escape_component(&self.model_name),
            self.world_size.to_string(),
            self.worker_id.to_string(),
            escape_component(&self.chunk_hash),
        ]
        .join(&KEY_SEPARATOR.to_string())
    }

    /// Inverse of [`CacheEngineKey::to_file_stem`]
    pub fn from_file_stem(stem: &str) -> Result<Self> {
        let parts = split_key(stem)?;
        Ok(Self {
            fmt: unescape_component(parts[0])?,
            model_name: unescape_component(parts[1])?,
            world_size: parse_field(parts[2], "world_size")?,
            worker_id: parse_field(parts[3], "worker_id")?,
            chunk_hash: unescape_component(parts[4])?,
        })
    }
}

impl fmt::Display for CacheEngineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}@{}@{}@{}",
            self.fmt, self.model_name, self.world_size, self.worker_id, self.chunk_hash
        )
    }
}

impl FromStr for CacheEngineKey {
    type Err = MtdsError;

    fn from_str(s: &str) -> Result<Self> {
        let parts = split_key(s)?;
        Ok(Self {
            fmt: parts[0].to_string(),
            model_name: parts[1].to_string(),
            world_size: parse_field(parts[2], "world_size")?,
            worker_id: parse_field(parts[3], "worker_id")?,
            chunk_hash: parts[4].to_string(),
        })
    }
}

fn split_key(s: &str) -> Result<Vec<&str>> {
    let parts: Vec<&str> = s.split(KEY_SEPARATOR).collect();
    if parts.len() != 5 {
        return Err(MtdsError::invalid_format(format!(
            "Cache key must have 5 '@'-separated fields, got {}: {}",
            parts.len(),
            s
        )));
    }
    Ok(parts)
}

fn parse_field(value: &str, name: &str) -> Result<u32> {
    value
        .parse()
        .map_err(|_| MtdsError::invalid_format(format!("Invalid {} in cache key: {}", name, value)))
}

fn escape_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            '@' => out.push_str("%40"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape_component(value: &str) -> Result<String> {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let code = rest.get(pos + 1..pos + 3).ok_or_else(|| {
            MtdsError::invalid_format(format!("Truncated escape in key component: {}", value))
        })?;
        match code {
            "25" => out.push('%'),
            "2F" => out.push('/'),
            "40" => out.push('@'),
            _ => {
                return Err(MtdsError::invalid_format(format!(
                    "Unknown escape %{} in key component: {}",
                    code, value
                )))
            }
        }
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Static description of the engine instance a worker belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineMetadata {
    pub model_name: String,
    pub world_size: u32,
    pub worker_id: u32,
    /// Serving-engine format tag, e.g. "vllm"
    pub fmt: String,
    pub kv_dtype: DataType,
    /// Shape of one KV chunk, if known up front
    pub kv_shape: Vec<usize>,
}

impl EngineMetadata {
    pub fn new(
        model_name: impl Into<String>,
        world_size: u32,
        worker_id: u32,
        fmt: impl Into<String>,
        kv_dtype: DataType,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            world_size,
            worker_id,
            fmt: fmt.into(),
            kv_dtype,
            kv_shape: Vec::new(),
        }
    }

    /// Build the key of a chunk produced by this worker
    pub fn key_for(&self, chunk_hash: impl Into<String>) -> CacheEngineKey {
        CacheEngineKey::new(
            self.fmt.clone(),
            self.model_name.clone(),
            self.world_size,
            self.worker_id,
            chunk_hash,
        )
    }
}
