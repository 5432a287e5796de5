//! Chunk file header codec
//!
//! Chunk files follow the single-tensor safetensors layout: an 8-byte
//! little-endian header length `N`, `N` bytes of JSON describing one tensor
//! named `kvcache`, then the raw tensor bytes. The JSON is right-padded with
//! spaces so the data always starts at [`METADATA_REGION_BYTES`], which keeps
//! the payload page aligned for direct I/O.

use mtds_types::{DataType, MtdsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Total size of the length prefix plus padded JSON header
pub const METADATA_REGION_BYTES: usize = 4096;

/// Name of the single tensor stored in every chunk file
pub const TENSOR_NAME: &str = "kvcache";

const LENGTH_PREFIX_BYTES: usize = 8;
const VERSION_KEY: &str = "version";

/// Shape and element type of the tensor being packed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDescriptor {
    pub shape: Vec<usize>,
    pub dtype: DataType,
}

impl TensorDescriptor {
    pub fn new(shape: &[usize], dtype: DataType) -> Self {
        Self {
            shape: shape.to_vec(),
            dtype,
        }
    }

    pub fn nbytes(&self) -> Result<usize> {
        self.dtype.checked_nbytes(&self.shape).ok_or_else(|| {
            MtdsError::invalid_parameter(format!(
                "Shape {:?} of {} overflows the address space",
                self.shape, self.dtype
            ))
        })
    }
}

/// Decoded header contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedMetadata {
    pub shape: Vec<usize>,
    pub dtype: DataType,
    pub nbytes: usize,
    pub extra: BTreeMap<String, String>,
}

impl PackedMetadata {
    pub fn version(&self) -> Option<&str> {
        self.extra.get(VERSION_KEY).map(String::as_str)
    }
}

#[derive(Serialize, Deserialize)]
struct TensorEntry {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: [usize; 2],
}

#[derive(Serialize, Deserialize)]
struct FileHeader {
    #[serde(rename = "__metadata__", default)]
    metadata: BTreeMap<String, String>,
    #[serde(rename = "kvcache")]
    tensor: TensorEntry,
}

/// Pack a header carrying `version` as its only metadata entry
pub fn pack_metadata(desc: &TensorDescriptor, version: &str) -> Result<Vec<u8>> {
    let mut extra = BTreeMap::new();
    extra.insert(VERSION_KEY.to_string(), version.to_string());
    pack_metadata_with(desc, extra)
}

/// Pack a header with an arbitrary string map
pub fn pack_metadata_with(
    desc: &TensorDescriptor,
    extra: BTreeMap<String, String>,
) -> Result<Vec<u8>> {
    let header = FileHeader {
        metadata: extra,
        tensor: TensorEntry {
            dtype: desc.dtype.as_safetensors_str().to_string(),
            shape: desc.shape.clone(),
            data_offsets: [0, desc.nbytes()?],
        },
    };
    let json = serde_json::to_vec(&header)?;

    let region = METADATA_REGION_BYTES - LENGTH_PREFIX_BYTES;
    if json.len() > region {
        return Err(MtdsError::invalid_parameter(format!(
            "Header of {} bytes exceeds the {} byte metadata region",
            json.len(),
            region
        )));
    }

    let mut out = Vec::with_capacity(METADATA_REGION_BYTES);
    out.extend_from_slice(&(region as u64).to_le_bytes());
    out.extend_from_slice(&json);
    out.resize(METADATA_REGION_BYTES, b' ');
    Ok(out)
}

/// Length in bytes of the header at the start of `bytes`, prefix included
pub fn header_len(bytes: &[u8]) -> Result<usize> {
    let prefix: [u8; LENGTH_PREFIX_BYTES] = bytes
        .get(..LENGTH_PREFIX_BYTES)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| MtdsError::invalid_format("Header is shorter than its length prefix"))?;
    let n = u64::from_le_bytes(prefix);
    usize::try_from(n)
        .ok()
        .and_then(|n| n.checked_add(LENGTH_PREFIX_BYTES))
        .ok_or_else(|| MtdsError::invalid_format(format!("Header length {} out of range", n)))
}

/// Decode a header produced by [`pack_metadata`]; trailing data is ignored
pub fn unpack_metadata(bytes: &[u8]) -> Result<PackedMetadata> {
    let end = header_len(bytes)?;
    let json = bytes.get(LENGTH_PREFIX_BYTES..end).ok_or_else(|| {
        MtdsError::invalid_format(format!(
            "Header declares {} bytes but only {} are present",
            end,
            bytes.len()
        ))
    })?;

    let header: FileHeader = serde_json::from_slice(json)
        .map_err(|e| MtdsError::invalid_format(format!("Malformed header JSON: {}", e)))?;
    let dtype = DataType::from_safetensors_str(&header.tensor.dtype)?;
    let nbytes = dtype.checked_nbytes(&header.tensor.shape).ok_or_else(|| {
        MtdsError::invalid_format(format!(
            "Shape {:?} of {} overflows the address space",
            header.tensor.shape, dtype
        ))
    })?;

    let [start, stop] = header.tensor.data_offsets;
    if start != 0 || stop != nbytes {
        return Err(MtdsError::invalid_format(format!(
            "Data offsets [{}, {}] do not match shape {:?} of {}",
            start, stop, header.tensor.shape, dtype
        )));
    }

    Ok(PackedMetadata {
        shape: header.tensor.shape,
        dtype,
        nbytes,
        extra: header.metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let desc = TensorDescriptor::new(&[3, 10], DataType::F32);
        let packed = pack_metadata(&desc, "test").unwrap();
        assert_eq!(packed.len(), METADATA_REGION_BYTES);

        let meta = unpack_metadata(&packed).unwrap();
        assert_eq!(meta.shape, vec![3, 10]);
        assert_eq!(meta.dtype, DataType::F32);
        assert_eq!(meta.nbytes, 120);
        assert_eq!(meta.version(), Some("test"));
    }

    #[test]
    fn test_header_layout() {
        let desc = TensorDescriptor::new(&[2], DataType::BF16);
        let packed = pack_metadata(&desc, "1").unwrap();

        let n = u64::from_le_bytes(packed[..8].try_into().unwrap()) as usize;
        assert_eq!(n + 8, METADATA_REGION_BYTES);

        let text = std::str::from_utf8(&packed[8..]).unwrap();
        let value: serde_json::Value = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(value["kvcache"]["dtype"], "BF16");
        assert_eq!(value["kvcache"]["data_offsets"][1], 4);
        assert_eq!(value["__metadata__"]["version"], "1");
    }

    #[test]
    fn test_rejects_truncated_and_mismatched() {
        assert!(unpack_metadata(&[1, 2, 3]).is_err());

        let desc = TensorDescriptor::new(&[4], DataType::U8);
        let packed = pack_metadata(&desc, "x").unwrap();
        assert!(unpack_metadata(&packed[..100]).is_err());

        let json = br#"{"kvcache":{"dtype":"U8","shape":[4],"data_offsets":[0,5]}}"#;
        let mut bad = (json.len() as u64).to_le_bytes().to_vec();
        bad.extend_from_slice(json);
        let err = unpack_metadata(&bad).unwrap_err();
        assert!(matches!(err, MtdsError::InvalidFormat { .. }));
    }

    #[test]
    fn test_overflowing_shape_is_invalid_format() {
        let json =
            br#"{"kvcache":{"dtype":"U8","shape":[4294967296,4294967296,16],"data_offsets":[0,0]}}"#;
        let mut bad = (json.len() as u64).to_le_bytes().to_vec();
        bad.extend_from_slice(json);
        let err = unpack_metadata(&bad).unwrap_err();
        assert!(matches!(err, MtdsError::InvalidFormat { .. }));

        let desc = TensorDescriptor::new(&[usize::MAX, 2], DataType::F16);
        assert!(pack_metadata(&desc, "x").is_err());
    }

    #[test]
    fn test_oversized_metadata_rejected() {
        let desc = TensorDescriptor::new(&[1], DataType::U8);
        let mut extra = BTreeMap::new();
        extra.insert("blob".to_string(), "x".repeat(METADATA_REGION_BYTES));
        assert!(pack_metadata_with(&desc, extra).is_err());
    }
}
