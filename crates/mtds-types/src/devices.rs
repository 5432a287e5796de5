//! Memory location and element types

use crate::{MtdsError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Where a buffer physically lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryLocation {
    /// Accelerator memory with device index
    Device(usize),
    /// Page-locked host memory, usable for DMA
    PinnedHost,
    /// Ordinary pageable host memory
    Host,
}

impl MemoryLocation {
    /// Check if the location is accelerator memory
    pub fn is_device(&self) -> bool {
        matches!(self, MemoryLocation::Device(_))
    }

    /// Device index for accelerator memory
    pub fn index(&self) -> Option<usize> {
        match self {
            MemoryLocation::Device(idx) => Some(*idx),
            _ => None,
        }
    }
}

impl std::fmt::Display for MemoryLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryLocation::Device(idx) => write!(f, "cuda:{}", idx),
            MemoryLocation::PinnedHost => write!(f, "pinned"),
            MemoryLocation::Host => write!(f, "cpu"),
        }
    }
}

/// Tensor element type.
///
/// The variant set mirrors the single-tensor file convention so every value
/// here has an exact on-disk tag (see [`DataType::as_safetensors_str`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    U8,
    I8,
    /// 8-bit float, 5 exponent bits
    F8E5M2,
    /// 8-bit float, 4 exponent bits
    F8E4M3,
    I16,
    U16,
    F16,
    BF16,
    I32,
    U32,
    F32,
    F64,
    I64,
    U64,
}

impl DataType {
    /// Get size in bytes for this data type
    pub fn size_bytes(&self) -> usize {
        match self {
            DataType::Bool | DataType::U8 | DataType::I8 => 1,
            DataType::F8E5M2 | DataType::F8E4M3 => 1,
            DataType::I16 | DataType::U16 | DataType::F16 | DataType::BF16 => 2,
            DataType::I32 | DataType::U32 | DataType::F32 => 4,
            DataType::F64 | DataType::I64 | DataType::U64 => 8,
        }
    }

    /// Check if this is a floating point type
    pub fn is_float(&self) -> bool {
        matches!(
            self,
            DataType::F8E5M2
                | DataType::F8E4M3
                | DataType::F16
                | DataType::BF16
                | DataType::F32
                | DataType::F64
        )
    }

    /// Tag used in the header of a single-tensor file
    pub fn as_safetensors_str(&self) -> &'static str {
        match self {
            DataType::Bool => "BOOL",
            DataType::U8 => "U8",
            DataType::I8 => "I8",
            DataType::F8E5M2 => "F8_E5M2",
            DataType::F8E4M3 => "F8_E4M3",
            DataType::I16 => "I16",
            DataType::U16 => "U16",
            DataType::F16 => "F16",
            DataType::BF16 => "BF16",
            DataType::I32 => "I32",
            DataType::U32 => "U32",
            DataType::F32 => "F32",
            DataType::F64 => "F64",
            DataType::I64 => "I64",
            DataType::U64 => "U64",
        }
    }

    /// Parse a single-tensor file header tag
    pub fn from_safetensors_str(tag: &str) -> Result<Self> {
        let dtype = match tag {
            "BOOL" => DataType::Bool,
            "U8" => DataType::U8,
            "I8" => DataType::I8,
            "F8_E5M2" => DataType::F8E5M2,
            "F8_E4M3" => DataType::F8E4M3,
            "I16" => DataType::I16,
            "U16" => DataType::U16,
            "F16" => DataType::F16,
            "BF16" => DataType::BF16,
            "I32" => DataType::I32,
            "U32" => DataType::U32,
            "F32" => DataType::F32,
            "F64" => DataType::F64,
            "I64" => DataType::I64,
            "U64" => DataType::U64,
            other => {
                return Err(MtdsError::invalid_format(format!(
                    "Unsupported dtype tag: {}",
                    other
                )))
            }
        };
        Ok(dtype)
    }

    /// Byte size of a dense tensor with this element type and shape.
    ///
    /// Saturates at `usize::MAX`; use [`DataType::checked_nbytes`] for shapes
    /// read from untrusted input.
    pub fn nbytes(&self, shape: &[usize]) -> usize {
        self.checked_nbytes(shape).unwrap_or(usize::MAX)
    }

    /// Byte size of a dense tensor, `None` if it does not fit in `usize`
    pub fn checked_nbytes(&self, shape: &[usize]) -> Option<usize> {
        shape
            .iter()
            .try_fold(self.size_bytes(), |acc, &dim| acc.checked_mul(dim))
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataType::Bool => "bool",
            DataType::U8 => "uint8",
            DataType::I8 => "int8",
            DataType::F8E5M2 => "float8_e5m2",
            DataType::F8E4M3 => "float8_e4m3fn",
            DataType::I16 => "int16",
            DataType::U16 => "uint16",
            DataType::F16 => "float16",
            DataType::BF16 => "bfloat16",
            DataType::I32 => "int32",
            DataType::U32 => "uint32",
            DataType::F32 => "float32",
            DataType::F64 => "float64",
            DataType::I64 => "int64",
            DataType::U64 => "uint64",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for DataType {
    type Err = MtdsError;

    /// Accepts the display names plus the common short aliases
    fn from_str(s: &str) -> Result<Self> {
        let dtype = match s.to_lowercase().as_str() {
            "bool" => DataType::Bool,
            "uint8" | "u8" => DataType::U8,
            "int8" | "i8" => DataType::I8,
            "float8_e5m2" => DataType::F8E5M2,
            "float8_e4m3fn" | "fp8" => DataType::F8E4M3,
            "int16" | "i16" => DataType::I16,
            "uint16" | "u16" => DataType::U16,
            "float16" | "half" | "f16" | "fp16" => DataType::F16,
            "bfloat16" | "bf16" => DataType::BF16,
            "int32" | "i32" => DataType::I32,
            "uint32" | "u32" => DataType::U32,
            "float32" | "float" | "f32" | "fp32" => DataType::F32,
            "float64" | "double" | "f64" => DataType::F64,
            "int64" | "i64" => DataType::I64,
            "uint64" | "u64" => DataType::U64,
            _ => return DataType::from_safetensors_str(s),
        };
        Ok(dtype)
    }
}
