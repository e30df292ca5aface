//! `TensorProto` and element data types.

use std::fmt;

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

use crate::error::{OnnxError, Result};
use crate::proto::StringStringEntry;
use crate::wire::{ProtoReader, ProtoWriter};

// ---------------------------------------------------------------------------
// DataType
// ---------------------------------------------------------------------------

/// `TensorProto.DataType` values.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum DataType {
    Float = 1,
    Uint8 = 2,
    Int8 = 3,
    Uint16 = 4,
    Int16 = 5,
    Int32 = 6,
    Int64 = 7,
    String = 8,
    Bool = 9,
    Float16 = 10,
    Double = 11,
    Uint32 = 12,
    Uint64 = 13,
    BFloat16 = 16,
}

impl DataType {
    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            1 => Self::Float,
            2 => Self::Uint8,
            3 => Self::Int8,
            4 => Self::Uint16,
            5 => Self::Int16,
            6 => Self::Int32,
            7 => Self::Int64,
            8 => Self::String,
            9 => Self::Bool,
            10 => Self::Float16,
            11 => Self::Double,
            12 => Self::Uint32,
            13 => Self::Uint64,
            16 => Self::BFloat16,
            _ => return None,
        })
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Size in bytes of one element in `raw_data`; `None` for strings.
    pub fn element_size(self) -> Option<usize> {
        match self {
            Self::Uint8 | Self::Int8 | Self::Bool => Some(1),
            Self::Uint16 | Self::Int16 | Self::Float16 | Self::BFloat16 => Some(2),
            Self::Float | Self::Int32 | Self::Uint32 => Some(4),
            Self::Int64 | Self::Uint64 | Self::Double => Some(8),
            Self::String => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Float => "float",
            Self::Uint8 => "uint8",
            Self::Int8 => "int8",
            Self::Uint16 => "uint16",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::String => "string",
            Self::Bool => "bool",
            Self::Float16 => "float16",
            Self::Double => "double",
            Self::Uint32 => "uint32",
            Self::Uint64 => "uint64",
            Self::BFloat16 => "bfloat16",
        };
        f.write_str(name)
    }
}

/// `TensorProto.DataLocation`.
pub const DATA_LOCATION_DEFAULT: i32 = 0;
pub const DATA_LOCATION_EXTERNAL: i32 = 1;

// ---------------------------------------------------------------------------
// TensorProto
// ---------------------------------------------------------------------------

/// A constant tensor: graph initializer or attribute value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TensorProto {
    pub name: String,
    pub dims: Vec<i64>,
    pub data_type: i32,
    pub raw_data: Vec<u8>,
    pub float_data: Vec<f32>,
    pub int32_data: Vec<i32>,
    pub int64_data: Vec<i64>,
    pub double_data: Vec<f64>,
    pub doc_string: String,
    pub external_data: Vec<StringStringEntry>,
    pub data_location: i32,
    pub unknown_fields: Vec<u8>,
}

impl TensorProto {
    fn with_raw(name: &str, dims: &[usize], data_type: DataType, raw_data: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            dims: dims.iter().map(|&d| d as i64).collect(),
            data_type: data_type.as_i32(),
            raw_data,
            ..Default::default()
        }
    }

    pub fn from_f32(name: &str, dims: &[usize], values: &[f32]) -> Self {
        let raw = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::with_raw(name, dims, DataType::Float, raw)
    }

    pub fn from_i64(name: &str, dims: &[usize], values: &[i64]) -> Self {
        let raw = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::with_raw(name, dims, DataType::Int64, raw)
    }

    pub fn from_i32(name: &str, dims: &[usize], values: &[i32]) -> Self {
        let raw = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::with_raw(name, dims, DataType::Int32, raw)
    }

    pub fn from_u8(name: &str, dims: &[usize], values: &[u8]) -> Self {
        Self::with_raw(name, dims, DataType::Uint8, values.to_vec())
    }

    pub fn from_i8(name: &str, dims: &[usize], values: &[i8]) -> Self {
        let raw = values.iter().map(|&v| v as u8).collect();
        Self::with_raw(name, dims, DataType::Int8, raw)
    }

    pub fn data_type(&self) -> Option<DataType> {
        DataType::from_i32(self.data_type)
    }

    pub fn shape(&self) -> Vec<usize> {
        self.dims.iter().map(|&d| d.max(0) as usize).collect()
    }

    /// Element count (1 for a scalar).
    pub fn numel(&self) -> usize {
        self.dims.iter().map(|&d| d.max(0) as usize).product()
    }

    pub fn is_external(&self) -> bool {
        self.data_location == DATA_LOCATION_EXTERNAL || !self.external_data.is_empty()
    }

    /// Number of payload bytes carried inside the message itself.
    pub fn embedded_bytes(&self) -> usize {
        if !self.raw_data.is_empty() {
            return self.raw_data.len();
        }
        let elem = self.data_type().and_then(DataType::element_size).unwrap_or(0);
        let typed = self.float_data.len()
            + self.int32_data.len()
            + self.int64_data.len()
            + self.double_data.len();
        typed * elem
    }

    /// Decode the payload as `f32`, converting from the stored element type.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        if self.is_external() {
            return Err(self.invalid("payload is stored externally"));
        }
        let data_type = self.data_type().ok_or_else(|| OnnxError::UnsupportedDataType {
            name: self.name.clone(),
            data_type: self.data_type,
        })?;
        let values = if self.raw_data.is_empty() {
            self.typed_to_f32(data_type)?
        } else {
            self.raw_to_f32(data_type)?
        };
        if values.len() != self.numel() {
            return Err(self.invalid(format!(
                "expected {} elements for dims {:?}, found {}",
                self.numel(),
                self.dims,
                values.len()
            )));
        }
        Ok(values)
    }

    /// Decode an integer payload (shape operands, zero points).
    pub fn to_i64_vec(&self) -> Result<Vec<i64>> {
        match self.data_type() {
            Some(DataType::Int64) if self.raw_data.is_empty() => Ok(self.int64_data.clone()),
            Some(DataType::Int64) => Ok(self
                .raw_data
                .chunks_exact(8)
                .map(|c| {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(c);
                    i64::from_le_bytes(buf)
                })
                .collect()),
            _ => Ok(self.to_f32_vec()?.into_iter().map(|v| v as i64).collect()),
        }
    }

    fn raw_to_f32(&self, data_type: DataType) -> Result<Vec<f32>> {
        let raw = &self.raw_data;
        let elem = data_type.element_size().unwrap_or(0);
        if elem == 0 || raw.len() % elem != 0 {
            return Err(
                self.invalid(format!("raw_data length {} is not a multiple of {elem}", raw.len()))
            );
        }
        let values = match data_type {
            DataType::Float => {
                raw.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()
            }
            DataType::Double => raw
                .chunks_exact(8)
                .map(|c| {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(c);
                    f64::from_le_bytes(buf) as f32
                })
                .collect(),
            DataType::Float16 => {
                raw.chunks_exact(2).map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32()).collect()
            }
            DataType::BFloat16 => {
                raw.chunks_exact(2).map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32()).collect()
            }
            DataType::Uint8 | DataType::Bool => raw.iter().map(|&b| f32::from(b)).collect(),
            DataType::Int8 => raw.iter().map(|&b| f32::from(b as i8)).collect(),
            DataType::Int32 => raw
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32)
                .collect(),
            DataType::Int64 => raw
                .chunks_exact(8)
                .map(|c| {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(c);
                    i64::from_le_bytes(buf) as f32
                })
                .collect(),
            other => {
                return Err(OnnxError::UnsupportedDataType {
                    name: self.name.clone(),
                    data_type: other.as_i32(),
                });
            }
        };
        Ok(values)
    }

    fn typed_to_f32(&self, data_type: DataType) -> Result<Vec<f32>> {
        let values = match data_type {
            DataType::Float => self.float_data.clone(),
            DataType::Double => self.double_data.iter().map(|&v| v as f32).collect(),
            DataType::Int64 => self.int64_data.iter().map(|&v| v as f32).collect(),
            // int32_data carries every narrow integer type, fp16 and bf16 as bit patterns
            DataType::Int32
            | DataType::Int16
            | DataType::Int8
            | DataType::Uint8
            | DataType::Uint16
            | DataType::Bool => self.int32_data.iter().map(|&v| v as f32).collect(),
            DataType::Float16 => {
                self.int32_data.iter().map(|&v| f16::from_bits(v as u16).to_f32()).collect()
            }
            DataType::BFloat16 => {
                self.int32_data.iter().map(|&v| bf16::from_bits(v as u16).to_f32()).collect()
            }
            other => {
                return Err(OnnxError::UnsupportedDataType {
                    name: self.name.clone(),
                    data_type: other.as_i32(),
                });
            }
        };
        Ok(values)
    }

    fn invalid(&self, reason: impl Into<String>) -> OnnxError {
        OnnxError::InvalidTensor { name: self.name.clone(), reason: reason.into() }
    }

    // -- wire ---------------------------------------------------------------

    pub(crate) fn decode(data: &[u8]) -> Result<Self> {
        let mut r = ProtoReader::new(data);
        let mut t = TensorProto::default();
        while r.has_more() {
            let tag_start = r.position();
            let (field, wire) = r.read_tag()?;
            match field {
                1 => r.read_repeated_int64(wire, &mut t.dims)?,
                2 => t.data_type = r.read_int64()? as i32,
                4 => r.read_repeated_f32(wire, &mut t.float_data)?,
                5 => {
                    let mut values = Vec::new();
                    r.read_repeated_int64(wire, &mut values)?;
                    t.int32_data.extend(values.into_iter().map(|v| v as i32));
                }
                7 => r.read_repeated_int64(wire, &mut t.int64_data)?,
                8 => t.name = r.read_string(field)?,
                9 => t.raw_data = r.read_bytes()?.to_vec(),
                10 => r.read_repeated_f64(wire, &mut t.double_data)?,
                12 => t.doc_string = r.read_string(field)?,
                13 => t.external_data.push(StringStringEntry::decode(r.read_bytes()?)?),
                14 => t.data_location = r.read_int64()? as i32,
                _ => r.skip_into(tag_start, field, wire, &mut t.unknown_fields)?,
            }
        }
        Ok(t)
    }

    pub(crate) fn encode(&self, w: &mut ProtoWriter) {
        w.packed_int64(1, &self.dims);
        w.int64(2, i64::from(self.data_type));
        w.packed_f32(4, &self.float_data);
        let int32: Vec<i64> = self.int32_data.iter().map(|&v| i64::from(v)).collect();
        w.packed_int64(5, &int32);
        w.packed_int64(7, &self.int64_data);
        w.string(8, &self.name);
        if !self.raw_data.is_empty() {
            w.bytes(9, &self.raw_data);
        }
        w.packed_f64(10, &self.double_data);
        w.string(12, &self.doc_string);
        for entry in &self.external_data {
            w.message(13, |m| entry.encode(m));
        }
        w.int64(14, i64::from(self.data_location));
        w.raw(&self.unknown_fields);
    }
}
