//! Protobuf wire-format primitives.
//!
//! ONNX files are plain protobuf (`onnx.proto3`). Only the wire types the ONNX
//! schema uses are supported: varint (0), 64-bit (1), length-delimited (2) and
//! 32-bit (5). Groups (3, 4) are rejected.

use crate::error::{OnnxError, Result};

pub const WIRE_VARINT: u8 = 0;
pub const WIRE_FIXED64: u8 = 1;
pub const WIRE_LEN: u8 = 2;
pub const WIRE_FIXED32: u8 = 5;

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Cursor over an encoded protobuf message.
pub struct ProtoReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ProtoReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn has_more(&self) -> bool {
        self.pos < self.data.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Raw bytes between two positions of this reader.
    pub fn span(&self, start: usize, end: usize) -> &'a [u8] {
        &self.data[start..end]
    }

    /// Read a field key, returning `(field_number, wire_type)`.
    pub fn read_tag(&mut self) -> Result<(u32, u8)> {
        let key = self.read_varint()?;
        let wire_type = (key & 0x7) as u8;
        let field = (key >> 3) as u32;
        Ok((field, wire_type))
    }

    pub fn read_varint(&mut self) -> Result<u64> {
        let start = self.pos;
        let mut result: u64 = 0;
        let mut shift = 0u32;
        loop {
            let Some(&byte) = self.data.get(self.pos) else {
                return Err(OnnxError::Truncated { offset: start, context: "varint" });
            };
            self.pos += 1;
            if shift == 63 && byte > 1 {
                return Err(OnnxError::VarintOverflow(start));
            }
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            if shift > 63 {
                return Err(OnnxError::VarintOverflow(start));
            }
        }
    }

    /// Two's-complement `int64` / `int32` as encoded by protobuf (not zigzag).
    pub fn read_int64(&mut self) -> Result<i64> {
        Ok(self.read_varint()? as i64)
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_varint()? as usize;
        let start = self.pos;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(OnnxError::Truncated { offset: start, context: "length-delimited field" })?;
        self.pos = end;
        Ok(&self.data[start..end])
    }

    pub fn read_string(&mut self, field: u32) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| OnnxError::InvalidUtf8 { field })
    }

    pub fn read_fixed32(&mut self) -> Result<u32> {
        let bytes = self.take(4, "fixed32")?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_fixed64(&mut self) -> Result<u64> {
        let bytes = self.take(8, "fixed64")?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_fixed32()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_fixed64()?))
    }

    /// Skip the payload of a field whose tag has already been read.
    pub fn skip(&mut self, field: u32, wire_type: u8) -> Result<()> {
        match wire_type {
            WIRE_VARINT => self.read_varint().map(|_| ()),
            WIRE_FIXED64 => self.take(8, "fixed64").map(|_| ()),
            WIRE_LEN => self.read_bytes().map(|_| ()),
            WIRE_FIXED32 => self.take(4, "fixed32").map(|_| ()),
            other => Err(OnnxError::UnsupportedWireType { field, wire_type: other }),
        }
    }

    /// Skip a field and append its raw encoding (tag included) to `sink`.
    pub fn skip_into(
        &mut self,
        tag_start: usize,
        field: u32,
        wire_type: u8,
        sink: &mut Vec<u8>,
    ) -> Result<()> {
        self.skip(field, wire_type)?;
        sink.extend_from_slice(self.span(tag_start, self.pos));
        Ok(())
    }

    /// Repeated `int64`, accepting both packed and unpacked encodings.
    pub fn read_repeated_int64(&mut self, wire_type: u8, out: &mut Vec<i64>) -> Result<()> {
        if wire_type == WIRE_LEN {
            let mut packed = ProtoReader::new(self.read_bytes()?);
            while packed.has_more() {
                out.push(packed.read_int64()?);
            }
        } else {
            out.push(self.read_int64()?);
        }
        Ok(())
    }

    /// Repeated `float`, accepting both packed and unpacked encodings.
    pub fn read_repeated_f32(&mut self, wire_type: u8, out: &mut Vec<f32>) -> Result<()> {
        if wire_type == WIRE_LEN {
            let bytes = self.read_bytes()?;
            out.extend(
                bytes.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
            );
        } else {
            out.push(self.read_f32()?);
        }
        Ok(())
    }

    /// Repeated `double`, accepting both packed and unpacked encodings.
    pub fn read_repeated_f64(&mut self, wire_type: u8, out: &mut Vec<f64>) -> Result<()> {
        if wire_type == WIRE_LEN {
            let bytes = self.read_bytes()?;
            out.extend(bytes.chunks_exact(8).map(|c| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(c);
                f64::from_le_bytes(buf)
            }));
        } else {
            out.push(self.read_f64()?);
        }
        Ok(())
    }

    fn take(&mut self, n: usize, context: &'static str) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(OnnxError::Truncated { offset: self.pos, context });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Append-only protobuf encoder. Proto3 default values are not emitted.
#[derive(Default)]
pub struct ProtoWriter {
    buf: Vec<u8>,
}

impl ProtoWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn key(&mut self, field: u32, wire_type: u8) {
        self.raw_varint((u64::from(field) << 3) | u64::from(wire_type));
    }

    fn raw_varint(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.buf.push((value as u8) | 0x80);
            value >>= 7;
        }
        self.buf.push(value as u8);
    }

    /// `int64`/`int32`/enum field; zero is omitted.
    pub fn int64(&mut self, field: u32, value: i64) {
        if value != 0 {
            self.int64_always(field, value);
        }
    }

    /// `int64` field written even when zero (oneof members).
    pub fn int64_always(&mut self, field: u32, value: i64) {
        self.key(field, WIRE_VARINT);
        self.raw_varint(value as u64);
    }

    pub fn float(&mut self, field: u32, value: f32) {
        if value.to_bits() != 0 {
            self.key(field, WIRE_FIXED32);
            self.buf.extend_from_slice(&value.to_le_bytes());
        }
    }

    pub fn string(&mut self, field: u32, value: &str) {
        if !value.is_empty() {
            self.bytes(field, value.as_bytes());
        }
    }

    /// Length-delimited field written even when empty.
    pub fn bytes(&mut self, field: u32, value: &[u8]) {
        self.key(field, WIRE_LEN);
        self.raw_varint(value.len() as u64);
        self.buf.extend_from_slice(value);
    }

    pub fn message(&mut self, field: u32, encode: impl FnOnce(&mut ProtoWriter)) {
        let mut nested = ProtoWriter::new();
        encode(&mut nested);
        self.bytes(field, &nested.buf);
    }

    pub fn packed_int64(&mut self, field: u32, values: &[i64]) {
        if values.is_empty() {
            return;
        }
        let mut packed = ProtoWriter::new();
        for &v in values {
            packed.raw_varint(v as u64);
        }
        self.bytes(field, &packed.buf);
    }

    pub fn packed_f32(&mut self, field: u32, values: &[f32]) {
        if values.is_empty() {
            return;
        }
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.bytes(field, &bytes);
    }

    pub fn packed_f64(&mut self, field: u32, values: &[f64]) {
        if values.is_empty() {
            return;
        }
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.bytes(field, &bytes);
    }

    /// Re-emit previously captured unknown fields verbatim.
    pub fn raw(&mut self, encoded: &[u8]) {
        self.buf.extend_from_slice(encoded);
    }
}
