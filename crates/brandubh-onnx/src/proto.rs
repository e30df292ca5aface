//! ONNX protobuf messages (`onnx.proto3`) with hand-written codecs.
//!
//! Only the messages an inference artifact needs are modelled. Fields that are
//! not modelled are preserved byte-for-byte in `unknown_fields`, so decoding
//! and re-encoding a foreign model does not lose information.

use crate::error::{OnnxError, Result};
use crate::tensor::TensorProto;
use crate::wire::{ProtoReader, ProtoWriter};

/// The default ONNX operator domain.
pub const DEFAULT_DOMAIN: &str = "";

// ---------------------------------------------------------------------------
// StringStringEntryProto
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringStringEntry {
    pub key: String,
    pub value: String,
}

impl StringStringEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: value.into() }
    }

    pub(crate) fn decode(data: &[u8]) -> Result<Self> {
        let mut r = ProtoReader::new(data);
        let mut entry = Self::default();
        while r.has_more() {
            let (field, wire) = r.read_tag()?;
            match field {
                1 => entry.key = r.read_string(field)?,
                2 => entry.value = r.read_string(field)?,
                _ => r.skip(field, wire)?,
            }
        }
        Ok(entry)
    }

    pub(crate) fn encode(&self, w: &mut ProtoWriter) {
        w.string(1, &self.key);
        w.string(2, &self.value);
    }
}

// ---------------------------------------------------------------------------
// OperatorSetIdProto
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperatorSetId {
    pub domain: String,
    pub version: i64,
}

impl OperatorSetId {
    fn decode(data: &[u8]) -> Result<Self> {
        let mut r = ProtoReader::new(data);
        let mut opset = Self::default();
        while r.has_more() {
            let (field, wire) = r.read_tag()?;
            match field {
                1 => opset.domain = r.read_string(field)?,
                2 => opset.version = r.read_int64()?,
                _ => r.skip(field, wire)?,
            }
        }
        Ok(opset)
    }

    fn encode(&self, w: &mut ProtoWriter) {
        w.string(1, &self.domain);
        w.int64(2, self.version);
    }
}

// ---------------------------------------------------------------------------
// AttributeProto
// ---------------------------------------------------------------------------

/// `AttributeProto.AttributeType`.
pub mod attribute_type {
    pub const FLOAT: i32 = 1;
    pub const INT: i32 = 2;
    pub const STRING: i32 = 3;
    pub const TENSOR: i32 = 4;
    pub const GRAPH: i32 = 5;
    pub const FLOATS: i32 = 6;
    pub const INTS: i32 = 7;
    pub const STRINGS: i32 = 8;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeProto {
    pub name: String,
    pub attr_type: i32,
    pub f: f32,
    pub i: i64,
    pub s: Vec<u8>,
    pub t: Option<TensorProto>,
    pub floats: Vec<f32>,
    pub ints: Vec<i64>,
    pub strings: Vec<Vec<u8>>,
    pub unknown_fields: Vec<u8>,
}

impl AttributeProto {
    pub fn int(name: &str, value: i64) -> Self {
        Self { name: name.into(), attr_type: attribute_type::INT, i: value, ..Default::default() }
    }

    pub fn ints(name: &str, values: &[i64]) -> Self {
        Self {
            name: name.into(),
            attr_type: attribute_type::INTS,
            ints: values.to_vec(),
            ..Default::default()
        }
    }

    pub fn float(name: &str, value: f32) -> Self {
        Self { name: name.into(), attr_type: attribute_type::FLOAT, f: value, ..Default::default() }
    }

    pub fn string(name: &str, value: &str) -> Self {
        Self {
            name: name.into(),
            attr_type: attribute_type::STRING,
            s: value.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    pub fn tensor(name: &str, value: TensorProto) -> Self {
        Self {
            name: name.into(),
            attr_type: attribute_type::TENSOR,
            t: Some(value),
            ..Default::default()
        }
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut r = ProtoReader::new(data);
        let mut a = Self::default();
        while r.has_more() {
            let tag_start = r.position();
            let (field, wire) = r.read_tag()?;
            match field {
                1 => a.name = r.read_string(field)?,
                2 => a.f = r.read_f32()?,
                3 => a.i = r.read_int64()?,
                4 => a.s = r.read_bytes()?.to_vec(),
                5 => a.t = Some(TensorProto::decode(r.read_bytes()?)?),
                7 => r.read_repeated_f32(wire, &mut a.floats)?,
                8 => r.read_repeated_int64(wire, &mut a.ints)?,
                9 => a.strings.push(r.read_bytes()?.to_vec()),
                20 => a.attr_type = r.read_int64()? as i32,
                _ => r.skip_into(tag_start, field, wire, &mut a.unknown_fields)?,
            }
        }
        Ok(a)
    }

    fn encode(&self, w: &mut ProtoWriter) {
        w.string(1, &self.name);
        w.float(2, self.f);
        w.int64(3, self.i);
        if !self.s.is_empty() {
            w.bytes(4, &self.s);
        }
        if let Some(t) = &self.t {
            w.message(5, |m| t.encode(m));
        }
        w.packed_f32(7, &self.floats);
        w.packed_int64(8, &self.ints);
        for s in &self.strings {
            w.bytes(9, s);
        }
        w.int64(20, i64::from(self.attr_type));
        w.raw(&self.unknown_fields);
    }
}

// ---------------------------------------------------------------------------
// NodeProto
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeProto {
    pub input: Vec<String>,
    pub output: Vec<String>,
    pub name: String,
    pub op_type: String,
    pub domain: String,
    pub attribute: Vec<AttributeProto>,
    pub doc_string: String,
    pub unknown_fields: Vec<u8>,
}

impl NodeProto {
    pub fn new(
        op_type: &str,
        name: impl Into<String>,
        input: Vec<String>,
        output: Vec<String>,
    ) -> Self {
        Self { op_type: op_type.into(), name: name.into(), input, output, ..Default::default() }
    }

    pub fn with_attribute(mut self, attribute: AttributeProto) -> Self {
        self.attribute.push(attribute);
        self
    }

    pub fn attr(&self, name: &str) -> Option<&AttributeProto> {
        self.attribute.iter().find(|a| a.name == name)
    }

    pub fn attr_int(&self, name: &str, default: i64) -> i64 {
        self.attr(name).map_or(default, |a| a.i)
    }

    pub fn attr_float(&self, name: &str, default: f32) -> f32 {
        self.attr(name).map_or(default, |a| a.f)
    }

    pub fn attr_ints(&self, name: &str) -> Option<&[i64]> {
        self.attr(name).map(|a| a.ints.as_slice())
    }

    /// Node label for diagnostics: the name, or the op type and first output.
    pub fn label(&self) -> String {
        if self.name.is_empty() {
            format!("{}({})", self.op_type, self.output.first().map_or("", String::as_str))
        } else {
            self.name.clone()
        }
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut r = ProtoReader::new(data);
        let mut n = Self::default();
        while r.has_more() {
            let tag_start = r.position();
            let (field, wire) = r.read_tag()?;
            match field {
                1 => n.input.push(r.read_string(field)?),
                2 => n.output.push(r.read_string(field)?),
                3 => n.name = r.read_string(field)?,
                4 => n.op_type = r.read_string(field)?,
                5 => n.attribute.push(AttributeProto::decode(r.read_bytes()?)?),
                6 => n.doc_string = r.read_string(field)?,
                7 => n.domain = r.read_string(field)?,
                _ => r.skip_into(tag_start, field, wire, &mut n.unknown_fields)?,
            }
        }
        Ok(n)
    }

    fn encode(&self, w: &mut ProtoWriter) {
        // empty names mark omitted optional inputs and must be kept positional
        for input in &self.input {
            w.bytes(1, input.as_bytes());
        }
        for output in &self.output {
            w.bytes(2, output.as_bytes());
        }
        w.string(3, &self.name);
        w.string(4, &self.op_type);
        for a in &self.attribute {
            w.message(5, |m| a.encode(m));
        }
        w.string(6, &self.doc_string);
        w.string(7, &self.domain);
        w.raw(&self.unknown_fields);
    }
}

// ---------------------------------------------------------------------------
// ValueInfoProto / TypeProto
// ---------------------------------------------------------------------------

/// One dimension of a tensor shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dim {
    Value(i64),
    Param(String),
}

impl std::fmt::Display for Dim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dim::Value(v) => write!(f, "{v}"),
            Dim::Param(p) => write!(f, "{p}"),
        }
    }
}

/// Tensor type information (`TypeProto.Tensor`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TensorTypeProto {
    pub elem_type: i32,
    /// `None` when the shape is unknown (field absent).
    pub shape: Option<Vec<Dim>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueInfoProto {
    pub name: String,
    pub tensor_type: Option<TensorTypeProto>,
    pub doc_string: String,
    /// Raw `TypeProto` bytes when the type is not a tensor type.
    pub other_type: Vec<u8>,
}

impl ValueInfoProto {
    pub fn tensor(name: &str, elem_type: i32, dims: Vec<Dim>) -> Self {
        Self {
            name: name.into(),
            tensor_type: Some(TensorTypeProto { elem_type, shape: Some(dims) }),
            ..Default::default()
        }
    }

    pub fn dims(&self) -> Option<&[Dim]> {
        self.tensor_type.as_ref().and_then(|t| t.shape.as_deref())
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut r = ProtoReader::new(data);
        let mut v = Self::default();
        while r.has_more() {
            let (field, wire) = r.read_tag()?;
            match field {
                1 => v.name = r.read_string(field)?,
                2 => {
                    let bytes = r.read_bytes()?;
                    match decode_type_proto(bytes)? {
                        Some(tensor_type) => v.tensor_type = Some(tensor_type),
                        None => v.other_type = bytes.to_vec(),
                    }
                }
                3 => v.doc_string = r.read_string(field)?,
                _ => r.skip(field, wire)?,
            }
        }
        Ok(v)
    }

    fn encode(&self, w: &mut ProtoWriter) {
        w.string(1, &self.name);
        if let Some(tensor_type) = &self.tensor_type {
            w.message(2, |ty| {
                ty.message(1, |tt| {
                    tt.int64(1, i64::from(tensor_type.elem_type));
                    if let Some(dims) = &tensor_type.shape {
                        tt.message(2, |shape| {
                            for dim in dims {
                                shape.message(1, |d| match dim {
                                    Dim::Value(v) => d.int64_always(1, *v),
                                    Dim::Param(p) => d.bytes(2, p.as_bytes()),
                                });
                            }
                        });
                    }
                });
            });
        } else if !self.other_type.is_empty() {
            w.bytes(2, &self.other_type);
        }
        w.string(3, &self.doc_string);
    }
}

/// Decode a `TypeProto`; `None` when it is not a tensor type.
fn decode_type_proto(data: &[u8]) -> Result<Option<TensorTypeProto>> {
    let mut r = ProtoReader::new(data);
    let mut out = None;
    while r.has_more() {
        let (field, wire) = r.read_tag()?;
        if field != 1 {
            r.skip(field, wire)?;
            continue;
        }
        let mut tt = TensorTypeProto::default();
        let mut inner = ProtoReader::new(r.read_bytes()?);
        while inner.has_more() {
            let (field, wire) = inner.read_tag()?;
            match field {
                1 => tt.elem_type = inner.read_int64()? as i32,
                2 => tt.shape = Some(decode_shape(inner.read_bytes()?)?),
                _ => inner.skip(field, wire)?,
            }
        }
        out = Some(tt);
    }
    Ok(out)
}

fn decode_shape(data: &[u8]) -> Result<Vec<Dim>> {
    let mut r = ProtoReader::new(data);
    let mut dims = Vec::new();
    while r.has_more() {
        let (field, wire) = r.read_tag()?;
        if field != 1 {
            r.skip(field, wire)?;
            continue;
        }
        let mut dim = Dim::Value(0);
        let mut d = ProtoReader::new(r.read_bytes()?);
        while d.has_more() {
            let (field, wire) = d.read_tag()?;
            match field {
                1 => dim = Dim::Value(d.read_int64()?),
                2 => dim = Dim::Param(d.read_string(field)?),
                _ => d.skip(field, wire)?,
            }
        }
        dims.push(dim);
    }
    Ok(dims)
}

// ---------------------------------------------------------------------------
// GraphProto
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphProto {
    pub name: String,
    pub node: Vec<NodeProto>,
    pub initializer: Vec<TensorProto>,
    pub input: Vec<ValueInfoProto>,
    pub output: Vec<ValueInfoProto>,
    pub value_info: Vec<ValueInfoProto>,
    pub doc_string: String,
    pub unknown_fields: Vec<u8>,
}

impl GraphProto {
    pub fn initializer(&self, name: &str) -> Option<&TensorProto> {
        self.initializer.iter().find(|t| t.name == name)
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut r = ProtoReader::new(data);
        let mut g = Self::default();
        while r.has_more() {
            let tag_start = r.position();
            let (field, wire) = r.read_tag()?;
            match field {
                1 => g.node.push(NodeProto::decode(r.read_bytes()?)?),
                2 => g.name = r.read_string(field)?,
                5 => g.initializer.push(TensorProto::decode(r.read_bytes()?)?),
                10 => g.doc_string = r.read_string(field)?,
                11 => g.input.push(ValueInfoProto::decode(r.read_bytes()?)?),
                12 => g.output.push(ValueInfoProto::decode(r.read_bytes()?)?),
                13 => g.value_info.push(ValueInfoProto::decode(r.read_bytes()?)?),
                _ => r.skip_into(tag_start, field, wire, &mut g.unknown_fields)?,
            }
        }
        Ok(g)
    }

    fn encode(&self, w: &mut ProtoWriter) {
        for n in &self.node {
            w.message(1, |m| n.encode(m));
        }
        w.string(2, &self.name);
        for t in &self.initializer {
            w.message(5, |m| t.encode(m));
        }
        w.string(10, &self.doc_string);
        for v in &self.input {
            w.message(11, |m| v.encode(m));
        }
        for v in &self.output {
            w.message(12, |m| v.encode(m));
        }
        for v in &self.value_info {
            w.message(13, |m| v.encode(m));
        }
        w.raw(&self.unknown_fields);
    }
}

// ---------------------------------------------------------------------------
// ModelProto
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelProto {
    pub ir_version: i64,
    pub opset_import: Vec<OperatorSetId>,
    pub producer_name: String,
    pub producer_version: String,
    pub domain: String,
    pub model_version: i64,
    pub doc_string: String,
    pub graph: GraphProto,
    pub metadata_props: Vec<StringStringEntry>,
    pub unknown_fields: Vec<u8>,
}

impl ModelProto {
    /// Opset version imported for the default (`ai.onnx`) domain.
    pub fn opset_version(&self) -> Option<i64> {
        self.opset_import
            .iter()
            .find(|o| o.domain == DEFAULT_DOMAIN || o.domain == "ai.onnx")
            .map(|o| o.version)
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata_props.iter().find(|e| e.key == key).map(|e| e.value.as_str())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = ProtoReader::new(data);
        let mut m = Self::default();
        let mut has_graph = false;
        while r.has_more() {
            let tag_start = r.position();
            let (field, wire) = r.read_tag()?;
            match field {
                1 => m.ir_version = r.read_int64()?,
                2 => m.producer_name = r.read_string(field)?,
                3 => m.producer_version = r.read_string(field)?,
                4 => m.domain = r.read_string(field)?,
                5 => m.model_version = r.read_int64()?,
                6 => m.doc_string = r.read_string(field)?,
                7 => {
                    m.graph = GraphProto::decode(r.read_bytes()?)?;
                    has_graph = true;
                }
                8 => m.opset_import.push(OperatorSetId::decode(r.read_bytes()?)?),
                14 => m.metadata_props.push(StringStringEntry::decode(r.read_bytes()?)?),
                _ => r.skip_into(tag_start, field, wire, &mut m.unknown_fields)?,
            }
        }
        if !has_graph {
            return Err(OnnxError::MissingGraph);
        }
        Ok(m)
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut w = ProtoWriter::new();
        w.int64(1, self.ir_version);
        w.string(2, &self.producer_name);
        w.string(3, &self.producer_version);
        w.string(4, &self.domain);
        w.int64(5, self.model_version);
        w.string(6, &self.doc_string);
        w.message(7, |g| self.graph.encode(g));
        for o in &self.opset_import {
            w.message(8, |m| o.encode(m));
        }
        for e in &self.metadata_props {
            w.message(14, |m| e.encode(m));
        }
        w.raw(&self.unknown_fields);
        w.into_bytes()
    }
}
