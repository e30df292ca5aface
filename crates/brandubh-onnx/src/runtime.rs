//! Reference interpreter for the operator subset used by Brandubh artifacts.
//!
//! Float values are candle `f32` tensors on the CPU. Quantized values
//! (`uint8`, `int8`, `int32`) are carried as integral `f32` tensors tagged with
//! their ONNX element type; `QLinear*` operators dequantize, compute in `f32`
//! and requantize with round-half-to-even, matching the ONNX reference
//! semantics up to float rounding of the accumulator.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use tracing::{debug, trace};

use crate::checker::MAX_OPSET;
use crate::error::RuntimeError;
use crate::io::load_model;
use crate::proto::{Dim, ModelProto, NodeProto};
use crate::tensor::{DataType, TensorProto};

type Result<T> = std::result::Result<T, RuntimeError>;

/// Operators [`Session`] can execute (default domain).
pub const SUPPORTED_OPERATORS: &[&str] = &[
    "Add",
    "BatchNormalization",
    "Constant",
    "Conv",
    "DequantizeLinear",
    "Div",
    "Flatten",
    "Gemm",
    "GlobalAveragePool",
    "Identity",
    "MatMul",
    "Mul",
    "QLinearConv",
    "QLinearMatMul",
    "QuantizeLinear",
    "Relu",
    "Reshape",
    "Sigmoid",
    "Softmax",
    "Sub",
    "Tanh",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionOptions {
    /// Replace subnormal results (and initializers) with signed zero.
    pub flush_subnormals: bool,
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A runtime value: an `f32` tensor and the ONNX element type it represents.
#[derive(Debug, Clone)]
pub struct Value {
    pub tensor: Tensor,
    pub elem_type: DataType,
}

impl Value {
    pub fn float(tensor: Tensor) -> Self {
        Self { tensor, elem_type: DataType::Float }
    }

    pub fn is_float(&self) -> bool {
        self.elem_type == DataType::Float
    }

    pub fn to_vec(&self) -> Result<Vec<f32>> {
        Ok(self.tensor.flatten_all()?.to_vec1::<f32>()?)
    }

    fn from_proto(proto: &TensorProto) -> Result<Self> {
        let values = proto.to_f32_vec()?;
        let tensor = Tensor::from_vec(values, proto.shape(), &Device::Cpu)?;
        let elem_type = match proto.data_type() {
            Some(DataType::Double | DataType::Float16 | DataType::BFloat16) | None => DataType::Float,
            Some(other) => other,
        };
        Ok(Self { tensor, elem_type })
    }

    fn scalar(&self, node: &str) -> Result<f32> {
        let values = self.to_vec()?;
        match values.as_slice() {
            [v] => Ok(*v),
            _ => Err(RuntimeError::invalid(
                node,
                format!("expected a scalar, got shape {:?} (per-axis parameters are unsupported)", self.tensor.dims()),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Quantization helpers
// ---------------------------------------------------------------------------

/// Saturation bounds of a quantized element type.
pub fn quant_bounds(elem_type: DataType) -> Option<(f32, f32)> {
    match elem_type {
        DataType::Uint8 => Some((0.0, 255.0)),
        DataType::Int8 => Some((-128.0, 127.0)),
        DataType::Int32 => Some((i32::MIN as f32, i32::MAX as f32)),
        _ => None,
    }
}

/// `saturate(round_half_even(x / scale) + zero_point)`.
pub fn quantize_value(x: f32, scale: f32, zero_point: f32, bounds: (f32, f32)) -> f32 {
    ((x / scale).round_ties_even() + zero_point).clamp(bounds.0, bounds.1)
}

fn quantize_tensor(x: &Tensor, scale: f32, zero_point: f32, elem_type: DataType, node: &str) -> Result<Value> {
    let bounds = quant_bounds(elem_type)
        .ok_or_else(|| RuntimeError::invalid(node, format!("cannot quantize to {elem_type}")))?;
    if !(scale.is_finite() && scale > 0.0) {
        return Err(RuntimeError::invalid(node, format!("invalid scale {scale}")));
    }
    let values: Vec<f32> = x
        .flatten_all()?
        .to_vec1::<f32>()?
        .into_iter()
        .map(|v| quantize_value(v, scale, zero_point, bounds))
        .collect();
    let tensor = Tensor::from_vec(values, x.dims(), x.device())?;
    Ok(Value { tensor, elem_type })
}

fn dequantize(x: &Value, scale: &Value, zero_point: Option<&Value>, node: &str) -> Result<Tensor> {
    let scale = scale.scalar(node)?;
    let zero_point = match zero_point {
        Some(zp) => zp.scalar(node)?,
        None => 0.0,
    };
    Ok(x.tensor.affine(f64::from(scale), -f64::from(zero_point) * f64::from(scale))?)
}

fn flush_subnormals(t: &Tensor) -> candle_core::Result<Tensor> {
    let mut values = t.flatten_all()?.to_vec1::<f32>()?;
    let mut flushed = 0usize;
    for v in &mut values {
        if v.is_subnormal() {
            *v = 0.0f32.copysign(*v);
            flushed += 1;
        }
    }
    if flushed == 0 {
        return Ok(t.clone());
    }
    Tensor::from_vec(values, t.dims(), t.device())
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// An executable, immutable model.
pub struct Session {
    model: ModelProto,
    initializers: HashMap<String, Value>,
    opset: i64,
    options: SessionOptions,
}

impl Session {
    /// Decode every initializer up front. External data must already be
    /// embedded.
    pub fn new(model: ModelProto, options: SessionOptions) -> Result<Self> {
        let mut initializers = HashMap::with_capacity(model.graph.initializer.len());
        for proto in &model.graph.initializer {
            let mut value = Value::from_proto(proto)?;
            if options.flush_subnormals && value.is_float() {
                value.tensor = flush_subnormals(&value.tensor)?;
            }
            initializers.insert(proto.name.clone(), value);
        }
        let opset = model.opset_version().unwrap_or(MAX_OPSET);
        debug!(
            nodes = model.graph.node.len(),
            initializers = initializers.len(),
            opset,
            "created session"
        );
        Ok(Self { model, initializers, opset, options })
    }

    pub fn load(path: impl AsRef<Path>, options: SessionOptions) -> Result<Self> {
        Self::new(load_model(path)?, options)
    }

    pub fn model(&self) -> &ModelProto {
        &self.model
    }

    /// Graph inputs that are not backed by an initializer.
    pub fn input_names(&self) -> Vec<&str> {
        self.model
            .graph
            .input
            .iter()
            .map(|v| v.name.as_str())
            .filter(|name| !self.initializers.contains_key(*name))
            .collect()
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.model.graph.output.iter().map(|v| v.name.as_str()).collect()
    }

    pub fn run(&self, inputs: &[(&str, Tensor)]) -> Result<HashMap<String, Tensor>> {
        self.run_with_observer(inputs, |_, _| {})
    }

    /// Run the graph, calling `observer` with every graph input and every
    /// node output as it is produced.
    pub fn run_with_observer(
        &self,
        inputs: &[(&str, Tensor)],
        mut observer: impl FnMut(&str, &Value),
    ) -> Result<HashMap<String, Tensor>> {
        let mut env = self.initializers.clone();
        for declared in &self.model.graph.input {
            if self.initializers.contains_key(&declared.name) {
                continue;
            }
            let tensor = inputs
                .iter()
                .find(|(name, _)| *name == declared.name)
                .map(|(_, t)| t)
                .ok_or_else(|| RuntimeError::MissingInput(declared.name.clone()))?;
            if let Some(dims) = declared.dims() {
                check_input_shape(&declared.name, dims, tensor.dims())?;
            }
            let value = Value::float(tensor.to_dtype(DType::F32)?);
            observer(&declared.name, &value);
            env.insert(declared.name.clone(), value);
        }

        for node in &self.model.graph.node {
            let mut value = self.execute(node, &env)?;
            let Some(name) = node.output.first().filter(|n| !n.is_empty()) else {
                continue;
            };
            if self.options.flush_subnormals && value.is_float() {
                value.tensor = flush_subnormals(&value.tensor)?;
            }
            trace!(node = %node.label(), output = %name, shape = ?value.tensor.dims(), "evaluated");
            observer(name, &value);
            env.insert(name.clone(), value);
        }

        let mut outputs = HashMap::new();
        for declared in &self.model.graph.output {
            let value = env
                .remove(&declared.name)
                .ok_or_else(|| RuntimeError::MissingOutput(declared.name.clone()))?;
            outputs.insert(declared.name.clone(), value.tensor);
        }
        Ok(outputs)
    }

    fn execute(&self, node: &NodeProto, env: &HashMap<String, Value>) -> Result<Value> {
        let label = node.label();
        let value = match node.op_type.as_str() {
            "Identity" => arg(env, node, 0)?.clone(),
            "Constant" => {
                let proto = node
                    .attr("value")
                    .and_then(|a| a.t.as_ref())
                    .ok_or_else(|| RuntimeError::invalid(&label, "Constant without tensor `value`"))?;
                Value::from_proto(proto)?
            }
            "Relu" => Value::float(arg(env, node, 0)?.tensor.relu()?),
            "Sigmoid" => Value::float(candle_nn::ops::sigmoid(&arg(env, node, 0)?.tensor)?),
            "Tanh" => Value::float(arg(env, node, 0)?.tensor.tanh()?),
            "Add" => binary(env, node, |a, b| a.broadcast_add(b))?,
            "Sub" => binary(env, node, |a, b| a.broadcast_sub(b))?,
            "Mul" => binary(env, node, |a, b| a.broadcast_mul(b))?,
            "Div" => binary(env, node, |a, b| a.broadcast_div(b))?,
            "Conv" => {
                let params = Conv2dParams::from_node(node)?;
                let x = &arg(env, node, 0)?.tensor;
                let w = &arg(env, node, 1)?.tensor;
                let b = opt_arg(env, node, 2)?.map(|v| v.tensor.clone());
                Value::float(conv2d(x, w, b.as_ref(), &params)?)
            }
            "BatchNormalization" => Value::float(batch_norm(env, node)?),
            "GlobalAveragePool" => {
                let x = &arg(env, node, 0)?.tensor;
                if x.rank() != 4 {
                    return Err(RuntimeError::invalid(&label, "GlobalAveragePool expects NCHW"));
                }
                Value::float(x.mean_keepdim(3)?.mean_keepdim(2)?)
            }
            "Flatten" => {
                let x = arg(env, node, 0)?;
                let dims = x.tensor.dims();
                let axis = normalize_axis(node.attr_int("axis", 1), dims.len(), dims.len(), &label)?;
                let outer: usize = dims[..axis].iter().product();
                let inner: usize = dims[axis..].iter().product();
                Value { tensor: x.tensor.reshape((outer, inner))?, elem_type: x.elem_type }
            }
            "Gemm" => Value::float(gemm(env, node)?),
            "MatMul" => {
                let a = &arg(env, node, 0)?.tensor;
                let b = &arg(env, node, 1)?.tensor;
                Value::float(matmul(a, b)?)
            }
            "Reshape" => reshape(env, node)?,
            "Softmax" => {
                let x = &arg(env, node, 0)?.tensor;
                let rank = x.rank();
                let default_axis = if self.opset >= 13 { -1 } else { 1 };
                let axis =
                    normalize_axis(node.attr_int("axis", default_axis), rank, rank.saturating_sub(1), &label)?;
                if self.opset < 13 && axis + 1 != rank {
                    return Err(RuntimeError::invalid(
                        &label,
                        "opset < 13 Softmax is only supported on the last axis",
                    ));
                }
                Value::float(candle_nn::ops::softmax(x, axis)?)
            }
            "QuantizeLinear" => {
                let x = &arg(env, node, 0)?.tensor;
                let scale = arg(env, node, 1)?.scalar(&label)?;
                let (zero_point, elem_type) = match opt_arg(env, node, 2)? {
                    Some(zp) => (zp.scalar(&label)?, zp.elem_type),
                    None => (0.0, DataType::Uint8),
                };
                quantize_tensor(x, scale, zero_point, elem_type, &label)?
            }
            "DequantizeLinear" => {
                let x = arg(env, node, 0)?;
                let scale = arg(env, node, 1)?;
                Value::float(dequantize(x, scale, opt_arg(env, node, 2)?, &label)?)
            }
            "QLinearConv" => {
                let params = Conv2dParams::from_node(node)?;
                let x = dequantize(arg(env, node, 0)?, arg(env, node, 1)?, opt_arg(env, node, 2)?, &label)?;
                let w = dequantize(arg(env, node, 3)?, arg(env, node, 4)?, opt_arg(env, node, 5)?, &label)?;
                let bias = match opt_arg(env, node, 8)? {
                    Some(b) => {
                        let bias_scale = arg(env, node, 1)?.scalar(&label)? * arg(env, node, 4)?.scalar(&label)?;
                        Some(b.tensor.affine(f64::from(bias_scale), 0.0)?)
                    }
                    None => None,
                };
                let y = conv2d(&x, &w, bias.as_ref(), &params)?;
                requantize(env, node, &y, 6, 7)?
            }
            "QLinearMatMul" => {
                let a = dequantize(arg(env, node, 0)?, arg(env, node, 1)?, opt_arg(env, node, 2)?, &label)?;
                let b = dequantize(arg(env, node, 3)?, arg(env, node, 4)?, opt_arg(env, node, 5)?, &label)?;
                let y = matmul(&a, &b)?;
                requantize(env, node, &y, 6, 7)?
            }
            other => {
                return Err(RuntimeError::UnsupportedOperator {
                    node: label,
                    op_type: other.to_string(),
                });
            }
        };
        Ok(value)
    }
}

fn check_input_shape(name: &str, declared: &[Dim], actual: &[usize]) -> Result<()> {
    let matches = declared.len() == actual.len()
        && declared.iter().zip(actual).all(|(d, &a)| match d {
            Dim::Value(v) if *v > 0 => *v as usize == a,
            _ => true,
        });
    if matches {
        return Ok(());
    }
    let expected = declared.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
    Err(RuntimeError::InputShape {
        name: name.to_string(),
        expected: format!("[{expected}]"),
        actual: actual.to_vec(),
    })
}

// ---------------------------------------------------------------------------
// Operator kernels
// ---------------------------------------------------------------------------

fn arg<'e>(env: &'e HashMap<String, Value>, node: &NodeProto, index: usize) -> Result<&'e Value> {
    opt_arg(env, node, index)?
        .ok_or_else(|| RuntimeError::invalid(&node.label(), format!("missing input #{index}")))
}

fn opt_arg<'e>(
    env: &'e HashMap<String, Value>,
    node: &NodeProto,
    index: usize,
) -> Result<Option<&'e Value>> {
    match node.input.get(index).filter(|name| !name.is_empty()) {
        Some(name) => env.get(name).map(Some).ok_or_else(|| RuntimeError::UndefinedValue {
            node: node.label(),
            name: name.clone(),
        }),
        None => Ok(None),
    }
}

fn binary(
    env: &HashMap<String, Value>,
    node: &NodeProto,
    op: impl Fn(&Tensor, &Tensor) -> candle_core::Result<Tensor>,
) -> Result<Value> {
    let a = arg(env, node, 0)?;
    let b = arg(env, node, 1)?;
    Ok(Value { tensor: op(&a.tensor, &b.tensor)?, elem_type: a.elem_type })
}

fn requantize(
    env: &HashMap<String, Value>,
    node: &NodeProto,
    y: &Tensor,
    scale_index: usize,
    zero_point_index: usize,
) -> Result<Value> {
    let label = node.label();
    let scale = arg(env, node, scale_index)?.scalar(&label)?;
    let zero_point = arg(env, node, zero_point_index)?;
    quantize_tensor(y, scale, zero_point.scalar(&label)?, zero_point.elem_type, &label)
}

fn normalize_axis(axis: i64, rank: usize, max: usize, node: &str) -> Result<usize> {
    let resolved = if axis < 0 { axis + rank as i64 } else { axis };
    if resolved < 0 || resolved as usize > max {
        return Err(RuntimeError::invalid(node, format!("axis {axis} out of range for rank {rank}")));
    }
    Ok(resolved as usize)
}

/// Square 2-D convolution parameters; asymmetric padding is unsupported.
struct Conv2dParams {
    padding: usize,
    stride: usize,
    dilation: usize,
    groups: usize,
}

impl Conv2dParams {
    fn from_node(node: &NodeProto) -> Result<Self> {
        let label = node.label();
        if let Some(auto_pad) = node.attr("auto_pad") {
            let mode = String::from_utf8_lossy(&auto_pad.s);
            if !(mode.is_empty() || mode == "NOTSET") {
                return Err(RuntimeError::invalid(&label, format!("auto_pad={mode} is unsupported")));
            }
        }
        let uniform = |name: &str, default: usize, len: usize| -> Result<usize> {
            match node.attr_ints(name) {
                None | Some([]) => Ok(default),
                Some(values) => {
                    let first = values[0];
                    if values.len() != len || first < 0 || values.iter().any(|&v| v != first) {
                        Err(RuntimeError::invalid(
                            &label,
                            format!("{name}={values:?} must be {len} equal non-negative values"),
                        ))
                    } else {
                        Ok(first as usize)
                    }
                }
            }
        };
        let groups = node.attr_int("group", 1);
        if groups < 1 {
            return Err(RuntimeError::invalid(&label, format!("group={groups}")));
        }
        Ok(Self {
            padding: uniform("pads", 0, 4)?,
            stride: uniform("strides", 1, 2)?,
            dilation: uniform("dilations", 1, 2)?,
            groups: groups as usize,
        })
    }
}

fn conv2d(
    x: &Tensor,
    w: &Tensor,
    bias: Option<&Tensor>,
    p: &Conv2dParams,
) -> candle_core::Result<Tensor> {
    let y = x.contiguous()?.conv2d(&w.contiguous()?, p.padding, p.stride, p.dilation, p.groups)?;
    match bias {
        Some(b) => y.broadcast_add(&b.reshape((1, b.elem_count(), 1, 1))?),
        None => Ok(y),
    }
}

fn matmul(a: &Tensor, b: &Tensor) -> candle_core::Result<Tensor> {
    if a.rank() == b.rank() {
        a.contiguous()?.matmul(&b.contiguous()?)
    } else {
        a.contiguous()?.broadcast_matmul(&b.contiguous()?)
    }
}

fn gemm(env: &HashMap<String, Value>, node: &NodeProto) -> Result<Tensor> {
    let a = &arg(env, node, 0)?.tensor;
    let b = &arg(env, node, 1)?.tensor;
    let alpha = node.attr_float("alpha", 1.0);
    let beta = node.attr_float("beta", 1.0);
    let a = if node.attr_int("transA", 0) != 0 { a.t()? } else { a.clone() };
    let b = if node.attr_int("transB", 0) != 0 { b.t()? } else { b.clone() };
    let mut y = matmul(&a, &b)?;
    if alpha != 1.0 {
        y = y.affine(f64::from(alpha), 0.0)?;
    }
    if let Some(c) = opt_arg(env, node, 2)? {
        let c = if beta != 1.0 { c.tensor.affine(f64::from(beta), 0.0)? } else { c.tensor.clone() };
        y = y.broadcast_add(&c)?;
    }
    Ok(y)
}

fn batch_norm(env: &HashMap<String, Value>, node: &NodeProto) -> Result<Tensor> {
    let x = &arg(env, node, 0)?.tensor;
    let scale = &arg(env, node, 1)?.tensor;
    let bias = &arg(env, node, 2)?.tensor;
    let mean = &arg(env, node, 3)?.tensor;
    let var = &arg(env, node, 4)?.tensor;
    let eps = node.attr_float("epsilon", 1e-5);
    if x.rank() < 2 {
        return Err(RuntimeError::invalid(&node.label(), "BatchNormalization expects rank >= 2"));
    }
    let mut shape = vec![1usize; x.rank()];
    shape[1] = x.dims()[1];
    let gain = scale.mul(&var.affine(1.0, f64::from(eps))?.sqrt()?.recip()?)?;
    let shift = bias.sub(&mean.mul(&gain)?)?;
    Ok(x.broadcast_mul(&gain.reshape(shape.as_slice())?)?.broadcast_add(&shift.reshape(shape.as_slice())?)?)
}

fn reshape(env: &HashMap<String, Value>, node: &NodeProto) -> Result<Value> {
    let label = node.label();
    let data = arg(env, node, 0)?;
    let requested: Vec<i64> = arg(env, node, 1)?.to_vec()?.into_iter().map(|v| v as i64).collect();
    let allow_zero = node.attr_int("allowzero", 0) != 0;
    let in_dims = data.tensor.dims();

    let mut out = Vec::with_capacity(requested.len());
    let mut inferred = None;
    for (i, &dim) in requested.iter().enumerate() {
        match dim {
            -1 if inferred.is_none() => {
                inferred = Some(i);
                out.push(1);
            }
            0 if !allow_zero => {
                let copied = in_dims
                    .get(i)
                    .ok_or_else(|| RuntimeError::invalid(&label, format!("cannot copy dim {i}")))?;
                out.push(*copied);
            }
            d if d >= 0 => out.push(d as usize),
            d => return Err(RuntimeError::invalid(&label, format!("invalid target dim {d}"))),
        }
    }
    if let Some(i) = inferred {
        let known: usize = out.iter().enumerate().filter(|(j, _)| *j != i).map(|(_, d)| *d).product();
        let total = data.tensor.elem_count();
        if known == 0 || total % known != 0 {
            return Err(RuntimeError::invalid(
                &label,
                format!("cannot reshape {in_dims:?} to {requested:?}"),
            ));
        }
        out[i] = total / known;
    }
    Ok(Value { tensor: data.tensor.reshape(out)?, elem_type: data.elem_type })
}
