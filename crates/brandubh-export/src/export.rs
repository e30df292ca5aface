//! ONNX graph emission for an instantiated [`BrandubhNet`].
//!
//! Batch norms are folded into the convolution before them, so the emitted
//! graph only uses `Conv`, `Relu`, `Add`, `GlobalAveragePool`, `Flatten`,
//! `Gemm`, `Sigmoid`, `Reshape`, `Mul`, `Softmax` and `Tanh`. Node and value
//! names follow the `/<module path>/<Op>` scheme of traced exports so that
//! artifacts diff cleanly against ones produced by other exporters.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use brandubh_net::model::INPUT_PLANES;
use brandubh_net::{BatchNorm2d, BrandubhNet, INPUT_SHAPE, NumericMode, POLICY_SIZE, fold_batch_norm};
use brandubh_onnx::checker::MAX_OPSET;
use brandubh_onnx::{
    AttributeProto, DataType, Dim, GraphProto, ModelProto, NodeProto, OperatorSetId, PRODUCER_NAME,
    StringStringEntry, TensorProto, ValueInfoProto, externalize_initializers, ir_version_for_opset,
    save_model,
};
use candle_core::{DType, Tensor};
use candle_nn::{Conv2d, Linear};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::ExportError;

pub const DEFAULT_OPSET: i64 = 14;
/// Oldest opset the emitted operator set is valid for.
pub const MIN_EXPORT_OPSET: i64 = 11;

pub const INPUT_NAME: &str = "input";
pub const POLICY_OUTPUT: &str = "policy";
pub const VALUE_OUTPUT: &str = "value";
/// Symbolic name of the dynamic leading axis.
pub const BATCH_AXIS: &str = "batch_size";

type Result<T> = std::result::Result<T, ExportError>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExportOptions {
    pub opset: i64,
    pub numeric_mode: NumericMode,
    /// Write initializers of at least this many bytes to `<artifact>.data`.
    pub external_data_threshold: Option<usize>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self { opset: DEFAULT_OPSET, numeric_mode: NumericMode::default(), external_data_threshold: None }
    }
}

/// What [`ArtifactExporter::export`] wrote.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportSummary {
    pub artifact: PathBuf,
    pub opset: i64,
    pub ir_version: i64,
    pub nodes: usize,
    pub initializers: usize,
    pub artifact_bytes: u64,
    /// Subnormal initializer values written as signed zero.
    pub flushed_values: usize,
    pub side_car: Option<PathBuf>,
    pub external_tensors: usize,
}

// ---------------------------------------------------------------------------
// Exporter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ArtifactExporter {
    options: ExportOptions,
}

impl ArtifactExporter {
    pub fn new(options: ExportOptions) -> Result<Self> {
        if !(MIN_EXPORT_OPSET..=MAX_OPSET).contains(&options.opset) {
            return Err(ExportError::UnsupportedOpset {
                opset: options.opset,
                min: MIN_EXPORT_OPSET,
                max: MAX_OPSET,
            });
        }
        Ok(Self { options })
    }

    pub fn options(&self) -> &ExportOptions {
        &self.options
    }

    /// Trace `sample` through the network, then emit the ONNX model.
    ///
    /// Returns the model and the number of flushed subnormal values.
    pub fn build_model(&self, net: &BrandubhNet, sample: &Tensor) -> Result<(ModelProto, usize)> {
        self.trace(net, sample)?;

        let mut builder = GraphBuilder::new(self.options.opset, self.options.numeric_mode);
        builder.emit_network(net)?;
        let flushed = builder.flushed;
        let graph = builder.finish();

        let arch = &net.arch;
        let model = ModelProto {
            ir_version: ir_version_for_opset(self.options.opset),
            opset_import: vec![OperatorSetId { domain: String::new(), version: self.options.opset }],
            producer_name: PRODUCER_NAME.to_string(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
            doc_string: "Brandubh policy/value network".to_string(),
            graph,
            metadata_props: vec![
                StringStringEntry::new("num_residual_blocks", arch.num_residual_blocks.to_string()),
                StringStringEntry::new("num_channels", arch.num_channels.to_string()),
                StringStringEntry::new("value_head_hidden_size", arch.value_head_hidden_size.to_string()),
                StringStringEntry::new("variant", arch.variant.to_string()),
            ],
            ..Default::default()
        };
        Ok((model, flushed))
    }

    /// Export to `path`, creating its directory when missing.
    pub fn export(&self, net: &BrandubhNet, sample: &Tensor, path: &Path) -> Result<ExportSummary> {
        let (mut model, flushed_values) = self.build_model(net, sample)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|source| ExportError::Io { path: parent.to_path_buf(), source })?;
        }

        let external = match self.options.external_data_threshold {
            Some(threshold) => externalize_initializers(&mut model, path, threshold)?,
            None => Default::default(),
        };
        let artifact_bytes = save_model(&model, path)?;

        let summary = ExportSummary {
            artifact: path.to_path_buf(),
            opset: self.options.opset,
            ir_version: model.ir_version,
            nodes: model.graph.node.len(),
            initializers: model.graph.initializer.len(),
            artifact_bytes,
            flushed_values,
            side_car: external.side_car,
            external_tensors: external.tensors,
        };
        info!(
            nodes = summary.nodes,
            initializers = summary.initializers,
            bytes = summary.artifact_bytes,
            "Exported {} (opset {})",
            path.display(),
            summary.opset
        );
        Ok(summary)
    }

    fn trace(&self, net: &BrandubhNet, sample: &Tensor) -> Result<()> {
        if sample.dims() != INPUT_SHAPE.as_slice() {
            return Err(ExportError::InvalidSample { shape: sample.dims().to_vec() });
        }
        let (policy, value) = net.forward(sample, self.options.numeric_mode).map_err(ExportError::Trace)?;
        let expected_policy = vec![1, POLICY_SIZE];
        if policy.dims() != expected_policy.as_slice() {
            return Err(ExportError::UnexpectedOutput {
                output: POLICY_OUTPUT,
                expected: expected_policy,
                actual: policy.dims().to_vec(),
            });
        }
        if value.dims() != [1, 1] {
            return Err(ExportError::UnexpectedOutput {
                output: VALUE_OUTPUT,
                expected: vec![1, 1],
                actual: value.dims().to_vec(),
            });
        }
        let value = value.flatten_all()?.to_vec1::<f32>()?;
        if value.iter().any(|v| !v.is_finite()) {
            warn!("sample forward pass produced a non-finite value head output");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Graph builder
// ---------------------------------------------------------------------------

struct GraphBuilder {
    graph: GraphProto,
    opset: i64,
    mode: NumericMode,
    flushed: usize,
    /// Uses per `<scope>/<Op>`, for the `_1`, `_2` suffixes.
    seen: HashMap<String, usize>,
}

impl GraphBuilder {
    fn new(opset: i64, mode: NumericMode) -> Self {
        Self {
            graph: GraphProto { name: "main_graph".to_string(), ..Default::default() },
            opset,
            mode,
            flushed: 0,
            seen: HashMap::new(),
        }
    }

    fn finish(self) -> GraphProto {
        self.graph
    }

    fn float_initializer(&mut self, name: &str, tensor: &Tensor) -> Result<String> {
        let mut values = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        self.flushed += self.mode.apply_to_slice(&mut values);
        debug!(initializer = name, shape = ?tensor.dims(), "emitting initializer");
        self.graph.initializer.push(TensorProto::from_f32(name, tensor.dims(), &values));
        Ok(name.to_string())
    }

    fn node(&mut self, op: &str, scope: &str, inputs: Vec<String>, attributes: Vec<AttributeProto>) -> String {
        let base = format!("{scope}/{op}");
        let uses = self.seen.entry(base.clone()).or_insert(0);
        let name = if *uses == 0 { base } else { format!("{base}_{uses}") };
        *uses += 1;
        let output = format!("{name}_output_0");
        self.push_node(op, name, inputs, output.clone(), attributes);
        output
    }

    /// A node writing directly to a graph output.
    fn output_node(&mut self, op: &str, scope: &str, input: String, output: &str, attributes: Vec<AttributeProto>) {
        self.push_node(op, format!("{scope}/{op}"), vec![input], output.to_string(), attributes);
    }

    fn push_node(
        &mut self,
        op: &str,
        name: String,
        inputs: Vec<String>,
        output: String,
        attributes: Vec<AttributeProto>,
    ) {
        let node = attributes
            .into_iter()
            .fold(NodeProto::new(op, name, inputs, vec![output]), NodeProto::with_attribute);
        self.graph.node.push(node);
    }

    // -- layers ---------------------------------------------------------------

    /// `Conv` with the following batch norm folded in.
    fn conv_bn(&mut self, prefix: &str, conv: &Conv2d, bn: &BatchNorm2d, x: String) -> Result<String> {
        let config = conv.config();
        if config.groups != 1 || config.stride != 1 || config.dilation != 1 {
            return Err(ExportError::UnsupportedLayer {
                layer: prefix.to_string(),
                reason: format!(
                    "only dense stride-1 convolutions are exported (groups {}, stride {}, dilation {})",
                    config.groups, config.stride, config.dilation
                ),
            });
        }
        let (weight, bias) = fold_batch_norm(conv, bn)?;
        let dims = weight.dims();
        if dims.len() != 4 || dims[2] != dims[3] {
            return Err(ExportError::UnsupportedLayer {
                layer: prefix.to_string(),
                reason: format!("expected a square 2-D kernel, got {dims:?}"),
            });
        }
        let kernel = dims[2] as i64;
        let pad = config.padding as i64;

        let w = self.float_initializer(&format!("{prefix}.weight"), &weight)?;
        let b = self.float_initializer(&format!("{prefix}.bias"), &bias)?;
        let attributes = vec![
            AttributeProto::ints("dilations", &[1, 1]),
            AttributeProto::int("group", 1),
            AttributeProto::ints("kernel_shape", &[kernel, kernel]),
            AttributeProto::ints("pads", &[pad, pad, pad, pad]),
            AttributeProto::ints("strides", &[1, 1]),
        ];
        Ok(self.node("Conv", &format!("/{prefix}"), vec![x, w, b], attributes))
    }

    /// `Gemm` computing `x @ W^T + b` from a `[out, in]` weight.
    fn linear(&mut self, prefix: &str, scope: &str, layer: &Linear, x: String) -> Result<String> {
        let w = self.float_initializer(&format!("{prefix}.weight"), layer.weight())?;
        let mut inputs = vec![x, w];
        if let Some(bias) = layer.bias() {
            inputs.push(self.float_initializer(&format!("{prefix}.bias"), bias)?);
        }
        let attributes = vec![
            AttributeProto::float("alpha", 1.0),
            AttributeProto::float("beta", 1.0),
            AttributeProto::int("transB", 1),
        ];
        Ok(self.node("Gemm", scope, inputs, attributes))
    }

    fn relu(&mut self, scope: &str, x: String) -> String {
        self.node("Relu", scope, vec![x], Vec::new())
    }

    fn flatten(&mut self, scope: &str, x: String) -> String {
        self.node("Flatten", scope, vec![x], vec![AttributeProto::int("axis", 1)])
    }

    // -- network --------------------------------------------------------------

    fn emit_network(&mut self, net: &BrandubhNet) -> Result<()> {
        self.graph.input.push(ValueInfoProto::tensor(
            INPUT_NAME,
            DataType::Float.as_i32(),
            vec![
                Dim::Param(BATCH_AXIS.into()),
                Dim::Value(INPUT_PLANES as i64),
                Dim::Value(INPUT_SHAPE[2] as i64),
                Dim::Value(INPUT_SHAPE[3] as i64),
            ],
        ));

        let x = self.conv_bn("conv_input", &net.conv_input, &net.bn_input, INPUT_NAME.to_string())?;
        let mut x = self.relu("", x);

        let channels = net.arch.num_channels;
        for (i, block) in net.res_blocks.iter().enumerate() {
            let scope = format!("/res_blocks.{i}");
            let out = self.conv_bn(&format!("res_blocks.{i}.conv1"), &block.conv1, &block.bn1, x.clone())?;
            let out = self.relu(&scope, out);
            let mut out = self.conv_bn(&format!("res_blocks.{i}.conv2"), &block.conv2, &block.bn2, out)?;

            if let Some(se) = &block.se {
                let se_scope = format!("{scope}/se");
                let pooled = self.node("GlobalAveragePool", &se_scope, vec![out.clone()], Vec::new());
                let pooled = self.flatten(&se_scope, pooled);
                let hidden =
                    self.linear(&format!("res_blocks.{i}.se.0"), &format!("{se_scope}/se.0"), &se.fc1, pooled)?;
                let hidden = self.relu(&format!("{se_scope}/se.1"), hidden);
                let gate =
                    self.linear(&format!("res_blocks.{i}.se.2"), &format!("{se_scope}/se.2"), &se.fc2, hidden)?;
                let gate = self.node("Sigmoid", &format!("{se_scope}/se.3"), vec![gate], Vec::new());
                let shape_name = format!("res_blocks.{i}.se.gate_shape");
                self.graph
                    .initializer
                    .push(TensorProto::from_i64(&shape_name, &[4], &[-1, channels as i64, 1, 1]));
                let gate = self.node("Reshape", &se_scope, vec![gate, shape_name], Vec::new());
                out = self.node("Mul", &se_scope, vec![out, gate], Vec::new());
            }

            let sum = self.node("Add", &scope, vec![out, x], Vec::new());
            x = self.relu(&scope, sum);
        }

        // policy head
        let p = self.conv_bn("conv_policy", &net.conv_policy, &net.bn_policy, x.clone())?;
        let p = self.relu("", p);
        let p = self.flatten("", p);
        let p = self.linear("fc_policy", "/fc_policy", &net.fc_policy, p)?;
        // opset < 13 Softmax coerces to 2-D at `axis`, which is the last axis here
        let axis = if self.opset >= 13 { -1 } else { 1 };
        self.output_node("Softmax", "", p, POLICY_OUTPUT, vec![AttributeProto::int("axis", axis)]);

        // value head
        let v = self.conv_bn("conv_value", &net.conv_value, &net.bn_value, x)?;
        let v = self.relu("", v);
        let v = self.flatten("", v);
        let v = self.linear("fc_value1", "/fc_value1", &net.fc_value1, v)?;
        let v = self.relu("", v);
        let v = self.linear("fc_value2", "/fc_value2", &net.fc_value2, v)?;
        self.output_node("Tanh", "", v, VALUE_OUTPUT, Vec::new());

        let float = DataType::Float.as_i32();
        self.graph.output.push(ValueInfoProto::tensor(
            POLICY_OUTPUT,
            float,
            vec![Dim::Param(BATCH_AXIS.into()), Dim::Value(POLICY_SIZE as i64)],
        ));
        self.graph.output.push(ValueInfoProto::tensor(
            VALUE_OUTPUT,
            float,
            vec![Dim::Param(BATCH_AXIS.into()), Dim::Value(1)],
        ));
        Ok(())
    }
}
