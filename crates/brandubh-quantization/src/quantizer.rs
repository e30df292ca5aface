//! Graph rewriting into the QOperator format.
//!
//! `Conv` becomes `QLinearConv` and `MatMul` becomes `QLinearMatMul`.
//! Quantized values flow directly between consecutive quantized operators;
//! `QuantizeLinear` / `DequantizeLinear` nodes appear only where a float
//! value enters or leaves the quantized region.

use std::collections::{HashMap, HashSet};

use brandubh_onnx::{DataType, GraphProto, ModelProto, NodeProto, TensorProto};
use tracing::{debug, info};

use crate::calibrate::CalibrationRanges;
use crate::error::{QuantizationError, Result};
use crate::params::{QuantParams, quantize_bias};

/// Operators rewritten to their quantized form.
pub const QUANTIZABLE_OPERATORS: &[&str] = &["Conv", "MatMul"];

const QUANTIZED_SUFFIX: &str = "_quantized";

// ---------------------------------------------------------------------------
// Preprocessing
// ---------------------------------------------------------------------------

/// Split every `Gemm` with a constant weight into `MatMul` + `Add` so the
/// matrix product can be quantized on its own.
///
/// `Gemm` nodes with `transA`, non-unit `alpha`/`beta` or a non-constant `B`
/// are left alone. Returns the number of nodes split.
pub fn split_gemm(model: &mut ModelProto) -> Result<usize> {
    let graph = &mut model.graph;
    let mut nodes = Vec::with_capacity(graph.node.len());
    let mut new_initializers = Vec::new();
    let mut split = 0;

    for node in std::mem::take(&mut graph.node) {
        let splittable = node.op_type == "Gemm"
            && node.attr_int("transA", 0) == 0
            && node.attr_float("alpha", 1.0) == 1.0
            && node.attr_float("beta", 1.0) == 1.0
            && node.input.len() >= 2
            && node.output.len() == 1;
        let weight = if splittable { graph.initializer(&node.input[1]) } else { None };
        let Some(weight) = weight else {
            nodes.push(node);
            continue;
        };

        let label = node.label();
        let dims = weight.shape();
        if dims.len() != 2 {
            return Err(QuantizationError::UnsupportedGraph {
                node: label,
                reason: format!("Gemm weight has rank {}", dims.len()),
            });
        }
        let matmul_weight = if node.attr_int("transB", 0) != 0 {
            let name = format!("{}_transposed", weight.name);
            let values = weight.to_f32_vec()?;
            let (rows, cols) = (dims[0], dims[1]);
            let mut transposed = vec![0.0f32; values.len()];
            for r in 0..rows {
                for c in 0..cols {
                    transposed[c * rows + r] = values[r * cols + c];
                }
            }
            new_initializers.push(TensorProto::from_f32(&name, &[cols, rows], &transposed));
            name
        } else {
            weight.name.clone()
        };

        let output = node.output[0].clone();
        let bias = node.input.get(2).filter(|b| !b.is_empty()).cloned();
        let base = node.name.strip_suffix("/Gemm").unwrap_or(&node.name).to_string();
        let matmul_out = match bias {
            Some(_) => format!("{base}/MatMul_output_0"),
            None => output.clone(),
        };
        nodes.push(NodeProto::new(
            "MatMul",
            format!("{base}/MatMul"),
            vec![node.input[0].clone(), matmul_weight],
            vec![matmul_out.clone()],
        ));
        if let Some(bias) = bias {
            nodes.push(NodeProto::new("Add", format!("{base}/Add"), vec![matmul_out, bias], vec![output]));
        }
        split += 1;
        debug!(node = %label, "split Gemm into MatMul + Add");
    }

    graph.node = nodes;
    graph.initializer.extend(new_initializers);
    Ok(split)
}

// ---------------------------------------------------------------------------
// Rewrite
// ---------------------------------------------------------------------------

/// Counts reported by [`StaticQuantizer::quantize`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteStats {
    pub nodes_quantized: usize,
    pub relus_fused: usize,
    pub quantize_nodes: usize,
    pub dequantize_nodes: usize,
    pub nodes_removed: usize,
    pub initializers_removed: usize,
}

/// Rewrites a calibrated float graph into QOperator form.
#[derive(Debug, Default)]
pub struct StaticQuantizer {
    nodes: Vec<NodeProto>,
    initializers: Vec<TensorProto>,
    initializer_names: HashSet<String>,
    /// Float value name to its quantized counterpart.
    quantized: HashMap<String, String>,
    /// Values currently available in float form.
    float_values: HashSet<String>,
    stats: RewriteStats,
}

impl StaticQuantizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrite `model` in place using the activation `ranges`.
    pub fn quantize(mut self, model: &mut ModelProto, ranges: &CalibrationRanges) -> Result<RewriteStats> {
        let graph = &mut model.graph;
        let source = std::mem::take(&mut graph.node);
        let consumers = count_consumers(&source, graph.output.iter().map(|o| o.name.as_str()));
        let float_weights: HashMap<String, TensorProto> = graph
            .initializer
            .iter()
            .filter(|t| t.data_type() == Some(DataType::Float))
            .map(|t| (t.name.clone(), t.clone()))
            .collect();
        self.initializer_names = graph.initializer.iter().map(|t| t.name.clone()).collect();
        self.initializers = std::mem::take(&mut graph.initializer);
        self.float_values = graph.input.iter().map(|i| i.name.clone()).collect();
        self.float_values.extend(self.initializer_names.iter().cloned());

        let mut absorbed = HashSet::new();
        for (index, node) in source.iter().enumerate() {
            if absorbed.contains(&index) {
                continue;
            }
            let weight = node.input.get(1).and_then(|w| float_weights.get(w));
            match (node.op_type.as_str(), weight) {
                ("Conv", Some(weight)) => {
                    let relu = fusable_relu(&source, index, &consumers);
                    let output = match relu {
                        Some(r) => {
                            absorbed.insert(r);
                            self.stats.relus_fused += 1;
                            source[r].output[0].clone()
                        }
                        None => node.output[0].clone(),
                    };
                    self.quantize_conv(node, weight, node.input.get(2).and_then(|b| float_weights.get(b)), &output, ranges)?;
                }
                ("MatMul", Some(weight)) if weight.shape().len() == 2 => {
                    self.quantize_matmul(node, weight, ranges)?;
                }
                _ => {
                    for input in node.input.iter().filter(|i| !i.is_empty()) {
                        self.restore_float(input);
                    }
                    self.float_values.extend(node.output.iter().cloned());
                    self.nodes.push(node.clone());
                }
            }
        }
        for output in &graph.output {
            self.restore_float(&output.name);
        }

        graph.node = std::mem::take(&mut self.nodes);
        graph.initializer = std::mem::take(&mut self.initializers);
        let (nodes_removed, initializers_removed) = prune(graph);
        self.stats.nodes_removed = nodes_removed;
        self.stats.initializers_removed = initializers_removed;

        let produced: HashSet<&str> =
            graph.node.iter().flat_map(|n| n.output.iter().map(String::as_str)).collect();
        graph.value_info.retain(|v| produced.contains(v.name.as_str()));

        info!(
            quantized = self.stats.nodes_quantized,
            fused_relu = self.stats.relus_fused,
            quantize_linear = self.stats.quantize_nodes,
            dequantize_linear = self.stats.dequantize_nodes,
            "Rewrote graph to QOperator format"
        );
        Ok(self.stats)
    }

    fn quantize_conv(
        &mut self,
        node: &NodeProto,
        weight: &TensorProto,
        bias: Option<&TensorProto>,
        output: &str,
        ranges: &CalibrationRanges,
    ) -> Result<()> {
        let x = &node.input[0];
        let (x_q, x_params) = self.quantized_input(x, ranges)?;
        let (w_q, w_params) = self.quantize_weight(weight)?;
        let (y_scale, y_zp) = self.output_params(output, ranges)?;

        let mut inputs = vec![
            x_q,
            scale_name(x),
            zero_point_name(x),
            w_q,
            scale_name(&weight.name),
            zero_point_name(&weight.name),
            y_scale,
            y_zp,
        ];
        if let Some(bias) = bias {
            inputs.push(self.quantize_bias_initializer(bias, x_params.scale, w_params.scale)?);
        }

        let y_q = format!("{output}{QUANTIZED_SUFFIX}");
        let mut q = NodeProto::new("QLinearConv", format!("{}{QUANTIZED_SUFFIX}", node.label()), inputs, vec![y_q.clone()]);
        q.attribute = node.attribute.clone();
        self.nodes.push(q);
        self.quantized.insert(output.to_string(), y_q);
        self.stats.nodes_quantized += 1;
        Ok(())
    }

    fn quantize_matmul(&mut self, node: &NodeProto, weight: &TensorProto, ranges: &CalibrationRanges) -> Result<()> {
        let a = &node.input[0];
        let output = &node.output[0];
        let (a_q, _) = self.quantized_input(a, ranges)?;
        let (b_q, _) = self.quantize_weight(weight)?;
        let (y_scale, y_zp) = self.output_params(output, ranges)?;

        let inputs = vec![
            a_q,
            scale_name(a),
            zero_point_name(a),
            b_q,
            scale_name(&weight.name),
            zero_point_name(&weight.name),
            y_scale,
            y_zp,
        ];
        let y_q = format!("{output}{QUANTIZED_SUFFIX}");
        self.nodes.push(NodeProto::new(
            "QLinearMatMul",
            format!("{}{QUANTIZED_SUFFIX}", node.label()),
            inputs,
            vec![y_q.clone()],
        ));
        self.quantized.insert(output.clone(), y_q);
        self.stats.nodes_quantized += 1;
        Ok(())
    }

    /// Quantized name and parameters of an activation, inserting a
    /// `QuantizeLinear` only when the value is currently float.
    fn quantized_input(&mut self, name: &str, ranges: &CalibrationRanges) -> Result<(String, QuantParams)> {
        let range = ranges.require(name)?;
        let params = QuantParams::for_activation(range.min, range.max);
        if let Some(q) = self.quantized.get(name) {
            return Ok((q.clone(), params));
        }
        self.activation_params(name, params);
        let q = format!("{name}{QUANTIZED_SUFFIX}");
        self.nodes.push(NodeProto::new(
            "QuantizeLinear",
            format!("{name}_QuantizeLinear"),
            vec![name.to_string(), scale_name(name), zero_point_name(name)],
            vec![q.clone()],
        ));
        self.stats.quantize_nodes += 1;
        self.quantized.insert(name.to_string(), q.clone());
        Ok((q, params))
    }

    fn output_params(&mut self, name: &str, ranges: &CalibrationRanges) -> Result<(String, String)> {
        let range = ranges.require(name)?;
        self.activation_params(name, QuantParams::for_activation(range.min, range.max));
        Ok((scale_name(name), zero_point_name(name)))
    }

    fn activation_params(&mut self, name: &str, params: QuantParams) {
        self.add_initializer(TensorProto::from_f32(&scale_name(name), &[], &[params.scale]));
        self.add_initializer(TensorProto::from_u8(&zero_point_name(name), &[], &[params.zero_point as u8]));
    }

    fn quantize_weight(&mut self, weight: &TensorProto) -> Result<(String, QuantParams)> {
        let values = weight.to_f32_vec()?;
        let params = QuantParams::for_weight(&values);
        let name = format!("{}{QUANTIZED_SUFFIX}", weight.name);
        self.add_initializer(TensorProto::from_i8(&name, &weight.shape(), &params.quantize_i8(&values)));
        self.add_initializer(TensorProto::from_f32(&scale_name(&weight.name), &[], &[params.scale]));
        self.add_initializer(TensorProto::from_i8(&zero_point_name(&weight.name), &[], &[0]));
        Ok((name, params))
    }

    fn quantize_bias_initializer(&mut self, bias: &TensorProto, x_scale: f32, w_scale: f32) -> Result<String> {
        let values = bias.to_f32_vec()?;
        let name = format!("{}{QUANTIZED_SUFFIX}", bias.name);
        let q = quantize_bias(&values, x_scale, w_scale);
        self.add_initializer(TensorProto::from_i32(&name, &bias.shape(), &q));
        Ok(name)
    }

    /// Make the float value `name` available again after it was produced in
    /// quantized form.
    fn restore_float(&mut self, name: &str) {
        let Some(q) = self.quantized.get(name).cloned() else { return };
        if !self.float_values.insert(name.to_string()) {
            return;
        }
        self.nodes.push(NodeProto::new(
            "DequantizeLinear",
            format!("{name}_DequantizeLinear"),
            vec![q, scale_name(name), zero_point_name(name)],
            vec![name.to_string()],
        ));
        self.stats.dequantize_nodes += 1;
    }

    fn add_initializer(&mut self, tensor: TensorProto) {
        if self.initializer_names.insert(tensor.name.clone()) {
            self.initializers.push(tensor);
        }
    }
}

fn scale_name(value: &str) -> String {
    format!("{value}_scale")
}

fn zero_point_name(value: &str) -> String {
    format!("{value}_zero_point")
}

fn count_consumers<'a>(nodes: &'a [NodeProto], outputs: impl Iterator<Item = &'a str>) -> HashMap<&'a str, usize> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for input in nodes.iter().flat_map(|n| n.input.iter()).filter(|i| !i.is_empty()) {
        *counts.entry(input.as_str()).or_default() += 1;
    }
    for output in outputs {
        *counts.entry(output).or_default() += 1;
    }
    counts
}

/// Index of a `Relu` that is the only consumer of `source[index]`'s output.
fn fusable_relu(source: &[NodeProto], index: usize, consumers: &HashMap<&str, usize>) -> Option<usize> {
    let output = source[index].output.first()?;
    if consumers.get(output.as_str()).copied() != Some(1) {
        return None;
    }
    source
        .iter()
        .enumerate()
        .skip(index + 1)
        .find(|(_, n)| n.input.iter().any(|i| i == output))
        .filter(|(_, n)| n.op_type == "Relu" && n.output.len() == 1)
        .map(|(i, _)| i)
}

/// Drop nodes whose outputs are never consumed and initializers nothing
/// references. Returns `(nodes_removed, initializers_removed)`.
fn prune(graph: &mut GraphProto) -> (usize, usize) {
    let mut live: HashSet<String> = graph.output.iter().map(|o| o.name.clone()).collect();
    let mut keep = vec![false; graph.node.len()];
    for (i, node) in graph.node.iter().enumerate().rev() {
        if node.output.iter().any(|o| live.contains(o)) {
            keep[i] = true;
            live.extend(node.input.iter().filter(|n| !n.is_empty()).cloned());
        }
    }
    let nodes_before = graph.node.len();
    let mut flags = keep.into_iter();
    graph.node.retain(|_| flags.next().unwrap_or(false));

    let (kept, removed): (Vec<TensorProto>, Vec<TensorProto>) =
        std::mem::take(&mut graph.initializer).into_iter().partition(|t| live.contains(&t.name));
    graph.initializer = kept;
    let removed: HashSet<String> = removed.into_iter().map(|t| t.name).collect();
    graph.input.retain(|i| !removed.contains(&i.name));
    (nodes_before - graph.node.len(), removed.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibrate::collect_ranges;
    use crate::calibration::SyntheticCalibrationReader;
    use brandubh_onnx::{
        ArtifactChecker, AttributeProto, Dim, GraphProto, OperatorSetId, Session, SessionOptions, ValueInfoProto,
    };
    use candle_core::{Device, Tensor};

    fn ramp(n: usize, step: f32) -> Vec<f32> {
        (0..n).map(|i| ((i % 7) as f32 - 3.0) * step).collect()
    }

    fn model(nodes: Vec<NodeProto>, initializer: Vec<TensorProto>, input: ValueInfoProto, output: &str) -> ModelProto {
        ModelProto {
            ir_version: 7,
            opset_import: vec![OperatorSetId { domain: String::new(), version: 14 }],
            graph: GraphProto {
                name: "test".into(),
                node: nodes,
                initializer,
                input: vec![input],
                output: vec![ValueInfoProto::tensor(output, DataType::Float.as_i32(), vec![])],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Conv -> Relu -> Add(skip) -> Conv(1x1).
    fn conv_model() -> ModelProto {
        let conv1 = NodeProto::new("Conv", "/c1/Conv", vec!["x".into(), "w1".into(), "b1".into()], vec!["c1".into()])
            .with_attribute(AttributeProto::ints("pads", &[1, 1, 1, 1]))
            .with_attribute(AttributeProto::ints("kernel_shape", &[3, 3]));
        let relu = NodeProto::new("Relu", "/r/Relu", vec!["c1".into()], vec!["r".into()]);
        let add = NodeProto::new("Add", "/a/Add", vec!["r".into(), "x".into()], vec!["s".into()]);
        let conv2 = NodeProto::new("Conv", "/c2/Conv", vec!["s".into(), "w2".into()], vec!["y".into()]);
        model(
            vec![conv1, relu, add, conv2],
            vec![
                TensorProto::from_f32("w1", &[2, 2, 3, 3], &ramp(36, 0.1)),
                TensorProto::from_f32("b1", &[2], &[0.05, -0.1]),
                TensorProto::from_f32("w2", &[2, 2, 1, 1], &[0.5, -0.25, 0.75, 1.0]),
            ],
            ValueInfoProto::tensor(
                "x",
                DataType::Float.as_i32(),
                vec![Dim::Param("batch_size".into()), Dim::Value(2), Dim::Value(3), Dim::Value(3)],
            ),
            "y",
        )
    }

    fn gemm_model() -> ModelProto {
        let gemm = NodeProto::new("Gemm", "/fc/Gemm", vec!["x".into(), "w".into(), "b".into()], vec!["y".into()])
            .with_attribute(AttributeProto::int("transB", 1));
        model(
            vec![gemm],
            vec![
                TensorProto::from_f32("w", &[3, 4], &ramp(12, 0.2)),
                TensorProto::from_f32("b", &[3], &[0.1, 0.2, 0.3]),
            ],
            ValueInfoProto::tensor("x", DataType::Float.as_i32(), vec![Dim::Param("batch_size".into()), Dim::Value(4)]),
            "y",
        )
    }

    fn calibrate(model: &ModelProto, shape: &[usize]) -> CalibrationRanges {
        let session = Session::new(model.clone(), SessionOptions::default()).unwrap();
        let mut reader = SyntheticCalibrationReader::new(16, shape, "x", Some(11)).unwrap();
        collect_ranges(&session, &mut reader).unwrap()
    }

    fn run(model: &ModelProto, x: &Tensor) -> Vec<f32> {
        let session = Session::new(model.clone(), SessionOptions::default()).unwrap();
        let out = session.run(&[("x", x.clone())]).unwrap();
        out["y"].flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    fn ops(model: &ModelProto) -> Vec<&str> {
        model.graph.node.iter().map(|n| n.op_type.as_str()).collect()
    }

    #[test]
    fn gemm_split_preserves_results() {
        let original = gemm_model();
        let mut split = original.clone();
        assert_eq!(split_gemm(&mut split).unwrap(), 1);
        assert_eq!(ops(&split), ["MatMul", "Add"]);
        assert!(split.graph.initializer("w_transposed").is_some());

        let x = Tensor::new(&[[1.0f32, -2.0, 0.5, 3.0]], &Device::Cpu).unwrap();
        let (a, b) = (run(&original, &x), run(&split, &x));
        assert!(a.iter().zip(&b).all(|(a, b)| (a - b).abs() < 1e-5), "{a:?} vs {b:?}");
    }

    #[test]
    fn conv_graph_is_rewritten_with_boundary_nodes_only() {
        let float = conv_model();
        let ranges = calibrate(&float, &[1, 2, 3, 3]);
        let mut quantized = float.clone();
        let stats = StaticQuantizer::new().quantize(&mut quantized, &ranges).unwrap();

        assert_eq!(stats.nodes_quantized, 2);
        assert_eq!(stats.relus_fused, 1);
        assert_eq!(
            ops(&quantized),
            ["QuantizeLinear", "QLinearConv", "DequantizeLinear", "Add", "QuantizeLinear", "QLinearConv", "DequantizeLinear"]
        );
        for gone in ["w1", "b1", "w2"] {
            assert!(quantized.graph.initializer(gone).is_none(), "{gone} should be pruned");
        }
        assert_eq!(quantized.graph.initializer("b1_quantized").unwrap().data_type(), Some(DataType::Int32));
        assert!(ArtifactChecker::default().check_model(&quantized).is_valid());

        let x = Tensor::new(&[0.3f32, -1.2, 0.8, 0.0, 1.5, -0.4, 0.9, -0.7, 0.2], &Device::Cpu)
            .unwrap()
            .repeat(2)
            .unwrap()
            .reshape((1, 2, 3, 3))
            .unwrap();
        let (want, got) = (run(&float, &x), run(&quantized, &x));
        let scale = want.iter().fold(0.0f32, |m, v| m.max(v.abs())).max(1.0);
        for (w, g) in want.iter().zip(&got) {
            assert!((w - g).abs() < 0.1 * scale, "float {w} vs quantized {g}");
        }
    }

    #[test]
    fn matmul_output_is_dequantized_for_bias_add() {
        let mut model = gemm_model();
        split_gemm(&mut model).unwrap();
        let ranges = calibrate(&model, &[1, 4]);
        let stats = StaticQuantizer::new().quantize(&mut model, &ranges).unwrap();
        assert_eq!(stats.nodes_quantized, 1);
        assert_eq!(ops(&model), ["QuantizeLinear", "QLinearMatMul", "DequantizeLinear", "Add"]);
        assert!(model.graph.initializer("w").is_none());
        assert!(model.graph.initializer("w_transposed").is_none());
        assert!(model.graph.initializer("w_transposed_quantized").is_some());
    }

    #[test]
    fn missing_range_is_an_error() {
        let mut model = conv_model();
        let ranges = CalibrationRanges::from_pairs(&[("x", -1.0, 1.0)]);
        let err = StaticQuantizer::new().quantize(&mut model, &ranges).unwrap_err();
        assert!(matches!(err, QuantizationError::MissingRange { ref tensor } if tensor == "r"), "{err}");
    }
}
