//! Structural well-formedness checks for ONNX artifacts.
//!
//! [`ArtifactChecker`] runs a configurable set of [`ArtifactCheck`]s against a
//! decoded [`ModelProto`]. Each check yields a [`CheckResult`]; results are
//! aggregated into a [`CheckReport`]. [`ArtifactSummary`] is the diagnostic
//! view (interface names, shapes, opset) printed after a successful check.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::OnnxError;
use crate::io::load_model;
use crate::proto::{Dim, ModelProto, ValueInfoProto};
use crate::runtime::SUPPORTED_OPERATORS;
use crate::tensor::DataType;

/// Highest IR version this crate understands.
pub const MAX_IR_VERSION: i64 = 10;
/// Opset range accepted for the default domain.
pub const MIN_OPSET: i64 = 7;
pub const MAX_OPSET: i64 = 21;

/// Minimum IR version able to carry the given default-domain opset.
pub fn ir_version_for_opset(opset: i64) -> i64 {
    match opset {
        ..=8 => 3,
        9 => 4,
        10 => 5,
        11 => 6,
        12..=14 => 7,
        15..=18 => 8,
        19..=20 => 9,
        _ => 10,
    }
}

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    Info,
    /// The artifact is usable but a consumer may object.
    Warning,
    /// The artifact is malformed.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Error => write!(f, "ERROR"),
        }
    }
}

// ---------------------------------------------------------------------------
// ArtifactCheck
// ---------------------------------------------------------------------------

/// The individual structural checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArtifactCheck {
    /// IR version is set and not newer than [`MAX_IR_VERSION`].
    IrVersion,
    /// Default-domain opset is imported once, within range and IR-compatible.
    OpsetImport,
    /// Graph inputs and outputs are named and typed.
    GraphInterface,
    /// Initializer names are unique and payload sizes match dims.
    Initializers,
    /// No tensor references external data.
    EmbeddedData,
    /// Every node input is defined before use and outputs are assigned once.
    NodeTopology,
    /// Every graph output is produced.
    GraphOutputs,
    /// Operators are known to the reference runtime.
    OperatorSupport,
}

impl ArtifactCheck {
    pub const ALL: [ArtifactCheck; 8] = [
        ArtifactCheck::IrVersion,
        ArtifactCheck::OpsetImport,
        ArtifactCheck::GraphInterface,
        ArtifactCheck::Initializers,
        ArtifactCheck::EmbeddedData,
        ArtifactCheck::NodeTopology,
        ArtifactCheck::GraphOutputs,
        ArtifactCheck::OperatorSupport,
    ];
}

impl fmt::Display for ArtifactCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactCheck::IrVersion => write!(f, "ir_version"),
            ArtifactCheck::OpsetImport => write!(f, "opset_import"),
            ArtifactCheck::GraphInterface => write!(f, "graph_interface"),
            ArtifactCheck::Initializers => write!(f, "initializers"),
            ArtifactCheck::EmbeddedData => write!(f, "embedded_data"),
            ArtifactCheck::NodeTopology => write!(f, "node_topology"),
            ArtifactCheck::GraphOutputs => write!(f, "graph_outputs"),
            ArtifactCheck::OperatorSupport => write!(f, "operator_support"),
        }
    }
}

// ---------------------------------------------------------------------------
// CheckResult
// ---------------------------------------------------------------------------

/// Outcome of a single check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub check: ArtifactCheck,
    pub passed: bool,
    pub severity: Severity,
    pub message: String,
    pub details: HashMap<String, String>,
}

impl CheckResult {
    fn pass(check: ArtifactCheck, message: impl Into<String>) -> Self {
        Self {
            check,
            passed: true,
            severity: Severity::Info,
            message: message.into(),
            details: HashMap::new(),
        }
    }

    fn warning(check: ArtifactCheck, message: impl Into<String>, issues: Vec<String>) -> Self {
        Self {
            check,
            passed: true,
            severity: Severity::Warning,
            message: message.into(),
            details: details_from(issues),
        }
    }

    fn error(check: ArtifactCheck, message: impl Into<String>, issues: Vec<String>) -> Self {
        Self {
            check,
            passed: false,
            severity: Severity::Error,
            message: message.into(),
            details: details_from(issues),
        }
    }
}

fn details_from(issues: Vec<String>) -> HashMap<String, String> {
    let mut details = HashMap::new();
    if !issues.is_empty() {
        details.insert("issues".into(), issues.join("; "));
    }
    details
}

// ---------------------------------------------------------------------------
// CheckReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverallStatus {
    Passed,
    PassedWithWarnings,
    Failed,
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverallStatus::Passed => write!(f, "PASSED"),
            OverallStatus::PassedWithWarnings => write!(f, "PASSED_WITH_WARNINGS"),
            OverallStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Aggregated result of a checker run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckReport {
    pub results: Vec<CheckResult>,
    pub passed_count: usize,
    pub failed_count: usize,
    pub warnings_count: usize,
    pub overall_status: OverallStatus,
}

impl CheckReport {
    fn from_results(results: Vec<CheckResult>) -> Self {
        let passed_count = results.iter().filter(|r| r.passed).count();
        let failed_count = results.iter().filter(|r| !r.passed).count();
        let warnings_count = results.iter().filter(|r| r.severity == Severity::Warning).count();

        let overall_status = if failed_count > 0 {
            OverallStatus::Failed
        } else if warnings_count > 0 {
            OverallStatus::PassedWithWarnings
        } else {
            OverallStatus::Passed
        };

        Self { results, passed_count, failed_count, warnings_count, overall_status }
    }

    pub fn is_valid(&self) -> bool {
        self.overall_status != OverallStatus::Failed
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.results.iter().filter(|r| !r.passed)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &CheckResult> {
        self.results.iter().filter(|r| r.severity == Severity::Warning)
    }

    /// Convert a failed report into a [`ValidationError`].
    pub fn into_result(self) -> Result<Self, ValidationError> {
        if self.is_valid() {
            return Ok(self);
        }
        let failures = self
            .failures()
            .map(|r| match r.details.get("issues") {
                Some(issues) => format!("{}: {} ({issues})", r.check, r.message),
                None => format!("{}: {}", r.check, r.message),
            })
            .collect();
        Err(ValidationError::Rejected { failures })
    }
}

/// The artifact could not be loaded or failed a structural check.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("could not load artifact: {0}")]
    Load(#[from] OnnxError),
    #[error("artifact failed structural checks: {}", failures.join(" | "))]
    Rejected { failures: Vec<String> },
}

// ---------------------------------------------------------------------------
// CheckerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckerConfig {
    /// Promote warnings to errors.
    pub strict_mode: bool,
    pub skip_checks: HashSet<ArtifactCheck>,
    /// Treat external-data references as errors instead of warnings.
    pub require_embedded_data: bool,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self { strict_mode: false, skip_checks: HashSet::new(), require_embedded_data: true }
    }
}

// ---------------------------------------------------------------------------
// ArtifactChecker
// ---------------------------------------------------------------------------

pub struct ArtifactChecker {
    config: CheckerConfig,
}

impl Default for ArtifactChecker {
    fn default() -> Self {
        Self::new(CheckerConfig::default())
    }
}

impl ArtifactChecker {
    pub fn new(config: CheckerConfig) -> Self {
        Self { config }
    }

    /// Load the artifact at `path` and check it.
    pub fn check_path(&self, path: impl AsRef<Path>) -> Result<CheckReport, ValidationError> {
        let model = load_model(path)?;
        Ok(self.check_model(&model))
    }

    pub fn check_model(&self, model: &ModelProto) -> CheckReport {
        let mut results = Vec::new();
        for check in ArtifactCheck::ALL {
            if self.config.skip_checks.contains(&check) {
                continue;
            }
            let mut result = self.run_check(check, model);
            if self.config.strict_mode && result.severity == Severity::Warning {
                result.severity = Severity::Error;
                result.passed = false;
            }
            results.push(result);
        }
        CheckReport::from_results(results)
    }

    fn run_check(&self, check: ArtifactCheck, model: &ModelProto) -> CheckResult {
        match check {
            ArtifactCheck::IrVersion => self.check_ir_version(model),
            ArtifactCheck::OpsetImport => self.check_opset_import(model),
            ArtifactCheck::GraphInterface => self.check_graph_interface(model),
            ArtifactCheck::Initializers => self.check_initializers(model),
            ArtifactCheck::EmbeddedData => self.check_embedded_data(model),
            ArtifactCheck::NodeTopology => self.check_node_topology(model),
            ArtifactCheck::GraphOutputs => self.check_graph_outputs(model),
            ArtifactCheck::OperatorSupport => self.check_operator_support(model),
        }
    }

    // -- check implementations --------------------------------------------

    pub fn check_ir_version(&self, model: &ModelProto) -> CheckResult {
        let check = ArtifactCheck::IrVersion;
        match model.ir_version {
            v if v < 3 => CheckResult::error(check, format!("IR version {v} is unset or too old"), vec![]),
            v if v > MAX_IR_VERSION => CheckResult::error(
                check,
                format!("IR version {v} is newer than supported {MAX_IR_VERSION}"),
                vec![],
            ),
            v => CheckResult::pass(check, format!("IR version {v}")),
        }
    }

    pub fn check_opset_import(&self, model: &ModelProto) -> CheckResult {
        let check = ArtifactCheck::OpsetImport;
        let default_imports =
            model.opset_import.iter().filter(|o| o.domain.is_empty() || o.domain == "ai.onnx").count();
        if default_imports != 1 {
            return CheckResult::error(
                check,
                format!("expected one default-domain opset import, found {default_imports}"),
                vec![],
            );
        }
        let Some(opset) = model.opset_version() else {
            return CheckResult::error(check, "missing default-domain opset", vec![]);
        };
        if !(MIN_OPSET..=MAX_OPSET).contains(&opset) {
            return CheckResult::error(
                check,
                format!("opset {opset} outside supported range {MIN_OPSET}..={MAX_OPSET}"),
                vec![],
            );
        }
        let required_ir = ir_version_for_opset(opset);
        if model.ir_version < required_ir {
            return CheckResult::warning(
                check,
                format!("opset {opset} expects IR version >= {required_ir}"),
                vec![format!("ir_version={}", model.ir_version)],
            );
        }
        CheckResult::pass(check, format!("opset {opset}"))
    }

    pub fn check_graph_interface(&self, model: &ModelProto) -> CheckResult {
        let check = ArtifactCheck::GraphInterface;
        let graph = &model.graph;
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        if graph.input.is_empty() {
            errors.push("graph declares no inputs".to_string());
        }
        if graph.output.is_empty() {
            errors.push("graph declares no outputs".to_string());
        }
        for (role, values) in [("input", &graph.input), ("output", &graph.output)] {
            for value in values {
                inspect_value_info(role, value, &mut errors, &mut warnings);
            }
        }
        if !errors.is_empty() {
            errors.extend(warnings);
            return CheckResult::error(check, "malformed graph interface", errors);
        }
        if !warnings.is_empty() {
            return CheckResult::warning(check, "graph interface is under-specified", warnings);
        }
        CheckResult::pass(
            check,
            format!("{} input(s), {} output(s)", graph.input.len(), graph.output.len()),
        )
    }

    pub fn check_initializers(&self, model: &ModelProto) -> CheckResult {
        let check = ArtifactCheck::Initializers;
        let mut seen = HashSet::new();
        let mut issues = Vec::new();
        for t in &model.graph.initializer {
            if t.name.is_empty() {
                issues.push("initializer without a name".to_string());
                continue;
            }
            if !seen.insert(t.name.as_str()) {
                issues.push(format!("duplicate initializer `{}`", t.name));
            }
            if t.dims.iter().any(|&d| d < 0) {
                issues.push(format!("`{}` has negative dims {:?}", t.name, t.dims));
                continue;
            }
            let Some(data_type) = t.data_type() else {
                issues.push(format!("`{}` has unknown data type {}", t.name, t.data_type));
                continue;
            };
            if t.is_external() {
                continue;
            }
            if let Some(elem) = data_type.element_size() {
                let expected = t.numel() * elem;
                let actual = t.embedded_bytes();
                if expected != actual {
                    issues.push(format!(
                        "`{}`: {expected} bytes expected for {data_type}{:?}, found {actual}",
                        t.name, t.dims
                    ));
                }
            }
        }
        if issues.is_empty() {
            CheckResult::pass(check, format!("{} initializer(s) consistent", seen.len()))
        } else {
            CheckResult::error(check, format!("{} initializer issue(s)", issues.len()), issues)
        }
    }

    pub fn check_embedded_data(&self, model: &ModelProto) -> CheckResult {
        let check = ArtifactCheck::EmbeddedData;
        let external: Vec<String> = model
            .graph
            .initializer
            .iter()
            .filter(|t| t.is_external())
            .map(|t| t.name.clone())
            .collect();
        if external.is_empty() {
            return CheckResult::pass(check, "all tensor data embedded");
        }
        let message = format!("{} tensor(s) reference external data", external.len());
        if self.config.require_embedded_data {
            CheckResult::error(check, message, external)
        } else {
            CheckResult::warning(check, message, external)
        }
    }

    pub fn check_node_topology(&self, model: &ModelProto) -> CheckResult {
        let check = ArtifactCheck::NodeTopology;
        let graph = &model.graph;
        let mut defined: HashSet<&str> = graph.input.iter().map(|v| v.name.as_str()).collect();
        defined.extend(graph.initializer.iter().map(|t| t.name.as_str()));
        let mut issues = Vec::new();
        for node in &graph.node {
            if node.op_type.is_empty() {
                issues.push(format!("node `{}` has no op_type", node.label()));
            }
            for input in node.input.iter().filter(|i| !i.is_empty()) {
                if !defined.contains(input.as_str()) {
                    issues.push(format!("`{}` consumes undefined `{input}`", node.label()));
                }
            }
            for output in node.output.iter().filter(|o| !o.is_empty()) {
                if !defined.insert(output.as_str()) {
                    issues.push(format!("`{}` reassigns `{output}`", node.label()));
                }
            }
        }
        if issues.is_empty() {
            CheckResult::pass(check, format!("{} node(s) topologically sorted", graph.node.len()))
        } else {
            CheckResult::error(check, format!("{} topology issue(s)", issues.len()), issues)
        }
    }

    pub fn check_graph_outputs(&self, model: &ModelProto) -> CheckResult {
        let check = ArtifactCheck::GraphOutputs;
        let graph = &model.graph;
        let mut produced: HashSet<&str> = graph.input.iter().map(|v| v.name.as_str()).collect();
        produced.extend(graph.initializer.iter().map(|t| t.name.as_str()));
        produced.extend(graph.node.iter().flat_map(|n| n.output.iter().map(String::as_str)));
        let missing: Vec<String> = graph
            .output
            .iter()
            .filter(|o| !produced.contains(o.name.as_str()))
            .map(|o| o.name.clone())
            .collect();
        if missing.is_empty() {
            CheckResult::pass(check, "all graph outputs produced")
        } else {
            CheckResult::error(check, "graph outputs never produced", missing)
        }
    }

    pub fn check_operator_support(&self, model: &ModelProto) -> CheckResult {
        let check = ArtifactCheck::OperatorSupport;
        let mut unknown: Vec<String> = model
            .graph
            .node
            .iter()
            .filter(|n| !(n.domain.is_empty() || n.domain == "ai.onnx"))
            .map(|n| format!("{}::{}", n.domain, n.op_type))
            .chain(
                model
                    .graph
                    .node
                    .iter()
                    .filter(|n| n.domain.is_empty() || n.domain == "ai.onnx")
                    .filter(|n| !SUPPORTED_OPERATORS.contains(&n.op_type.as_str()))
                    .map(|n| n.op_type.clone()),
            )
            .collect();
        unknown.sort();
        unknown.dedup();
        if unknown.is_empty() {
            CheckResult::pass(check, "all operators supported by the reference runtime")
        } else {
            CheckResult::warning(check, "operators unknown to the reference runtime", unknown)
        }
    }
}

fn inspect_value_info(
    role: &str,
    value: &ValueInfoProto,
    errors: &mut Vec<String>,
    warnings: &mut Vec<String>,
) {
    if value.name.is_empty() {
        errors.push(format!("unnamed graph {role}"));
        return;
    }
    let Some(tensor_type) = &value.tensor_type else {
        errors.push(format!("{role} `{}` is not a tensor", value.name));
        return;
    };
    if DataType::from_i32(tensor_type.elem_type).is_none() {
        errors.push(format!(
            "{role} `{}` has unknown element type {}",
            value.name, tensor_type.elem_type
        ));
    }
    if tensor_type.shape.is_none() {
        warnings.push(format!("{role} `{}` has no declared shape", value.name));
    }
}

// ---------------------------------------------------------------------------
// ArtifactSummary
// ---------------------------------------------------------------------------

/// Name, element type and shape of a graph input or output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSignature {
    pub name: String,
    pub elem_type: String,
    /// One entry per dim; symbolic and unknown dims are `dynamic`.
    pub shape: Vec<String>,
}

impl TensorSignature {
    fn from_value_info(value: &ValueInfoProto) -> Self {
        let elem_type = value
            .tensor_type
            .as_ref()
            .and_then(|t| DataType::from_i32(t.elem_type))
            .map_or_else(|| "unknown".to_string(), |t| t.to_string());
        let shape = value
            .dims()
            .unwrap_or_default()
            .iter()
            .map(|d| match d {
                Dim::Value(v) if *v > 0 => v.to_string(),
                _ => "dynamic".to_string(),
            })
            .collect();
        Self { name: value.name.clone(), elem_type, shape }
    }
}

impl fmt::Display for TensorSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}[{}]", self.name, self.elem_type, self.shape.join(", "))
    }
}

/// Diagnostic view of a checked artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub ir_version: i64,
    pub opset: Option<i64>,
    pub producer: String,
    pub inputs: Vec<TensorSignature>,
    pub outputs: Vec<TensorSignature>,
    pub node_count: usize,
    pub initializer_count: usize,
    pub initializer_bytes: u64,
}

impl ArtifactSummary {
    pub fn from_model(model: &ModelProto) -> Self {
        let graph = &model.graph;
        let producer = if model.producer_version.is_empty() {
            model.producer_name.clone()
        } else {
            format!("{} {}", model.producer_name, model.producer_version)
        };
        Self {
            ir_version: model.ir_version,
            opset: model.opset_version(),
            producer,
            inputs: graph.input.iter().map(TensorSignature::from_value_info).collect(),
            outputs: graph.output.iter().map(TensorSignature::from_value_info).collect(),
            node_count: graph.node.len(),
            initializer_count: graph.initializer.len(),
            initializer_bytes: graph.initializer.iter().map(|t| t.embedded_bytes() as u64).sum(),
        }
    }
}

impl fmt::Display for ArtifactSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Inputs:")?;
        for input in &self.inputs {
            writeln!(f, "  {input}")?;
        }
        writeln!(f, "Outputs:")?;
        for output in &self.outputs {
            writeln!(f, "  {output}")?;
        }
        match self.opset {
            Some(opset) => write!(f, "Opset: {opset} (IR {})", self.ir_version),
            None => write!(f, "Opset: none (IR {})", self.ir_version),
        }
    }
}
