//! Process Step Data Model
//!
//! Core data structures describing one unit of fabrication-process work.
//!
//! # Example YAML Format
//!
//! ```yaml
//! steps:
//!   - id: gate_oxide
//!     type: oxidation
//!     name: Gate oxide growth
//!     parameters:
//!       temperature: 1000
//!       time: 30
//!       ambient: dry
//!     workpiece: wafer
//!
//!   - id: vt_adjust
//!     type: doping
//!     parameters:
//!       species: boron
//!       dose: 1.0e13
//!     depends_on:
//!       - gate_oxide
//!     workpiece: wafer
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Kind of fabrication process a step performs.
///
/// The orchestrator only uses the tag to look up an engine and to group
/// timing statistics.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Oxidation,
    Doping,
    Lithography,
    Deposition,
    Etching,
    Metallization,
    Annealing,
    Cmp,
    Inspection,
    Custom,
}

impl StepType {
    /// Every step type, in declaration order.
    pub const ALL: [StepType; 10] = [
        StepType::Oxidation,
        StepType::Doping,
        StepType::Lithography,
        StepType::Deposition,
        StepType::Etching,
        StepType::Metallization,
        StepType::Annealing,
        StepType::Cmp,
        StepType::Inspection,
        StepType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Oxidation => "oxidation",
            StepType::Doping => "doping",
            StepType::Lithography => "lithography",
            StepType::Deposition => "deposition",
            StepType::Etching => "etching",
            StepType::Metallization => "metallization",
            StepType::Annealing => "annealing",
            StepType::Cmp => "cmp",
            StepType::Inspection => "inspection",
            StepType::Custom => "custom",
        }
    }

    /// Workpiece access assumed when a step does not declare one.
    ///
    /// Inspection (metrology) only reads the workpiece; every other
    /// process modifies it.
    pub fn default_access(&self) -> WorkpieceAccess {
        match self {
            StepType::Inspection => WorkpieceAccess::Read,
            _ => WorkpieceAccess::Write,
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        StepType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| format!("unknown step type '{}'", s))
    }
}

/// Lifecycle state of a step within a run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StepStatus {
    /// Waiting for dependencies
    #[default]
    Pending,
    /// Dependencies satisfied, waiting for a worker
    Ready,
    /// Currently executing
    Running,
    /// Finished successfully
    Completed,
    /// Engine reported failure or the step timed out
    Failed,
    /// Not run because an upstream step failed
    Skipped,
    /// Not run (or result discarded) because the flow was cancelled
    Cancelled,
}

impl StepStatus {
    /// Returns true once the step can no longer change state within a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped | StepStatus::Cancelled
        )
    }

    /// Pending or Ready: not yet handed to an engine.
    pub fn is_waiting(&self) -> bool {
        matches!(self, StepStatus::Pending | StepStatus::Ready)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Concurrency discipline used to execute a flow.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
    Pipeline,
    Batch,
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(ExecutionMode::Sequential),
            "parallel" => Ok(ExecutionMode::Parallel),
            "pipeline" => Ok(ExecutionMode::Pipeline),
            "batch" => Ok(ExecutionMode::Batch),
            other => Err(format!("unknown execution mode '{}'", other)),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ExecutionMode::Sequential => "sequential",
            ExecutionMode::Parallel => "parallel",
            ExecutionMode::Pipeline => "pipeline",
            ExecutionMode::Batch => "batch",
        };
        f.write_str(text)
    }
}

/// How a step touches its workpiece.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkpieceAccess {
    Read,
    Write,
    /// Never touches the workpiece state; takes no conflict edges
    Independent,
}

/// A single process parameter value.
///
/// Parameter sets are open-ended; engines validate what they need.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ParameterValue {
    Flag(bool),
    Number(f64),
    Text(String),
}

impl ParameterValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParameterValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Flag(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Number(value)
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        ParameterValue::Number(value as f64)
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Flag(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::Text(value.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        ParameterValue::Text(value)
    }
}

/// Parameter name to value mapping handed to engines.
pub type Parameters = BTreeMap<String, ParameterValue>;

/// Definition of one process step.
///
/// Steps are created by the caller and handed to a [`Flow`](super::Flow),
/// which owns them from then on. Only the execution engine changes
/// `status`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProcessStep {
    /// Unique identifier within a flow
    pub id: String,

    /// Process kind, used to resolve the engine
    #[serde(rename = "type")]
    pub step_type: StepType,

    /// Human-readable label (defaults to the id)
    #[serde(default)]
    pub name: String,

    /// Engine parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: Parameters,

    /// IDs of steps that must complete before this one starts
    #[serde(default, rename = "depends_on", skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,

    /// Current lifecycle state
    #[serde(default)]
    pub status: StepStatus,

    /// Workpiece this step operates on, used for conflict ordering.
    /// Steps without one share the run's workpiece.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workpiece: Option<String>,

    /// Declared access; falls back to the step type's default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<WorkpieceAccess>,

    /// Per-step timeout override in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Per-step timeout override in milliseconds; wins over `timeout_secs`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ProcessStep {
    /// Creates a new pending step.
    ///
    /// # Example
    ///
    /// ```
    /// use fabrunner::flow::{ProcessStep, StepType};
    ///
    /// let step = ProcessStep::new("gate_oxide", StepType::Oxidation)
    ///     .with_name("Gate oxide")
    ///     .with_parameter("temperature", 1000.0)
    ///     .on_workpiece("wafer");
    /// ```
    pub fn new(id: impl Into<String>, step_type: StepType) -> Self {
        let id = id.into().trim().to_string();
        Self {
            name: id.clone(),
            id,
            step_type,
            parameters: Parameters::new(),
            dependencies: Vec::new(),
            status: StepStatus::Pending,
            workpiece: None,
            access: None,
            timeout_secs: None,
            timeout_ms: None,
        }
    }

    /// Sets the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Adds or replaces a parameter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Replaces the whole parameter map.
    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Adds a dependency on another step.
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.dependencies.push(step_id.into());
        self
    }

    /// Declares the workpiece this step operates on.
    pub fn on_workpiece(mut self, workpiece: impl Into<String>) -> Self {
        self.workpiece = Some(workpiece.into());
        self
    }

    /// Overrides the workpiece access mode.
    pub fn with_access(mut self, access: WorkpieceAccess) -> Self {
        self.access = Some(access);
        self
    }

    /// Overrides the step timeout, at millisecond precision (at least 1 ms).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.timeout_ms = Some(millis.max(1));
        self.timeout_secs = None;
        self
    }

    /// Effective workpiece access.
    pub fn effective_access(&self) -> WorkpieceAccess {
        self.access.unwrap_or_else(|| self.step_type.default_access())
    }

    /// Per-step timeout, if one was declared.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms
            .map(Duration::from_millis)
            .or_else(|| self.timeout_secs.map(Duration::from_secs))
    }
}
