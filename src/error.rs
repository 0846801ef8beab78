//! Orchestrator Errors
//!
//! Build-time, checkpoint and I/O errors surfaced to callers. Step-level
//! failures are not errors: they are recorded as [`ExecutionRecord`]s and
//! reflected in step statuses.
//!
//! [`ExecutionRecord`]: crate::execution::ExecutionRecord

use std::path::PathBuf;

use thiserror::Error;

use crate::flow::StepType;

/// Errors raised while building, running or checkpointing a flow.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("no engine registered for step type '{0}'")]
    UnknownStepType(StepType),

    #[error("cyclic dependency between steps: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnresolvedDependency { step: String, dependency: String },

    #[error("duplicate step id '{0}'")]
    DuplicateStepId(String),

    #[error("step has an empty or whitespace-only id")]
    EmptyStepId,

    #[error("no dispatchable steps while {} remain pending: {}", .pending.len(), .pending.join(", "))]
    DeadlockDetected { pending: Vec<String> },

    #[error("checkpoint '{}' is corrupt: {reason}", .path.display())]
    CorruptCheckpoint { path: PathBuf, reason: String },

    #[error("checkpoint not found: {}", .0.display())]
    CheckpointNotFound(PathBuf),

    #[error("workpiece error: {0}")]
    Workpiece(String),

    #[error("a flow is already running on this orchestrator")]
    AlreadyRunning,

    #[error("no flow has been submitted, nothing to checkpoint")]
    NothingToCheckpoint,

    #[error("invalid flow file: {0}")]
    FlowFile(String),

    #[error("resource monitor: {0}")]
    Monitor(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
