//! Checkpoint Document
//!
//! The persisted form of a flow: definitions, statuses and last records,
//! plus the workpiece collaborator's opaque snapshot as base64 text.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};
use crate::execution::ExecutionRecord;
use crate::flow::{ExecutionMode, Flow, ProcessStep, StepStatus};
use crate::workpiece::Workpiece;

/// Version written by this build; anything else is rejected on load.
pub const FORMAT_VERSION: u32 = 1;

/// A flow's definitions and progress.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FlowState {
    pub name: String,
    pub execution_mode: ExecutionMode,
    /// Declared definitions, each with its status
    pub steps: Vec<ProcessStep>,
    /// Last execution record per step id
    #[serde(default)]
    pub last_records: BTreeMap<String, ExecutionRecord>,
}

impl FlowState {
    pub fn capture(flow: &Flow) -> Self {
        Self {
            name: flow.name().to_string(),
            execution_mode: flow.execution_mode(),
            steps: flow.steps().to_vec(),
            last_records: flow
                .last_records()
                .iter()
                .map(|(id, record)| (id.clone(), record.clone()))
                .collect(),
        }
    }

    /// Replaces statuses and records with live values keyed by step id.
    /// Steps missing from `statuses` keep their current status.
    pub fn overlay(
        &mut self,
        statuses: &HashMap<String, StepStatus>,
        records: HashMap<String, ExecutionRecord>,
    ) {
        for step in &mut self.steps {
            if let Some(status) = statuses.get(&step.id) {
                step.status = *status;
            }
        }
        self.last_records.extend(records);
    }
}

/// Durable snapshot of a flow and its workpiece.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub format_version: u32,
    pub timestamp: DateTime<Utc>,
    pub flow_state: FlowState,
    /// Opaque bytes from the workpiece collaborator
    #[serde(with = "base64_blob")]
    pub workpiece_snapshot: Vec<u8>,
}

impl Checkpoint {
    pub fn new(flow_state: FlowState, workpiece_snapshot: Vec<u8>) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            timestamp: Utc::now(),
            flow_state,
            workpiece_snapshot,
        }
    }

    /// Snapshots `flow` and asks the workpiece for its blob.
    pub fn capture(flow: &Flow, workpiece: &dyn Workpiece) -> Result<Self> {
        let blob = workpiece
            .snapshot()
            .map_err(|e| OrchestratorError::Workpiece(format!("snapshot of '{}' failed: {}", workpiece.label(), e)))?;
        Ok(Self::new(FlowState::capture(flow), blob))
    }

    /// Step id to status as recorded.
    pub fn statuses(&self) -> HashMap<String, StepStatus> {
        self.flow_state
            .steps
            .iter()
            .map(|s| (s.id.clone(), s.status))
            .collect()
    }

    /// True when every recorded step is Completed.
    pub fn is_complete(&self) -> bool {
        self.flow_state
            .steps
            .iter()
            .all(|s| s.status == StepStatus::Completed)
    }
}

/// Serde adapter storing bytes as standard base64 text.
mod base64_blob {
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
