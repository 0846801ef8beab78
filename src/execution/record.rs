//! Execution Records
//!
//! One record per step invocation attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::flow::StepType;

/// `error_detail` of a step that exceeded its timeout.
pub const TIMEOUT_DETAIL: &str = "timeout";

/// `error_detail` of a step whose result was discarded by cancellation.
pub const CANCELLED_DETAIL: &str = "cancelled";

/// Outcome of one step invocation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub step_id: String,

    /// Workpiece unit index in pipelined runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<usize>,

    pub step_type: StepType,

    /// 1-based attempt number
    pub attempt: u32,

    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,

    /// Monotonic duration of the invocation
    pub duration_ms: u64,

    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,

    /// Handle to an artifact produced by the engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_reference: Option<String>,
}

impl ExecutionRecord {
    pub fn is_timeout(&self) -> bool {
        self.error_detail.as_deref() == Some(TIMEOUT_DETAIL)
    }

    pub fn is_cancelled(&self) -> bool {
        self.error_detail.as_deref() == Some(CANCELLED_DETAIL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(detail: Option<&str>) -> ExecutionRecord {
        let now = Utc::now();
        ExecutionRecord {
            step_id: "ox".to_string(),
            unit: None,
            step_type: StepType::Oxidation,
            attempt: 1,
            start_time: now,
            end_time: now,
            duration_ms: 0,
            success: detail.is_none(),
            error_detail: detail.map(str::to_string),
            output_reference: None,
        }
    }

    #[test]
    fn test_failure_kinds() {
        assert!(record(Some(TIMEOUT_DETAIL)).is_timeout());
        assert!(record(Some(CANCELLED_DETAIL)).is_cancelled());
        assert!(!record(None).is_timeout());
    }

    #[test]
    fn test_optional_fields_omitted() {
        let json = serde_json::to_string(&record(None)).unwrap();
        assert!(!json.contains("unit"));
        assert!(!json.contains("error_detail"));
        assert!(json.contains("\"step_type\":\"oxidation\""));
    }
}
