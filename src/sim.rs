//! Simulated Process Engines
//!
//! Stand-ins for the physical models: a [`Wafer`] workpiece that records
//! which steps were applied to it, and a [`SimulatedEngine`] that takes
//! `duration_ms` to run and can be told to fail. Used by the binary and
//! by tests.
//!
//! Recognised parameters:
//! - `duration_ms`: simulated run time (default 0)
//! - `fail`: always report failure
//! - `fail_attempts`: fail the first N attempts, then succeed

use std::any::Any;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::execution::{ProcessEngine, StepContext, StepOutcome, StepRegistry};
use crate::flow::{ParameterValue, StepType};
use crate::workpiece::{Workpiece, WorkpieceHandle, WorkpieceRestore};

/// How often a simulated step checks its interrupt.
const INTERRUPT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// One step applied to a wafer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AppliedStep {
    pub step_id: String,
    pub step_type: StepType,
    pub attempt: u32,
}

#[derive(Serialize, Deserialize)]
struct WaferState {
    label: String,
    history: Vec<AppliedStep>,
}

/// A wafer whose state is the ordered list of processing steps it has seen.
#[derive(Debug)]
pub struct Wafer {
    label: String,
    history: Mutex<Vec<AppliedStep>>,
}

impl Wafer {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            history: Mutex::new(Vec::new()),
        }
    }

    /// A fresh wafer behind a workpiece handle.
    pub fn handle(label: impl Into<String>) -> WorkpieceHandle {
        Arc::new(Self::new(label))
    }

    /// Rebuilds a wafer from [`Workpiece::snapshot`] output.
    pub fn from_snapshot(blob: &[u8]) -> Result<Self, String> {
        let state: WaferState =
            serde_json::from_slice(blob).map_err(|e| format!("invalid wafer snapshot: {}", e))?;
        Ok(Self {
            label: state.label,
            history: Mutex::new(state.history),
        })
    }

    pub fn apply(&self, step: AppliedStep) {
        self.history.lock().push(step);
    }

    pub fn history(&self) -> Vec<AppliedStep> {
        self.history.lock().clone()
    }

    /// Step ids in the order they were applied.
    pub fn applied_ids(&self) -> Vec<String> {
        self.history.lock().iter().map(|s| s.step_id.clone()).collect()
    }
}

impl Workpiece for Wafer {
    fn label(&self) -> &str {
        &self.label
    }

    fn snapshot(&self) -> Result<Vec<u8>, String> {
        let state = WaferState {
            label: self.label.clone(),
            history: self.history(),
        };
        serde_json::to_vec(&state).map_err(|e| e.to_string())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Restores [`Wafer`] snapshots.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaferRestore;

impl WorkpieceRestore for WaferRestore {
    fn restore(&self, blob: &[u8]) -> Result<WorkpieceHandle, String> {
        Ok(Arc::new(Wafer::from_snapshot(blob)?))
    }
}

/// Engine that sleeps for `duration_ms` and applies the step to a wafer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedEngine;

impl ProcessEngine for SimulatedEngine {
    fn execute(&self, ctx: &StepContext<'_>) -> StepOutcome {
        let duration = ctx
            .parameters
            .get("duration_ms")
            .and_then(ParameterValue::as_f64)
            .unwrap_or(0.0)
            .max(0.0);
        let deadline = Instant::now() + Duration::from_millis(duration as u64);

        while Instant::now() < deadline {
            if ctx.is_interrupted() {
                debug!("Simulated step '{}' interrupted", ctx.step_id);
                return StepOutcome::failure("interrupted");
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            thread::sleep(remaining.min(INTERRUPT_CHECK_INTERVAL));
        }

        let always_fail = ctx
            .parameters
            .get("fail")
            .and_then(ParameterValue::as_bool)
            .unwrap_or(false);
        let failing_attempts = ctx
            .parameters
            .get("fail_attempts")
            .and_then(ParameterValue::as_f64)
            .unwrap_or(0.0);
        if always_fail || f64::from(ctx.attempt) <= failing_attempts {
            return StepOutcome::failure(format!(
                "simulated {} failure on attempt {}",
                ctx.step_type, ctx.attempt
            ));
        }

        if let Some(wafer) = ctx.workpiece.as_any().downcast_ref::<Wafer>() {
            wafer.apply(AppliedStep {
                step_id: ctx.step_id.to_string(),
                step_type: ctx.step_type,
                attempt: ctx.attempt,
            });
        }
        StepOutcome::with_output(format!("{}/{}", ctx.workpiece.label(), ctx.step_id))
    }
}

/// A registry with [`SimulatedEngine`] bound to every step type.
pub fn registry() -> StepRegistry {
    let engine: Arc<dyn ProcessEngine> = Arc::new(SimulatedEngine);
    let mut registry = StepRegistry::new();
    for step_type in StepType::ALL {
        registry.register_shared(step_type, Arc::clone(&engine));
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::Interrupt;
    use crate::flow::Parameters;

    fn run(engine: &SimulatedEngine, wafer: &Wafer, parameters: &Parameters, attempt: u32) -> StepOutcome {
        let interrupt = Interrupt::detached();
        let mut ctx = StepContext::new("gate_ox", StepType::Oxidation, parameters, wafer, &interrupt);
        ctx.attempt = attempt;
        engine.execute(&ctx)
    }

    #[test]
    fn test_successful_step_is_applied() {
        let wafer = Wafer::new("W01");
        let outcome = run(&SimulatedEngine, &wafer, &Parameters::new(), 1);

        assert!(outcome.success);
        assert_eq!(outcome.output_reference.as_deref(), Some("W01/gate_ox"));
        assert_eq!(wafer.applied_ids(), vec!["gate_ox"]);
    }

    #[test]
    fn test_forced_failure_leaves_wafer_untouched() {
        let wafer = Wafer::new("W02");
        let mut parameters = Parameters::new();
        parameters.insert("fail".to_string(), true.into());

        let outcome = run(&SimulatedEngine, &wafer, &parameters, 1);
        assert!(!outcome.success);
        assert!(outcome.error_detail.unwrap().contains("oxidation"));
        assert!(wafer.history().is_empty());
    }

    #[test]
    fn test_fail_attempts() {
        let wafer = Wafer::new("W03");
        let mut parameters = Parameters::new();
        parameters.insert("fail_attempts".to_string(), 1.0.into());

        assert!(!run(&SimulatedEngine, &wafer, &parameters, 1).success);
        assert!(run(&SimulatedEngine, &wafer, &parameters, 2).success);
        assert_eq!(wafer.history()[0].attempt, 2);
    }

    #[test]
    fn test_duration_and_interrupt() {
        let wafer = Wafer::new("W04");
        let mut parameters = Parameters::new();
        parameters.insert("duration_ms".to_string(), 5000.0.into());

        let interrupt = Interrupt::detached();
        interrupt.raise();
        let ctx = StepContext::new("slow", StepType::Annealing, &parameters, &wafer, &interrupt);
        let started = Instant::now();
        let outcome = SimulatedEngine.execute(&ctx);

        assert!(!outcome.success);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_snapshot_restore() {
        let wafer = Wafer::new("W05");
        run(&SimulatedEngine, &wafer, &Parameters::new(), 1);

        let blob = wafer.snapshot().unwrap();
        let restored = WaferRestore.restore(&blob).unwrap();
        let restored = restored.as_any().downcast_ref::<Wafer>().unwrap();
        assert_eq!(restored.label(), "W05");
        assert_eq!(restored.history(), wafer.history());
        assert!(WaferRestore.restore(b"not json").is_err());
    }

    #[test]
    fn test_registry_covers_every_type() {
        let registry = registry();
        assert_eq!(registry.len(), StepType::ALL.len());
    }
}
