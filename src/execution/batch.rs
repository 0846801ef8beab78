//! Batch Queue
//!
//! Ad-hoc operations without a named flow. Producers enqueue from any
//! thread; each drain runs whatever was queued when it started as one
//! Batch-mode flow on the orchestrator.

use std::mem;
use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::flow::{ExecutionMode, Flow, Parameters, ProcessStep, StepType};
use crate::orchestrator::Orchestrator;
use crate::workpiece::{NullWorkpiece, WorkpieceHandle};

use super::record::ExecutionRecord;

/// Queue of independent operations.
pub struct BatchQueue {
    orchestrator: Arc<Orchestrator>,
    pending: Mutex<Vec<ProcessStep>>,
}

impl BatchQueue {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Queues one operation.
    ///
    /// # Returns
    ///
    /// The generated step id (`batch-<uuid>`), which keys its record.
    pub fn enqueue(&self, step_type: StepType, parameters: Parameters) -> String {
        let id = format!("batch-{}", Uuid::new_v4());
        let step = ProcessStep::new(id.clone(), step_type).with_parameters(parameters);
        self.pending.lock().push(step);
        debug!("Queued {} operation '{}'", step_type, id);
        id
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Runs every queued operation without a workpiece.
    pub fn drain(&self) -> Result<Vec<ExecutionRecord>> {
        self.drain_on(Arc::new(NullWorkpiece))
    }

    /// Runs every queued operation against `workpiece`, concurrently up to
    /// the orchestrator's worker limit.
    ///
    /// Items enqueued after the drain starts wait for the next drain. If the
    /// run cannot start, the drained items are put back at the front of the
    /// queue.
    pub fn drain_on(&self, workpiece: WorkpieceHandle) -> Result<Vec<ExecutionRecord>> {
        let steps = mem::take(&mut *self.pending.lock());
        if steps.is_empty() {
            return Ok(Vec::new());
        }

        info!("Draining {} queued operation(s)", steps.len());
        let mut flow = Flow::builder("batch")
            .mode(ExecutionMode::Batch)
            .steps(steps.iter().cloned())
            .build()?;

        match self.orchestrator.run(&mut flow, workpiece) {
            Ok(report) => Ok(report.records),
            Err(e) => {
                let mut pending = self.pending.lock();
                let later = mem::replace(&mut *pending, steps);
                pending.extend(later);
                Err(e)
            }
        }
    }
}
