//! Execution Engine
//!
//! Dispatches the steps of one or more flow units onto worker threads:
//! - mode-specific eligibility (sequential, parallel, pipeline, batch)
//! - bounded concurrency and per-step timeouts
//! - retries, failure propagation and cooperative cancellation
//!
//! Every invocation runs on its own thread and reports back over a channel.
//! Only the dispatcher loop mutates step statuses.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::flow::{ExecutionMode, Flow, StepStatus};
use crate::monitoring::ProgressTracker;
use crate::workpiece::WorkpieceHandle;

use super::control::{Interrupt, RunControl};
use super::record::{ExecutionRecord, CANCELLED_DETAIL, TIMEOUT_DETAIL};
use super::registry::{StepContext, StepOutcome, StepRegistry};

/// Shortest dispatcher wait, so a deadline that is due now does not spin.
const MIN_WAIT: Duration = Duration::from_millis(1);

/// How a run ended.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every step completed
    Completed,
    /// Failures were pruned with `continue_on_error`; everything else ran
    CompletedWithFailures,
    /// A failure stopped the flow; remaining steps were skipped
    Halted,
    Cancelled,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        *self == RunOutcome::Completed
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RunOutcome::Completed => "completed",
            RunOutcome::CompletedWithFailures => "completed with failures",
            RunOutcome::Halted => "halted",
            RunOutcome::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

/// (unit, step index)
type Task = (usize, usize);

struct Running {
    attempt: u32,
    started_at: DateTime<Utc>,
    started: Instant,
    deadline: Option<Instant>,
    interrupt: Interrupt,
}

/// Message from a worker thread.
struct Completion {
    task: Task,
    attempt: u32,
    outcome: StepOutcome,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    elapsed: Duration,
}

/// A validated run: tracker labels per unit and step.
pub(crate) struct Plan {
    mode: ExecutionMode,
    labels: Vec<Vec<String>>,
    replicated: bool,
}

/// Runs flows against a registry, reporting into a tracker.
pub(crate) struct Engine<'a> {
    registry: &'a StepRegistry,
    config: &'a OrchestratorConfig,
    control: &'a RunControl,
    tracker: &'a ProgressTracker,
}

impl<'a> Engine<'a> {
    pub(crate) fn new(
        registry: &'a StepRegistry,
        config: &'a OrchestratorConfig,
        control: &'a RunControl,
        tracker: &'a ProgressTracker,
    ) -> Self {
        Self {
            registry,
            config,
            control,
            tracker,
        }
    }

    /// Label under which a step of `unit` is tracked.
    pub(crate) fn label(step_id: &str, unit: usize, replicated: bool) -> String {
        if replicated {
            format!("{}#{}", step_id, unit)
        } else {
            step_id.to_string()
        }
    }

    /// Executes every unit to a terminal state.
    ///
    /// Each unit is a copy of the same flow bound to its own workpiece;
    /// `replicated` marks a pipelined run over several workpieces, where
    /// records carry the unit index.
    ///
    /// # Returns
    ///
    /// * `Ok(RunOutcome)` - Every step reached a terminal status
    /// * `Err` - An engine is missing, a worker could not be spawned or the
    ///   scheduler stalled
    #[cfg(test)]
    pub(crate) fn run(
        &self,
        units: &mut [Flow],
        workpieces: &[WorkpieceHandle],
        replicated: bool,
    ) -> Result<RunOutcome> {
        let plan = self.prepare(units, workpieces.len(), replicated)?;
        self.execute(plan, units, workpieces)
    }

    /// Resets unfinished steps, checks that every step to run has an engine
    /// and starts a fresh tracker ledger. Nothing is invoked.
    pub(crate) fn prepare(&self, units: &mut [Flow], workpieces: usize, replicated: bool) -> Result<Plan> {
        if units.len() != workpieces {
            return Err(OrchestratorError::Workpiece(format!(
                "{} flow units but {} workpieces",
                units.len(),
                workpieces
            )));
        }
        let mode = units.first().map(Flow::execution_mode).unwrap_or_default();

        // Completed steps survive a re-run; everything else starts over.
        for flow in units.iter_mut() {
            for i in 0..flow.len() {
                if flow.status_at(i) != StepStatus::Completed {
                    flow.set_status_at(i, StepStatus::Pending);
                }
            }
        }
        self.validate_engines(units)?;

        let labels: Vec<Vec<String>> = units
            .iter()
            .enumerate()
            .map(|(u, flow)| {
                flow.steps()
                    .iter()
                    .map(|s| Self::label(&s.id, u, replicated))
                    .collect()
            })
            .collect();

        self.tracker.begin(units.iter().enumerate().flat_map(|(u, flow)| {
            let labels = &labels[u];
            flow.steps()
                .iter()
                .enumerate()
                .map(move |(i, s)| (labels[i].clone(), s.step_type, s.status))
        }));
        for (u, flow) in units.iter().enumerate() {
            let seeded = flow
                .last_records()
                .iter()
                .map(|(id, record)| (Self::label(id, u, replicated), record.clone()))
                .collect();
            self.tracker.seed_last_records(seeded);
        }

        Ok(Plan {
            mode,
            labels,
            replicated,
        })
    }

    /// Runs a prepared plan to completion.
    pub(crate) fn execute(
        &self,
        plan: Plan,
        units: &mut [Flow],
        workpieces: &[WorkpieceHandle],
    ) -> Result<RunOutcome> {
        info!(
            "Starting execution ({} mode, {} unit(s), worker limit: {})",
            plan.mode,
            units.len(),
            self.config.worker_limit
        );

        let mut run = Run {
            registry: self.registry,
            config: self.config,
            control: self.control,
            tracker: self.tracker,
            units,
            workpieces,
            labels: plan.labels,
            mode: plan.mode,
            replicated: plan.replicated,
            running: HashMap::new(),
            attempts: HashMap::new(),
            halted: false,
            cancelled: false,
        };
        let result = run.drive();
        self.tracker.finish();
        result
    }

    /// Fails with `UnknownStepType` before anything runs.
    fn validate_engines(&self, units: &[Flow]) -> Result<()> {
        for flow in units {
            for step in flow.steps() {
                if step.status != StepStatus::Completed && !self.registry.contains(step.step_type) {
                    error!("No engine registered for step '{}' ({})", step.id, step.step_type);
                    return Err(OrchestratorError::UnknownStepType(step.step_type));
                }
            }
        }
        Ok(())
    }
}

/// State of one run of the dispatcher loop.
struct Run<'a, 'u> {
    registry: &'a StepRegistry,
    config: &'a OrchestratorConfig,
    control: &'a RunControl,
    tracker: &'a ProgressTracker,
    units: &'u mut [Flow],
    workpieces: &'u [WorkpieceHandle],
    labels: Vec<Vec<String>>,
    mode: ExecutionMode,
    replicated: bool,
    running: HashMap<Task, Running>,
    /// Invocations started per task
    attempts: HashMap<Task, u32>,
    halted: bool,
    cancelled: bool,
}

impl Run<'_, '_> {
    fn drive(&mut self) -> Result<RunOutcome> {
        let (tx, rx): (Sender<Completion>, Receiver<Completion>) = channel();
        let mut paused = false;

        loop {
            self.observe_cancel();

            let dispatching = !self.halted && !self.cancelled;
            if dispatching {
                self.promote();
                if self.control.is_paused() {
                    if !paused {
                        info!("Execution paused - waiting for resume signal");
                        paused = true;
                    }
                } else {
                    if paused {
                        info!("Resumed");
                        paused = false;
                    }
                    self.dispatch(&tx)?;
                }
            }

            if self.running.is_empty() {
                let waiting = self.waiting();
                if waiting.is_empty() {
                    break;
                }
                if dispatching && !paused {
                    return Err(self.deadlock(waiting));
                }
            }

            if let Ok(completion) = rx.recv_timeout(self.next_wait()) {
                self.complete(completion);
            }
            self.expire(Instant::now());
        }

        Ok(self.outcome())
    }

    fn set_status(&mut self, (u, i): Task, status: StepStatus) {
        self.units[u].set_status_at(i, status);
        self.tracker.transition(&self.labels[u][i], status);
    }

    fn waiting(&self) -> Vec<Task> {
        let mut tasks = Vec::new();
        for (u, flow) in self.units.iter().enumerate() {
            for &i in flow.order_indices() {
                if flow.status_at(i).is_waiting() {
                    tasks.push((u, i));
                }
            }
        }
        tasks
    }

    /// Marks Pending steps Ready according to the execution mode.
    fn promote(&mut self) {
        let mut ready = Vec::new();
        match self.mode {
            ExecutionMode::Batch => {
                for (u, flow) in self.units.iter().enumerate() {
                    for &i in flow.order_indices() {
                        if flow.status_at(i) == StepStatus::Pending {
                            ready.push((u, i));
                        }
                    }
                }
            }
            ExecutionMode::Sequential | ExecutionMode::Parallel => {
                for (u, flow) in self.units.iter().enumerate() {
                    for &i in flow.order_indices() {
                        if flow.status_at(i) == StepStatus::Pending && deps_completed(flow, i) {
                            ready.push((u, i));
                        }
                    }
                }
            }
            ExecutionMode::Pipeline => {
                for u in 0..self.units.len() {
                    if let Some(i) = self.next_pipelined(u) {
                        ready.push((u, i));
                    }
                }
            }
        }

        for task in ready {
            self.set_status(task, StepStatus::Ready);
        }
    }

    /// Next step of unit `u` in a pipelined run.
    ///
    /// A unit runs its steps one at a time in topological order, and enters
    /// stage `k` only after every unit ahead of it has left stages `0..=k`.
    fn next_pipelined(&self, u: usize) -> Option<usize> {
        let flow = &self.units[u];
        let busy = flow
            .order_indices()
            .iter()
            .any(|&i| matches!(flow.status_at(i), StepStatus::Ready | StepStatus::Running));
        if busy {
            return None;
        }

        let next = flow
            .order_indices()
            .iter()
            .copied()
            .find(|&i| flow.status_at(i) == StepStatus::Pending)?;
        if !deps_completed(flow, next) {
            return None;
        }

        let stage = flow.rank_at(next);
        let clear = self.units[..u].iter().all(|ahead| {
            ahead
                .order_indices()
                .iter()
                .all(|&i| ahead.rank_at(i) > stage || ahead.status_at(i).is_terminal())
        });
        clear.then_some(next)
    }

    /// Starts Ready steps while workers are free.
    fn dispatch(&mut self, tx: &Sender<Completion>) -> Result<()> {
        let limit = match self.mode {
            ExecutionMode::Sequential => 1,
            _ => self.config.worker_limit.max(1),
        };
        if self.running.len() >= limit {
            return Ok(());
        }

        let mut ready = Vec::new();
        for (u, flow) in self.units.iter().enumerate() {
            for &i in flow.order_indices() {
                if flow.status_at(i) == StepStatus::Ready {
                    ready.push((u, i));
                }
            }
        }

        let free = limit - self.running.len();
        for task in ready.into_iter().take(free) {
            self.launch(task, tx)?;
        }
        Ok(())
    }

    fn launch(&mut self, task: Task, tx: &Sender<Completion>) -> Result<()> {
        let (u, i) = task;
        let step = self.units[u].step_at(i);
        let engine = self.registry.resolve(step.step_type)?;
        let step_id = step.id.clone();
        let step_type = step.step_type;
        let parameters = step.parameters.clone();
        let timeout = step.timeout().or(self.config.step_timeout);

        let attempts = self.attempts.entry(task).or_insert(0);
        *attempts += 1;
        let attempt = *attempts;

        let label = self.labels[u][i].clone();
        let interrupt = self.control.interrupt();
        let worker_interrupt = interrupt.clone();
        let workpiece = Arc::clone(&self.workpieces[u]);
        let unit = self.replicated.then_some(u);
        let tx = tx.clone();

        if attempt > 1 {
            info!("Starting step: {} (attempt {})", label, attempt);
        } else {
            info!("Starting step: {}", label);
        }

        thread::Builder::new()
            .name(format!("step-{}", label))
            .spawn(move || {
                let started_at = Utc::now();
                let clock = Instant::now();
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    let mut ctx = StepContext::new(
                        &step_id,
                        step_type,
                        &parameters,
                        &*workpiece,
                        &worker_interrupt,
                    );
                    ctx.unit = unit;
                    ctx.attempt = attempt;
                    engine.execute(&ctx)
                }))
                .unwrap_or_else(|payload| {
                    StepOutcome::failure(format!("engine panicked: {}", panic_message(payload.as_ref())))
                });

                let completion = Completion {
                    task,
                    attempt,
                    outcome,
                    started_at,
                    finished_at: Utc::now(),
                    elapsed: clock.elapsed(),
                };
                if tx.send(completion).is_err() {
                    debug!("Run finished before step '{}' returned; result dropped", step_id);
                }
            })?;

        let started = Instant::now();
        self.running.insert(
            task,
            Running {
                attempt,
                started_at: Utc::now(),
                started,
                deadline: timeout.map(|t| started + t),
                interrupt,
            },
        );
        self.set_status(task, StepStatus::Running);
        Ok(())
    }

    /// Poll interval, shortened to the nearest step deadline.
    fn next_wait(&self) -> Duration {
        let now = Instant::now();
        self.running
            .values()
            .filter_map(|r| r.deadline)
            .map(|d| d.saturating_duration_since(now))
            .fold(self.config.poll_interval, Duration::min)
            .max(MIN_WAIT)
    }

    fn complete(&mut self, completion: Completion) {
        self.observe_cancel();
        let (u, i) = completion.task;
        match self.running.get(&completion.task) {
            Some(run) if run.attempt == completion.attempt => {}
            _ => {
                debug!(
                    "Ignoring late result of '{}' (attempt {})",
                    self.labels[u][i], completion.attempt
                );
                return;
            }
        }
        self.running.remove(&completion.task);

        let mut record = self.record(
            completion.task,
            completion.attempt,
            completion.started_at,
            completion.finished_at,
            completion.elapsed,
            completion.outcome,
        );

        if self.cancelled {
            info!("Discarding result of '{}' after cancellation", self.labels[u][i]);
            record.success = false;
            record.output_reference = None;
            record.error_detail = Some(CANCELLED_DETAIL.to_string());
            self.finish(completion.task, record, StepStatus::Cancelled);
        } else if record.success {
            info!("Step '{}' completed successfully", self.labels[u][i]);
            self.finish(completion.task, record, StepStatus::Completed);
        } else {
            self.fail(completion.task, record);
        }
    }

    /// Fails every running step whose deadline has passed.
    fn expire(&mut self, now: Instant) {
        self.observe_cancel();
        let mut expired: Vec<Task> = self
            .running
            .iter()
            .filter(|(_, run)| run.deadline.is_some_and(|d| d <= now))
            .map(|(task, _)| *task)
            .collect();
        expired.sort_unstable();

        for task in expired {
            let Some(run) = self.running.remove(&task) else {
                continue;
            };
            run.interrupt.raise();

            let detail = if self.cancelled {
                CANCELLED_DETAIL
            } else {
                TIMEOUT_DETAIL
            };
            let record = self.record(
                task,
                run.attempt,
                run.started_at,
                Utc::now(),
                run.started.elapsed(),
                StepOutcome::failure(detail),
            );

            if self.cancelled {
                self.finish(task, record, StepStatus::Cancelled);
            } else {
                warn!(
                    "Step '{}' timed out after {:.2?}",
                    self.labels[task.0][task.1],
                    run.started.elapsed()
                );
                self.fail(task, record);
            }
        }
    }

    fn record(
        &self,
        (u, i): Task,
        attempt: u32,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        elapsed: Duration,
        outcome: StepOutcome,
    ) -> ExecutionRecord {
        let step = self.units[u].step_at(i);
        let error_detail = match outcome.error_detail {
            None if !outcome.success => Some("engine reported failure".to_string()),
            detail => detail,
        };
        ExecutionRecord {
            step_id: step.id.clone(),
            unit: self.replicated.then_some(u),
            step_type: step.step_type,
            attempt,
            start_time,
            end_time,
            duration_ms: elapsed.as_millis() as u64,
            success: outcome.success,
            error_detail,
            output_reference: outcome.output_reference,
        }
    }

    /// Applies a step's resulting status together with its record.
    fn finish(&mut self, (u, i): Task, record: ExecutionRecord, status: StepStatus) {
        self.units[u].set_status_at(i, status);
        self.units[u].set_last_record(record.clone());
        self.tracker.record(&self.labels[u][i], record, status);
    }

    fn fail(&mut self, task: Task, record: ExecutionRecord) {
        let label = self.labels[task.0][task.1].clone();
        error!(
            "Step '{}' failed: {}",
            label,
            record.error_detail.as_deref().unwrap_or_default()
        );

        let attempt = record.attempt;
        if attempt <= self.config.max_retries && !self.halted && !self.cancelled {
            warn!(
                "Retrying step '{}' (attempt {} of {})",
                label,
                attempt + 1,
                self.config.max_retries + 1
            );
            self.finish(task, record, StepStatus::Pending);
            return;
        }

        self.finish(task, record, StepStatus::Failed);
        // Batch operations are independent of each other, so there is
        // nothing to halt for.
        if self.config.continue_on_error || self.mode == ExecutionMode::Batch {
            self.skip_dependents(task);
        } else {
            self.halt(&label);
        }
    }

    /// Skips every waiting step downstream of a failed one.
    fn skip_dependents(&mut self, (u, i): Task) {
        if self.mode == ExecutionMode::Batch {
            return;
        }

        let mut stack = self.units[u].dependents_at(i).to_vec();
        let mut skipped = Vec::new();
        while let Some(d) = stack.pop() {
            if self.units[u].status_at(d).is_waiting() {
                self.set_status((u, d), StepStatus::Skipped);
                skipped.push(self.labels[u][d].clone());
                stack.extend_from_slice(self.units[u].dependents_at(d));
            }
        }

        if !skipped.is_empty() {
            warn!(
                "Skipping {} step(s) downstream of '{}': {}",
                skipped.len(),
                self.labels[u][i],
                skipped.join(", ")
            );
        }
    }

    /// Fail-fast: nothing new starts, running steps finish.
    fn halt(&mut self, failed: &str) {
        self.halted = true;
        let waiting = self.waiting();
        for &task in &waiting {
            self.set_status(task, StepStatus::Skipped);
        }
        warn!(
            "Halting flow after failure of '{}'; {} step(s) skipped",
            failed,
            waiting.len()
        );
    }

    /// Applies a cancel request. A cooperative engine may return as soon as
    /// it sees the signal, so results are classified only after this.
    fn observe_cancel(&mut self) {
        if self.control.is_cancelled() && !self.cancelled {
            self.cancel_all();
        }
    }

    fn cancel_all(&mut self) {
        self.cancelled = true;
        for run in self.running.values() {
            run.interrupt.raise();
        }
        let waiting = self.waiting();
        for &task in &waiting {
            self.set_status(task, StepStatus::Cancelled);
        }
        info!(
            "Cancellation requested: {} step(s) cancelled, waiting for {} running",
            waiting.len(),
            self.running.len()
        );
    }

    fn deadlock(&mut self, waiting: Vec<Task>) -> OrchestratorError {
        let pending: Vec<String> = waiting
            .iter()
            .map(|&(u, i)| self.labels[u][i].clone())
            .collect();
        for task in waiting {
            self.set_status(task, StepStatus::Skipped);
        }
        error!("Scheduler stalled with {} step(s) pending", pending.len());
        OrchestratorError::DeadlockDetected { pending }
    }

    fn outcome(&self) -> RunOutcome {
        if self.cancelled {
            RunOutcome::Cancelled
        } else if self.halted {
            RunOutcome::Halted
        } else if self
            .units
            .iter()
            .any(|flow| flow.steps().iter().any(|s| s.status == StepStatus::Failed))
        {
            RunOutcome::CompletedWithFailures
        } else {
            RunOutcome::Completed
        }
    }
}

/// Declared dependencies must have completed; workpiece conflict edges only
/// need the earlier step to be finished.
fn deps_completed(flow: &Flow, i: usize) -> bool {
    flow.deps_at(i).iter().all(|&d| {
        let status = flow.status_at(d);
        status == StepStatus::Completed || (status.is_terminal() && flow.implicit_at(i).contains(&d))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
