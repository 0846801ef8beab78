//! Simulation Orchestrator
//!
//! The explicitly constructed entry point callers hold: runs flows on the
//! execution engine and answers status queries, cancellation and
//! checkpoint requests while a run is in progress on another thread.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::checkpoint::{AutoCheckpointer, Checkpoint, CheckpointManager, FlowState};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::execution::engine::Engine;
use crate::execution::{ExecutionRecord, RunControl, RunOutcome, StepRegistry};
use crate::flow::{Flow, StepStatus};
use crate::monitoring::{
    ExecutionTimeline, ProgressTracker, ResourceSampler, ResourceSummary, SimulationProgress,
    MONITOR_SAMPLE_INTERVAL,
};
use crate::workpiece::{WorkpieceHandle, WorkpieceRestore};

/// Result of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Every invocation attempt, in completion order
    pub records: Vec<ExecutionRecord>,
    pub progress: SimulationProgress,
    /// Final status per step (`id#unit` in pipelined runs)
    pub statuses: HashMap<String, StepStatus>,
    pub resources: Option<ResourceSummary>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    pub fn timeline(&self) -> ExecutionTimeline {
        ExecutionTimeline::from_records(&self.records)
    }

    /// Steps that ended with the given status, sorted.
    pub fn steps_with(&self, status: StepStatus) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .statuses
            .iter()
            .filter(|(_, s)| **s == status)
            .map(|(id, _)| id.as_str())
            .collect();
        ids.sort_unstable();
        ids
    }
}

/// What a checkpoint of the current run is composed from: the flow as
/// submitted and its workpiece. Live statuses come from the tracker.
struct CheckpointSource {
    template: Flow,
    workpiece: WorkpieceHandle,
}

impl CheckpointSource {
    fn capture(&self, tracker: &ProgressTracker) -> Result<Checkpoint> {
        let mut state = FlowState::capture(&self.template);
        state.overlay(&tracker.step_statuses(), tracker.last_records());
        let blob = self.workpiece.snapshot().map_err(|e| {
            OrchestratorError::Workpiece(format!(
                "snapshot of '{}' failed: {}",
                self.workpiece.label(),
                e
            ))
        })?;
        Ok(Checkpoint::new(state, blob))
    }
}

/// Clears the running flag when a run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Coordinates flow execution against a step registry.
///
/// One run at a time; every query method may be called from other threads
/// while [`run`](Self::run) blocks.
///
/// # Example
///
/// ```rust,no_run
/// use fabrunner::flow::load_flow;
/// use fabrunner::sim::{self, Wafer};
/// use fabrunner::{Orchestrator, OrchestratorConfig};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut file = load_flow("flows/nmos_front_end.yaml")?;
///     let mut config = OrchestratorConfig::default();
///     config.apply(&file.settings);
///
///     let orchestrator = Orchestrator::new(sim::registry(), config);
///     let report = orchestrator.run(&mut file.flow, Wafer::handle("W01"))?;
///     println!("{}: {} steps completed", report.outcome, report.progress.completed_steps);
///     Ok(())
/// }
/// ```
pub struct Orchestrator {
    registry: Arc<StepRegistry>,
    config: OrchestratorConfig,
    tracker: Arc<ProgressTracker>,
    control: RunControl,
    running: AtomicBool,
    source: Mutex<Option<Arc<CheckpointSource>>>,
}

impl Orchestrator {
    pub fn new(registry: StepRegistry, config: OrchestratorConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            config,
            tracker: Arc::new(ProgressTracker::new()),
            control: RunControl::new(),
            running: AtomicBool::new(false),
            source: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// Runs `flow` against `workpiece` until every step is terminal.
    ///
    /// Completed steps are kept and not invoked again, so running a flow
    /// restored from a checkpoint continues where it stopped. Step statuses
    /// and last records are written back into `flow`.
    ///
    /// # Returns
    ///
    /// * `Ok(RunReport)` - The run ended; see `outcome` for how
    /// * `Err` - Another run is active, an engine is missing or the
    ///   scheduler stalled
    pub fn run(&self, flow: &mut Flow, workpiece: WorkpieceHandle) -> Result<RunReport> {
        let _guard = self.begin_run()?;
        self.control.reset();

        let engine = Engine::new(&self.registry, &self.config, &self.control, &self.tracker);
        let plan = engine.prepare(std::slice::from_mut(flow), 1, false)?;

        let source = Arc::new(CheckpointSource {
            template: flow.clone(),
            workpiece: Arc::clone(&workpiece),
        });
        *self.source.lock() = Some(Arc::clone(&source));

        let timer = match &self.config.auto_checkpoint {
            Some(auto) => {
                let tracker = Arc::clone(&self.tracker);
                let source = Arc::clone(&source);
                Some(AutoCheckpointer::start(auto.interval, auto.path.clone(), move || {
                    source.capture(&tracker)
                })?)
            }
            None => None,
        };
        let sampler = self.start_sampler();

        let result = engine.execute(plan, std::slice::from_mut(flow), &[workpiece]);

        if let Some(timer) = timer {
            timer.stop();
        }
        let resources = sampler.and_then(ResourceSampler::stop);
        Ok(self.report(result?, resources))
    }

    /// Replays `flow` once per workpiece.
    ///
    /// Every unit starts from a fresh copy of the flow. In Pipeline mode a
    /// unit enters a stage only after the unit ahead of it has left that
    /// stage, so different units overlap on different stages. Statuses are
    /// reported as `step#unit`. Pipelined runs are not checkpointed.
    pub fn run_pipeline(&self, flow: &Flow, workpieces: Vec<WorkpieceHandle>) -> Result<RunReport> {
        if workpieces.is_empty() {
            return Err(OrchestratorError::Workpiece(
                "a pipelined run needs at least one workpiece".to_string(),
            ));
        }
        let _guard = self.begin_run()?;
        self.control.reset();
        *self.source.lock() = None;

        let mut units: Vec<Flow> = workpieces
            .iter()
            .map(|_| {
                let mut unit = flow.clone();
                unit.reset();
                unit
            })
            .collect();

        let engine = Engine::new(&self.registry, &self.config, &self.control, &self.tracker);
        let plan = engine.prepare(&mut units, workpieces.len(), true)?;
        let sampler = self.start_sampler();

        let result = engine.execute(plan, &mut units, &workpieces);

        let resources = sampler.and_then(ResourceSampler::stop);
        Ok(self.report(result?, resources))
    }

    /// Aggregate progress of the current (or last) run.
    pub fn get_status(&self) -> SimulationProgress {
        self.tracker.snapshot()
    }

    /// Status of every step of the current (or last) run.
    pub fn get_step_statuses(&self) -> HashMap<String, StepStatus> {
        self.tracker.step_statuses()
    }

    /// Cancels the current run: waiting steps are cancelled, running steps
    /// are interrupted and their results discarded.
    ///
    /// Every run starts with cleared cancel and pause signals, so a cancel
    /// issued while no run is active has no effect on the next one.
    pub fn cancel(&self) {
        if self.is_running() {
            info!("Cancellation requested");
        } else {
            warn!("Cancellation requested with no run in progress; ignored");
        }
        self.control.cancel();
    }

    /// Stops dispatching new steps; running steps finish.
    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Writes a checkpoint of the current (or last) run to `path`.
    pub fn save_checkpoint(&self, path: impl AsRef<Path>) -> Result<Checkpoint> {
        let source = self
            .source
            .lock()
            .clone()
            .ok_or(OrchestratorError::NothingToCheckpoint)?;
        let checkpoint = source.capture(&self.tracker)?;
        CheckpointManager::write(&checkpoint, path)?;
        Ok(checkpoint)
    }

    pub fn load_checkpoint(&self, path: impl AsRef<Path>) -> Result<Checkpoint> {
        CheckpointManager::load(path)
    }

    /// Rebuilds the flow and workpiece captured in `checkpoint`, ready to be
    /// passed to [`run`](Self::run).
    pub fn resume_from(
        &self,
        checkpoint: &Checkpoint,
        restore: &dyn WorkpieceRestore,
    ) -> Result<(Flow, WorkpieceHandle)> {
        let flow = CheckpointManager::resume(checkpoint)?;
        let workpiece = restore
            .restore(&checkpoint.workpiece_snapshot)
            .map_err(OrchestratorError::Workpiece)?;
        Ok((flow, workpiece))
    }

    fn begin_run(&self) -> Result<RunGuard<'_>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(OrchestratorError::AlreadyRunning);
        }
        Ok(RunGuard(&self.running))
    }

    fn start_sampler(&self) -> Option<ResourceSampler> {
        if !self.config.monitor_resources {
            return None;
        }
        match ResourceSampler::start(MONITOR_SAMPLE_INTERVAL) {
            Ok(sampler) => Some(sampler),
            Err(e) => {
                warn!("Resource monitoring disabled: {}", e);
                None
            }
        }
    }

    fn report(&self, outcome: RunOutcome, resources: Option<ResourceSummary>) -> RunReport {
        let progress = self.tracker.snapshot();
        info!(
            "Flow {} in {:.2?}: {} completed, {} failed, {} skipped, {} cancelled",
            outcome,
            progress.elapsed_time,
            progress.completed_steps,
            progress.failed_steps,
            progress.skipped_steps,
            progress.cancelled_steps
        );
        RunReport {
            outcome,
            records: self.tracker.records(),
            progress,
            statuses: self.tracker.step_statuses(),
            resources,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{engine_fn, StepOutcome};
    use crate::flow::{ExecutionMode, ProcessStep, StepType, WorkpieceAccess};
    use crate::sim::{self, Wafer, WaferRestore};
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    fn config() -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        config.set_poll_interval(Duration::from_millis(5));
        config
    }

    fn timed(id: &str, step_type: StepType, ms: f64) -> ProcessStep {
        ProcessStep::new(id, step_type).with_parameter("duration_ms", ms)
    }

    /// Registry whose engines count invocations and track peak concurrency.
    fn counting_registry(calls: &Arc<AtomicUsize>, peak: &Arc<AtomicUsize>, ms: u64) -> StepRegistry {
        let active = Arc::new(AtomicUsize::new(0));
        let mut registry = StepRegistry::new();
        for step_type in StepType::ALL {
            let (calls, peak, active) = (Arc::clone(calls), Arc::clone(peak), Arc::clone(&active));
            registry.register(
                step_type,
                engine_fn(move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(ms));
                    active.fetch_sub(1, Ordering::SeqCst);
                    StepOutcome::success()
                }),
            );
        }
        registry
    }

    fn record<'a>(report: &'a RunReport, id: &str) -> &'a ExecutionRecord {
        report.records.iter().find(|r| r.step_id == id).unwrap()
    }

    #[test]
    fn test_parallel_oxidation_then_doping_and_metrology() {
        let calls = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut config = config();
        config.set_worker_limit(2);
        let orchestrator = Orchestrator::new(counting_registry(&calls, &peak, 60), config);

        let mut flow = Flow::builder("three-step")
            .mode(ExecutionMode::Parallel)
            .step(ProcessStep::new("oxidation", StepType::Oxidation))
            .step(ProcessStep::new("doping", StepType::Doping).depends_on("oxidation"))
            .step(
                ProcessStep::new("metrology", StepType::Inspection)
                    .depends_on("oxidation")
                    .with_access(WorkpieceAccess::Independent),
            )
            .build()
            .unwrap();

        let report = orchestrator
            .run(&mut flow, Arc::new(crate::workpiece::NullWorkpiece))
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        let ox = record(&report, "oxidation");
        assert!(ox.success);
        assert!(record(&report, "doping").start_time >= ox.end_time);
        assert!(record(&report, "metrology").start_time >= ox.end_time);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_sequential_failure_skips_remaining_steps() {
        let mut registry = StepRegistry::new();
        registry.register(StepType::Oxidation, engine_fn(|_| StepOutcome::success()));
        registry.register(StepType::Doping, engine_fn(|_| StepOutcome::failure("implanter fault")));
        registry.register(StepType::Deposition, engine_fn(|_| StepOutcome::success()));
        let orchestrator = Orchestrator::new(registry, config());

        let mut flow = Flow::builder("four-step")
            .step(ProcessStep::new("s1", StepType::Oxidation))
            .step(ProcessStep::new("s2", StepType::Doping).depends_on("s1"))
            .step(ProcessStep::new("s3", StepType::Deposition).depends_on("s2"))
            .step(ProcessStep::new("s4", StepType::Deposition))
            .build()
            .unwrap();

        let report = orchestrator.run(&mut flow, Wafer::handle("W1")).unwrap();

        assert_eq!(report.outcome, RunOutcome::Halted);
        let status = orchestrator.get_status();
        assert_eq!(status.failed_steps, 1);
        assert_eq!(status.skipped_steps, 2);
        assert_eq!(status.completed_steps, 1);
        assert_eq!(report.steps_with(StepStatus::Skipped), vec!["s3", "s4"]);
        assert_eq!(orchestrator.get_step_statuses()["s2"], StepStatus::Failed);
    }

    #[test]
    fn test_sequential_records_follow_dependencies() {
        let orchestrator = Orchestrator::new(sim::registry(), config());
        let mut flow = Flow::builder("stack")
            .step(timed("nitride", StepType::Deposition, 5.0).depends_on("pad_ox"))
            .step(timed("pad_ox", StepType::Oxidation, 5.0))
            .step(timed("litho", StepType::Lithography, 5.0).depends_on("nitride"))
            .build()
            .unwrap();
        let wafer = Wafer::handle("W2");

        let report = orchestrator.run(&mut flow, Arc::clone(&wafer)).unwrap();

        for id in ["nitride", "litho"] {
            for dep in flow.dependencies_of(id) {
                assert!(record(&report, dep).end_time <= record(&report, id).start_time);
            }
        }
        let wafer = wafer.as_any().downcast_ref::<Wafer>().unwrap();
        assert_eq!(wafer.applied_ids(), vec!["pad_ox", "nitride", "litho"]);
    }

    #[test]
    fn test_every_step_terminal_after_run() {
        let mut config = config();
        config.set_continue_on_error(true).set_worker_limit(3);
        let orchestrator = Orchestrator::new(sim::registry(), config);

        let mut flow = Flow::builder("mixed")
            .mode(ExecutionMode::Parallel)
            .step(timed("a", StepType::Oxidation, 2.0))
            .step(timed("b", StepType::Doping, 2.0).depends_on("a").with_parameter("fail", true))
            .step(timed("c", StepType::Annealing, 2.0).depends_on("b"))
            .step(timed("d", StepType::Deposition, 2.0).depends_on("a"))
            .step(timed("e", StepType::Etching, 2.0).depends_on("d"))
            .build()
            .unwrap();

        let report = orchestrator.run(&mut flow, Wafer::handle("W3")).unwrap();

        assert_eq!(report.outcome, RunOutcome::CompletedWithFailures);
        assert!(report.progress.is_finished());
        assert_eq!(report.progress.terminal_steps(), report.progress.total_steps);
        assert!(flow.steps().iter().all(|s| s.status.is_terminal()));
        assert_eq!(report.steps_with(StepStatus::Skipped), vec!["c"]);
    }

    #[test]
    fn test_shared_wafer_serialises_writers_in_parallel_mode() {
        let calls = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut config = config();
        config.set_worker_limit(4);
        let orchestrator = Orchestrator::new(counting_registry(&calls, &peak, 20), config);

        let mut flow = Flow::builder("one wafer")
            .mode(ExecutionMode::Parallel)
            .step(ProcessStep::new("implant", StepType::Doping))
            .step(ProcessStep::new("etch", StepType::Etching))
            .build()
            .unwrap();

        let report = orchestrator.run(&mut flow, Wafer::handle("W12")).unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(record(&report, "implant").end_time <= record(&report, "etch").start_time);
    }

    #[test]
    fn test_pipeline_mode_on_one_workpiece_runs_sequentially() {
        let calls = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut config = config();
        config.set_worker_limit(4);
        let orchestrator = Orchestrator::new(counting_registry(&calls, &peak, 10), config);

        let steps = ["s0", "s1", "s2"]
            .iter()
            .map(|id| ProcessStep::new(*id, StepType::Etching).with_access(WorkpieceAccess::Independent));
        let mut flow = Flow::builder("single unit")
            .mode(ExecutionMode::Pipeline)
            .steps(steps)
            .build()
            .unwrap();

        let report = orchestrator.run(&mut flow, Wafer::handle("W13")).unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        let invoked: Vec<_> = report.records.iter().map(|r| r.step_id.as_str()).collect();
        assert_eq!(invoked, vec!["s0", "s1", "s2"]);
        assert!(report.records.iter().all(|r| r.unit.is_none()));
        assert_eq!(report.statuses["s2"], StepStatus::Completed);
        assert!(flow.is_complete());
    }

    #[test]
    fn test_cancel_before_run_does_not_carry_over() {
        let orchestrator = Orchestrator::new(sim::registry(), config());
        orchestrator.cancel();

        let mut flow = Flow::builder("after cancel")
            .step(timed("ox", StepType::Oxidation, 1.0))
            .build()
            .unwrap();
        let report = orchestrator.run(&mut flow, Wafer::handle("W14")).unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(flow.status("ox"), Some(StepStatus::Completed));
    }

    #[test]
    fn test_cycle_rejected_before_any_invocation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let orchestrator = Orchestrator::new(counting_registry(&calls, &peak, 0), config());

        let result = Flow::builder("loop")
            .step(ProcessStep::new("a", StepType::Oxidation).depends_on("b"))
            .step(ProcessStep::new("b", StepType::Doping).depends_on("a"))
            .build();

        assert!(matches!(result, Err(OrchestratorError::CyclicDependency(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(orchestrator.get_status().total_steps, 0);
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wafer.ckpt");
        let orchestrator = Orchestrator::new(sim::registry(), config());

        let mut flow = Flow::builder("round-trip")
            .step(timed("ox", StepType::Oxidation, 1.0))
            .step(timed("implant", StepType::Doping, 1.0).depends_on("ox").with_parameter("fail", true))
            .build()
            .unwrap();
        let wafer = Wafer::handle("W4");
        orchestrator.run(&mut flow, Arc::clone(&wafer)).unwrap();

        let saved = orchestrator.save_checkpoint(&path).unwrap();
        let loaded = orchestrator.load_checkpoint(&path).unwrap();

        assert_eq!(loaded.statuses(), flow.statuses());
        assert_eq!(loaded.workpiece_snapshot, wafer.snapshot().unwrap());
        assert_eq!(loaded, saved);
        assert!(loaded.flow_state.last_records["implant"].error_detail.is_some());
    }

    #[test]
    fn test_resume_of_completed_checkpoint_invokes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("done.ckpt");

        let first = Orchestrator::new(sim::registry(), config());
        let mut flow = Flow::builder("done")
            .step(timed("ox", StepType::Oxidation, 1.0))
            .step(timed("cmp", StepType::Cmp, 1.0).depends_on("ox"))
            .build()
            .unwrap();
        first.run(&mut flow, Wafer::handle("W5")).unwrap();
        first.save_checkpoint(&path).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let second = Orchestrator::new(counting_registry(&calls, &peak, 0), config());
        let checkpoint = second.load_checkpoint(&path).unwrap();
        let (mut resumed, wafer) = second.resume_from(&checkpoint, &WaferRestore).unwrap();
        let report = second.run(&mut resumed, wafer).unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert!(report.records.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.progress.completed_steps, 2);
    }

    #[test]
    fn test_resume_after_halt_runs_only_unfinished_steps() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("halted.ckpt");
        let orchestrator = Orchestrator::new(sim::registry(), config());

        let mut flow = Flow::builder("retry-later")
            .step(timed("ox", StepType::Oxidation, 1.0))
            .step(timed("anneal", StepType::Annealing, 1.0).depends_on("ox").with_parameter("fail_attempts", 1.0))
            .step(timed("metal", StepType::Metallization, 1.0).depends_on("anneal"))
            .build()
            .unwrap();
        let report = orchestrator.run(&mut flow, Wafer::handle("W6")).unwrap();
        assert_eq!(report.outcome, RunOutcome::Halted);
        orchestrator.save_checkpoint(&path).unwrap();

        let checkpoint = orchestrator.load_checkpoint(&path).unwrap();
        let (mut resumed, wafer) = orchestrator.resume_from(&checkpoint, &WaferRestore).unwrap();
        assert_eq!(resumed.status("anneal"), Some(StepStatus::Pending));
        assert_eq!(resumed.status("metal"), Some(StepStatus::Pending));

        // A fresh run counts attempts from one again; anneal fails once more.
        let mut config = config();
        config.set_max_retries(1);
        let retrying = Orchestrator::new(sim::registry(), config);
        let report = retrying.run(&mut resumed, Arc::clone(&wafer)).unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        let invoked: Vec<_> = report.records.iter().map(|r| r.step_id.as_str()).collect();
        assert_eq!(invoked, vec!["anneal", "anneal", "metal"]);
        let wafer = wafer.as_any().downcast_ref::<Wafer>().unwrap();
        assert_eq!(wafer.applied_ids(), vec!["ox", "anneal", "metal"]);
    }

    #[test]
    fn test_cancel_from_another_thread() {
        let orchestrator = Arc::new(Orchestrator::new(sim::registry(), config()));
        let mut flow = Flow::builder("long")
            .step(timed("furnace", StepType::Oxidation, 10_000.0))
            .step(timed("implant", StepType::Doping, 10.0).depends_on("furnace"))
            .step(timed("anneal", StepType::Annealing, 10.0).depends_on("implant"))
            .build()
            .unwrap();

        let canceller = Arc::clone(&orchestrator);
        let handle = thread::spawn(move || {
            while canceller.get_status().running_steps == 0 {
                thread::sleep(Duration::from_millis(5));
            }
            canceller.cancel();
        });
        let report = orchestrator.run(&mut flow, Wafer::handle("W7")).unwrap();
        handle.join().unwrap();

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        let status = orchestrator.get_status();
        assert_eq!(status.cancelled_steps, 3);
        assert_eq!(status.pending_steps + status.running_steps, 0);
        assert!(report.records[0].is_cancelled());
        assert!(report.progress.elapsed_time < Duration::from_secs(5));
    }

    #[test]
    fn test_second_concurrent_run_rejected() {
        let orchestrator = Arc::new(Orchestrator::new(sim::registry(), config()));
        let background = Arc::clone(&orchestrator);
        let handle = thread::spawn(move || {
            let mut flow = Flow::builder("slow")
                .step(timed("ox", StepType::Oxidation, 200.0))
                .build()
                .unwrap();
            background.run(&mut flow, Wafer::handle("W8")).unwrap()
        });

        while !orchestrator.is_running() {
            thread::sleep(Duration::from_millis(1));
        }
        let mut other = Flow::builder("other")
            .step(ProcessStep::new("cmp", StepType::Cmp))
            .build()
            .unwrap();
        assert!(matches!(
            orchestrator.run(&mut other, Wafer::handle("W9")),
            Err(OrchestratorError::AlreadyRunning)
        ));

        assert!(handle.join().unwrap().is_success());
        assert!(!orchestrator.is_running());
    }

    #[test]
    fn test_save_checkpoint_without_run() {
        let orchestrator = Orchestrator::new(sim::registry(), config());
        let dir = tempdir().unwrap();
        assert!(matches!(
            orchestrator.save_checkpoint(dir.path().join("x.ckpt")),
            Err(OrchestratorError::NothingToCheckpoint)
        ));
    }

    #[test]
    fn test_auto_checkpoint_writes_final_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("auto.ckpt");
        let mut config = config();
        config.set_auto_checkpoint(Duration::from_secs(3600), &path);
        let orchestrator = Orchestrator::new(sim::registry(), config);

        let mut flow = Flow::builder("auto")
            .step(timed("ox", StepType::Oxidation, 1.0))
            .build()
            .unwrap();
        orchestrator.run(&mut flow, Wafer::handle("W10")).unwrap();

        let checkpoint = CheckpointManager::load(&path).unwrap();
        assert!(checkpoint.is_complete());
        assert!(checkpoint.flow_state.last_records["ox"].success);
    }

    #[test]
    fn test_unknown_step_type_leaves_flow_untouched() {
        let mut registry = StepRegistry::new();
        registry.register(StepType::Oxidation, engine_fn(|_| StepOutcome::success()));
        let orchestrator = Orchestrator::new(registry, config());

        let mut flow = Flow::builder("unknown")
            .step(ProcessStep::new("ox", StepType::Oxidation))
            .step(ProcessStep::new("strip", StepType::Custom))
            .build()
            .unwrap();

        assert!(matches!(
            orchestrator.run(&mut flow, Wafer::handle("W11")),
            Err(OrchestratorError::UnknownStepType(StepType::Custom))
        ));
        assert!(flow.last_records().is_empty());
        assert!(!orchestrator.is_running());
    }

    #[test]
    fn test_pipeline_over_several_wafers() {
        let mut config = config();
        config.set_worker_limit(4);
        let orchestrator = Orchestrator::new(sim::registry(), config);

        let flow = Flow::builder("pipelined")
            .mode(ExecutionMode::Pipeline)
            .step(timed("ox", StepType::Oxidation, 10.0).on_workpiece("wafer"))
            .step(timed("implant", StepType::Doping, 10.0).on_workpiece("wafer"))
            .step(timed("anneal", StepType::Annealing, 10.0).on_workpiece("wafer"))
            .build()
            .unwrap();
        let wafers: Vec<WorkpieceHandle> = (0..3).map(|n| Wafer::handle(format!("W{}", n))).collect();

        let report = orchestrator.run_pipeline(&flow, wafers.clone()).unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.records.len(), 9);
        assert_eq!(report.statuses["anneal#2"], StepStatus::Completed);
        for wafer in &wafers {
            let wafer = wafer.as_any().downcast_ref::<Wafer>().unwrap();
            assert_eq!(wafer.applied_ids(), vec!["ox", "implant", "anneal"]);
        }
        assert!(matches!(
            orchestrator.save_checkpoint("unused.ckpt"),
            Err(OrchestratorError::NothingToCheckpoint)
        ));
    }

    #[test]
    fn test_pipeline_needs_a_workpiece() {
        let orchestrator = Orchestrator::new(sim::registry(), config());
        let flow = Flow::builder("empty").build().unwrap();
        assert!(matches!(
            orchestrator.run_pipeline(&flow, Vec::new()),
            Err(OrchestratorError::Workpiece(_))
        ));
    }
}
