//! Progress & Statistics Tracker
//!
//! A thread-safe ledger of step statuses and timing. Every update happens
//! inside one short critical section; readers get values, never references
//! into the ledger.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::execution::ExecutionRecord;
use crate::flow::{StepStatus, StepType};

/// Aggregate view of a run at one instant.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SimulationProgress {
    pub total_steps: usize,
    /// Pending or Ready
    pub pending_steps: usize,
    pub running_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    pub cancelled_steps: usize,
    pub elapsed_time: Duration,
    /// `None` until at least one step has completed
    pub estimated_remaining_time: Option<Duration>,
}

impl SimulationProgress {
    /// Steps that reached a terminal status.
    pub fn terminal_steps(&self) -> usize {
        self.completed_steps + self.failed_steps + self.skipped_steps + self.cancelled_steps
    }

    pub fn is_finished(&self) -> bool {
        self.terminal_steps() == self.total_steps
    }

    /// Completed fraction in percent (100 for an empty run).
    pub fn percent_complete(&self) -> f64 {
        if self.total_steps == 0 {
            return 100.0;
        }
        self.completed_steps as f64 * 100.0 / self.total_steps as f64
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct DurationStats {
    total: Duration,
    samples: u32,
}

impl DurationStats {
    fn add(&mut self, sample: Duration) {
        self.total += sample;
        self.samples += 1;
    }

    fn mean(&self) -> Option<Duration> {
        (self.samples > 0).then(|| self.total / self.samples)
    }
}

#[derive(Debug)]
struct Entry {
    step_type: StepType,
    status: StepStatus,
}

#[derive(Debug, Default)]
struct Ledger {
    entries: HashMap<String, Entry>,
    counts: HashMap<StepStatus, usize>,
    by_type: HashMap<StepType, DurationStats>,
    overall: DurationStats,
    records: Vec<ExecutionRecord>,
    last_records: HashMap<String, ExecutionRecord>,
    started: Option<Instant>,
    finished: Option<Duration>,
}

impl Ledger {
    fn set_status(&mut self, key: &str, status: StepStatus) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        if entry.status == status {
            return;
        }
        if let Some(count) = self.counts.get_mut(&entry.status) {
            *count = count.saturating_sub(1);
        }
        *self.counts.entry(status).or_default() += 1;
        entry.status = status;
    }

    fn count(&self, status: StepStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    /// Mean duration of the step's type times the steps of that type still to
    /// run; types without samples use the overall mean.
    fn estimate_remaining(&self) -> Option<Duration> {
        let fallback = self.overall.mean()?;
        let mut remaining: HashMap<StepType, u32> = HashMap::new();
        for entry in self.entries.values() {
            if !entry.status.is_terminal() {
                *remaining.entry(entry.step_type).or_default() += 1;
            }
        }

        Some(
            remaining
                .into_iter()
                .map(|(step_type, count)| {
                    let mean = self
                        .by_type
                        .get(&step_type)
                        .and_then(DurationStats::mean)
                        .unwrap_or(fallback);
                    mean * count
                })
                .sum(),
        )
    }
}

/// Shared run ledger.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    ledger: Mutex<Ledger>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new run over `entries` (key, step type, initial status),
    /// discarding the previous run.
    pub fn begin<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, StepType, StepStatus)>,
    {
        let mut fresh = Ledger {
            started: Some(Instant::now()),
            ..Ledger::default()
        };
        for (key, step_type, status) in entries {
            *fresh.counts.entry(status).or_default() += 1;
            fresh.entries.insert(key, Entry { step_type, status });
        }
        *self.ledger.lock() = fresh;
    }

    /// Changes a step's status without an invocation (Ready, Running,
    /// Skipped, Cancelled).
    pub fn transition(&self, key: &str, status: StepStatus) {
        self.ledger.lock().set_status(key, status);
    }

    /// Appends an invocation record and applies the step's resulting status.
    pub fn record(&self, key: &str, record: ExecutionRecord, status: StepStatus) {
        let mut ledger = self.ledger.lock();
        if record.success {
            let duration = Duration::from_millis(record.duration_ms);
            ledger.by_type.entry(record.step_type).or_default().add(duration);
            ledger.overall.add(duration);
        }
        ledger.set_status(key, status);
        ledger.last_records.insert(key.to_string(), record.clone());
        ledger.records.push(record);
    }

    /// Freezes the elapsed time.
    pub fn finish(&self) {
        let mut ledger = self.ledger.lock();
        if ledger.finished.is_none() {
            ledger.finished = ledger.started.map(|s| s.elapsed());
        }
    }

    /// Consistent copy of the aggregate counters.
    pub fn snapshot(&self) -> SimulationProgress {
        let ledger = self.ledger.lock();
        let elapsed_time = ledger
            .finished
            .or_else(|| ledger.started.map(|s| s.elapsed()))
            .unwrap_or_default();

        SimulationProgress {
            total_steps: ledger.entries.len(),
            pending_steps: ledger.count(StepStatus::Pending) + ledger.count(StepStatus::Ready),
            running_steps: ledger.count(StepStatus::Running),
            completed_steps: ledger.count(StepStatus::Completed),
            failed_steps: ledger.count(StepStatus::Failed),
            skipped_steps: ledger.count(StepStatus::Skipped),
            cancelled_steps: ledger.count(StepStatus::Cancelled),
            elapsed_time,
            estimated_remaining_time: ledger.estimate_remaining(),
        }
    }

    pub fn step_statuses(&self) -> HashMap<String, StepStatus> {
        self.ledger
            .lock()
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.status))
            .collect()
    }

    pub fn status(&self, key: &str) -> Option<StepStatus> {
        self.ledger.lock().entries.get(key).map(|e| e.status)
    }

    /// All records of the current run, in append order.
    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.ledger.lock().records.clone()
    }

    pub fn last_records(&self) -> HashMap<String, ExecutionRecord> {
        self.ledger.lock().last_records.clone()
    }

    /// Seeds last records carried over from a checkpoint.
    pub fn seed_last_records(&self, records: HashMap<String, ExecutionRecord>) {
        let mut ledger = self.ledger.lock();
        for (key, record) in records {
            ledger.last_records.entry(key).or_insert(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;
    use std::thread;

    fn record(step_id: &str, step_type: StepType, ms: u64, success: bool) -> ExecutionRecord {
        let now = Utc::now();
        ExecutionRecord {
            step_id: step_id.to_string(),
            unit: None,
            step_type,
            attempt: 1,
            start_time: now,
            end_time: now,
            duration_ms: ms,
            success,
            error_detail: (!success).then(|| "boom".to_string()),
            output_reference: None,
        }
    }

    fn tracker_with(entries: &[(&str, StepType)]) -> ProgressTracker {
        let tracker = ProgressTracker::new();
        tracker.begin(
            entries
                .iter()
                .map(|(k, t)| (k.to_string(), *t, StepStatus::Pending)),
        );
        tracker
    }

    #[test]
    fn test_counts_follow_transitions() {
        let tracker = tracker_with(&[("a", StepType::Oxidation), ("b", StepType::Doping)]);
        assert_eq!(tracker.snapshot().pending_steps, 2);

        tracker.transition("a", StepStatus::Ready);
        tracker.transition("a", StepStatus::Running);
        let snap = tracker.snapshot();
        assert_eq!(snap.running_steps, 1);
        assert_eq!(snap.pending_steps, 1);

        tracker.record("a", record("a", StepType::Oxidation, 10, true), StepStatus::Completed);
        tracker.transition("b", StepStatus::Skipped);

        let snap = tracker.snapshot();
        assert_eq!(snap.completed_steps, 1);
        assert_eq!(snap.skipped_steps, 1);
        assert_eq!(snap.running_steps, 0);
        assert!(snap.is_finished());
        assert_eq!(snap.percent_complete(), 50.0);
    }

    #[test]
    fn test_unknown_key_ignored() {
        let tracker = tracker_with(&[("a", StepType::Cmp)]);
        tracker.transition("ghost", StepStatus::Running);
        assert_eq!(tracker.snapshot().running_steps, 0);
        assert_eq!(tracker.status("ghost"), None);
    }

    #[test]
    fn test_estimate_uses_type_mean() {
        let tracker = tracker_with(&[
            ("ox1", StepType::Oxidation),
            ("ox2", StepType::Oxidation),
            ("ox3", StepType::Oxidation),
        ]);
        tracker.record("ox1", record("ox1", StepType::Oxidation, 100, true), StepStatus::Completed);
        tracker.record("ox2", record("ox2", StepType::Oxidation, 300, true), StepStatus::Completed);

        let estimate = tracker.snapshot().estimated_remaining_time.unwrap();
        assert_eq!(estimate, Duration::from_millis(200));
    }

    #[test]
    fn test_estimate_falls_back_to_overall_mean() {
        let tracker = tracker_with(&[
            ("ox", StepType::Oxidation),
            ("dope", StepType::Doping),
            ("anneal", StepType::Annealing),
        ]);
        assert!(tracker.snapshot().estimated_remaining_time.is_none());

        tracker.record("ox", record("ox", StepType::Oxidation, 400, true), StepStatus::Completed);
        let estimate = tracker.snapshot().estimated_remaining_time.unwrap();
        assert_eq!(estimate, Duration::from_millis(800));
    }

    #[test]
    fn test_failed_records_do_not_feed_estimates() {
        let tracker = tracker_with(&[("a", StepType::Etching), ("b", StepType::Etching)]);
        tracker.record("a", record("a", StepType::Etching, 999, false), StepStatus::Failed);

        let snap = tracker.snapshot();
        assert_eq!(snap.failed_steps, 1);
        assert!(snap.estimated_remaining_time.is_none());
        assert_eq!(tracker.records().len(), 1);
        assert!(!tracker.last_records()["a"].success);
    }

    #[test]
    fn test_finish_freezes_elapsed() {
        let tracker = tracker_with(&[("a", StepType::Custom)]);
        thread::sleep(Duration::from_millis(5));
        tracker.finish();
        let first = tracker.snapshot().elapsed_time;
        thread::sleep(Duration::from_millis(5));
        assert_eq!(tracker.snapshot().elapsed_time, first);
        assert!(first >= Duration::from_millis(5));
    }

    #[test]
    fn test_begin_discards_previous_run() {
        let tracker = tracker_with(&[("a", StepType::Custom)]);
        tracker.record("a", record("a", StepType::Custom, 1, true), StepStatus::Completed);

        tracker.begin(vec![("b".to_string(), StepType::Custom, StepStatus::Completed)]);
        let snap = tracker.snapshot();
        assert_eq!(snap.total_steps, 1);
        assert_eq!(snap.completed_steps, 1);
        assert!(tracker.records().is_empty());
    }

    #[test]
    fn test_concurrent_records_are_consistent() {
        let keys: Vec<String> = (0..64).map(|i| format!("s{}", i)).collect();
        let tracker = Arc::new(ProgressTracker::new());
        tracker.begin(keys.iter().map(|k| (k.clone(), StepType::Deposition, StepStatus::Pending)));

        let handles: Vec<_> = keys
            .chunks(16)
            .map(|chunk| {
                let tracker = Arc::clone(&tracker);
                let chunk = chunk.to_vec();
                thread::spawn(move || {
                    for key in chunk {
                        tracker.transition(&key, StepStatus::Running);
                        let snap = tracker.snapshot();
                        assert_eq!(snap.terminal_steps() + snap.running_steps + snap.pending_steps, 64);
                        tracker.record(&key, record(&key, StepType::Deposition, 1, true), StepStatus::Completed);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let snap = tracker.snapshot();
        assert_eq!(snap.completed_steps, 64);
        assert_eq!(tracker.records().len(), 64);
    }
}
