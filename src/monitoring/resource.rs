//! Resource Usage Monitoring
//!
//! Tracks CPU and memory usage of the orchestrator process while a flow
//! runs. Engines execute in-process, so this covers the simulation itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde::Serialize;
use sysinfo::{get_current_pid, Pid, ProcessRefreshKind, System};

use crate::error::{OrchestratorError, Result};

/// Interval between samples taken by [`ResourceSampler`].
pub const MONITOR_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// A single resource usage sample.
#[derive(Debug, Clone)]
pub struct ResourceSample {
    pub timestamp: Instant,
    /// CPU usage percentage (0-100 per core)
    pub cpu_usage: f32,
    pub memory_mb: u64,
}

/// Aggregate of the samples of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSummary {
    pub average_cpu: f32,
    pub peak_cpu: f32,
    pub peak_memory_mb: u64,
    pub samples: usize,
}

/// Monitors system resource usage for the current process.
pub struct ResourceMonitor {
    system: System,
    process_id: Pid,
    samples: Vec<ResourceSample>,
    warmup_done: bool,
    last_sample: Option<Instant>,
    min_interval: Duration,
}

impl ResourceMonitor {
    /// Creates a new resource monitor for the current process.
    pub fn new() -> Result<Self> {
        let process_id = get_current_pid()
            .map_err(|e| OrchestratorError::Monitor(format!("cannot resolve own process id: {}", e)))?;
        Ok(Self {
            system: System::new(),
            process_id,
            samples: Vec::new(),
            warmup_done: false,
            last_sample: None,
            min_interval: Duration::from_millis(250),
        })
    }

    /// Sets the minimum interval between samples.
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Takes a resource usage sample.
    ///
    /// The first call only primes CPU accounting. Later calls are
    /// rate-limited by `min_interval`.
    pub fn sample(&mut self) {
        let now = Instant::now();
        let refresh_kind = ProcessRefreshKind::new().with_cpu().with_memory();

        if !self.warmup_done {
            self.system.refresh_processes_specifics(refresh_kind);
            self.warmup_done = true;
            self.last_sample = Some(now);
            return;
        }

        if let Some(last) = self.last_sample {
            if now.duration_since(last) < self.min_interval {
                return;
            }
        }

        self.system.refresh_processes_specifics(refresh_kind);
        self.last_sample = Some(now);

        if let Some(process) = self.system.process(self.process_id) {
            self.samples.push(ResourceSample {
                timestamp: now,
                cpu_usage: process.cpu_usage(),
                memory_mb: process.memory() / (1024 * 1024),
            });
        }
    }

    pub fn samples(&self) -> &[ResourceSample] {
        &self.samples
    }

    /// Aggregates the samples; `None` before the first real sample.
    pub fn summary(&self) -> Option<ResourceSummary> {
        if self.samples.is_empty() {
            return None;
        }
        let count = self.samples.len();
        Some(ResourceSummary {
            average_cpu: self.samples.iter().map(|s| s.cpu_usage).sum::<f32>() / count as f32,
            peak_cpu: self.samples.iter().map(|s| s.cpu_usage).fold(0.0, f32::max),
            peak_memory_mb: self.samples.iter().map(|s| s.memory_mb).max().unwrap_or(0),
            samples: count,
        })
    }
}

/// Background thread feeding a [`ResourceMonitor`] for the length of a run.
pub struct ResourceSampler {
    running: Arc<AtomicBool>,
    handle: JoinHandle<ResourceMonitor>,
}

impl ResourceSampler {
    pub fn start(interval: Duration) -> Result<Self> {
        let mut monitor = ResourceMonitor::new()?.with_min_interval(interval / 2);
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name("resource-monitor".to_string())
            .spawn(move || {
                while flag.load(Ordering::Relaxed) {
                    monitor.sample();
                    thread::sleep(interval);
                }
                monitor
            })?;

        debug!("Resource monitor started ({:?} interval)", interval);
        Ok(Self { running, handle })
    }

    /// Stops sampling and returns what was collected.
    pub fn stop(self) -> Option<ResourceSummary> {
        self.running.store(false, Ordering::Relaxed);
        match self.handle.join() {
            Ok(monitor) => monitor.summary(),
            Err(_) => {
                warn!("Resource monitor thread panicked");
                None
            }
        }
    }
}

impl ResourceSummary {
    /// Human-readable multi-line summary.
    pub fn render(&self) -> String {
        format!(
            "Resource Usage:\n  Average CPU: {:.1}%\n  Peak CPU: {:.1}%\n  Peak Memory: {} MB\n  Samples: {}",
            self.average_cpu, self.peak_cpu, self.peak_memory_mb, self.samples
        )
    }
}
