//! Monitoring Module
//!
//! Run statistics and reporting.
//!
//! # Components
//!
//! - [`ProgressTracker`]: step counts, timing and remaining-time estimates
//! - [`ExecutionTimeline`]: per-step timing and Gantt charts from records
//! - [`ResourceMonitor`]: CPU and memory usage tracking

pub mod progress;
pub mod resource;
pub mod timeline;

pub use progress::{ProgressTracker, SimulationProgress};
pub use resource::{ResourceMonitor, ResourceSample, ResourceSampler, ResourceSummary, MONITOR_SAMPLE_INTERVAL};
pub use timeline::{ExecutionTimeline, TimelineEntry};
