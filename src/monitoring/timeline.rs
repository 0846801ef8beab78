//! Execution Timeline
//!
//! Derives per-step timing and an ASCII Gantt chart from the execution
//! records of a run.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::execution::ExecutionRecord;

/// Chart width in characters.
const CHART_WIDTH: f64 = 50.0;

/// One bar of the chart.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    /// Step id, suffixed with `#unit` in pipelined runs
    pub label: String,
    pub attempt: u32,
    /// Milliseconds from the first start in the run
    pub offset_ms: i64,
    pub duration_ms: u64,
    pub success: bool,
}

/// Timing view of a finished (or running) flow.
#[derive(Debug, Clone, Default)]
pub struct ExecutionTimeline {
    entries: Vec<TimelineEntry>,
}

impl ExecutionTimeline {
    /// Builds the timeline from records, ordered by start time.
    pub fn from_records(records: &[ExecutionRecord]) -> Self {
        let Some(origin) = records.iter().map(|r| r.start_time).min() else {
            return Self::default();
        };

        let mut sorted: Vec<&ExecutionRecord> = records.iter().collect();
        sorted.sort_by_key(|r| r.start_time);

        let entries = sorted
            .into_iter()
            .map(|r| TimelineEntry {
                label: match r.unit {
                    Some(unit) => format!("{}#{}", r.step_id, unit),
                    None => r.step_id.clone(),
                },
                attempt: r.attempt,
                offset_ms: millis_between(origin, r.start_time),
                duration_ms: r.duration_ms,
                success: r.success,
            })
            .collect();

        Self { entries }
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wall-clock span from the first start to the last end, in ms.
    pub fn total_ms(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| e.offset_ms.max(0) as u64 + e.duration_ms)
            .max()
            .unwrap_or(0)
    }

    /// Accumulated invocation time per label, in milliseconds.
    pub fn durations(&self) -> HashMap<String, u64> {
        let mut durations = HashMap::new();
        for entry in &self.entries {
            *durations.entry(entry.label.clone()).or_insert(0) += entry.duration_ms;
        }
        durations
    }

    /// Generates an ASCII Gantt chart representation.
    ///
    /// Successful attempts are drawn with `#`, failed ones with `x`.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total = self.total_ms();
        if total == 0 {
            return output;
        }
        let scale = CHART_WIDTH / total as f64;

        for entry in &self.entries {
            let start_pos = (entry.offset_ms.max(0) as f64 * scale) as usize;
            let width = (entry.duration_ms as f64 * scale).max(1.0) as usize;
            let mark = if entry.success { "#" } else { "x" };

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&mark.repeat(width));

            let label = if entry.attempt > 1 {
                format!("{} ({})", entry.label, entry.attempt)
            } else {
                entry.label.clone()
            };
            output.push_str(&format!(
                "{} |{:<width$}| ({} ms)\n",
                truncate(&label, 16),
                bar,
                entry.duration_ms,
                width = CHART_WIDTH as usize + 1
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total));
        output
    }
}

fn millis_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_milliseconds()
}

/// Pads or truncates a label to a fixed width.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
