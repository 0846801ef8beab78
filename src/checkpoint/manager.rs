//! Checkpoint Manager
//!
//! Atomic persistence of [`Checkpoint`] documents and reconstruction of a
//! runnable [`Flow`] from one.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::error::{OrchestratorError, Result};
use crate::flow::{Flow, StepStatus};

use super::format::{Checkpoint, FlowState, FORMAT_VERSION};

/// The only writer of persisted orchestrator state.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckpointManager;

impl CheckpointManager {
    /// Snapshots `flow` together with a workpiece blob and writes it to
    /// `path`.
    pub fn save(flow: &Flow, workpiece_snapshot: Vec<u8>, path: impl AsRef<Path>) -> Result<Checkpoint> {
        let checkpoint = Checkpoint::new(FlowState::capture(flow), workpiece_snapshot);
        Self::write(&checkpoint, path)?;
        Ok(checkpoint)
    }

    /// Writes `checkpoint` atomically.
    ///
    /// The document goes to `<path>.tmp` in the same directory, is synced,
    /// and then renamed over `path`, so readers see either the previous
    /// checkpoint or the new one in full.
    pub fn write(checkpoint: &Checkpoint, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_vec_pretty(checkpoint)?;
        let tmp = temp_path(path);

        let written = File::create(&tmp).and_then(|mut file| {
            file.write_all(&json)?;
            file.sync_all()
        });
        if let Err(e) = written.and_then(|_| fs::rename(&tmp, path)) {
            if let Err(cleanup) = fs::remove_file(&tmp) {
                debug!("Could not remove {}: {}", tmp.display(), cleanup);
            }
            return Err(e.into());
        }

        info!(
            "Saved checkpoint of '{}' to {} ({} steps, {} byte snapshot)",
            checkpoint.flow_state.name,
            path.display(),
            checkpoint.flow_state.steps.len(),
            checkpoint.workpiece_snapshot.len()
        );
        Ok(())
    }

    /// Reads a checkpoint.
    ///
    /// # Returns
    ///
    /// * `Err(CheckpointNotFound)` - Nothing exists at `path`
    /// * `Err(CorruptCheckpoint)` - The document does not parse or has a
    ///   different format version
    pub fn load(path: impl AsRef<Path>) -> Result<Checkpoint> {
        let path = path.as_ref();
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(OrchestratorError::CheckpointNotFound(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };

        let corrupt = |reason: String| OrchestratorError::CorruptCheckpoint {
            path: path.to_path_buf(),
            reason,
        };

        let document: serde_json::Value =
            serde_json::from_str(&content).map_err(|e| corrupt(e.to_string()))?;
        match document.get("format_version").and_then(|v| v.as_u64()) {
            Some(version) if version == u64::from(FORMAT_VERSION) => {}
            Some(version) => {
                return Err(corrupt(format!(
                    "unsupported format version {} (expected {})",
                    version, FORMAT_VERSION
                )))
            }
            None => return Err(corrupt("missing format_version".to_string())),
        }

        let checkpoint: Checkpoint =
            serde_json::from_value(document).map_err(|e| corrupt(e.to_string()))?;
        info!(
            "Loaded checkpoint of '{}' from {} (taken {})",
            checkpoint.flow_state.name,
            path.display(),
            checkpoint.timestamp.to_rfc3339()
        );
        Ok(checkpoint)
    }

    /// Rebuilds a flow from `checkpoint`.
    ///
    /// Completed steps stay completed and are not run again. Every other
    /// status, including Running steps interrupted mid-execution, goes back
    /// to Pending. Last records are carried forward.
    pub fn resume(checkpoint: &Checkpoint) -> Result<Flow> {
        let state = &checkpoint.flow_state;
        let mut steps = state.steps.clone();
        let mut reset = 0;
        for step in &mut steps {
            if step.status != StepStatus::Completed {
                if step.status != StepStatus::Pending {
                    reset += 1;
                }
                step.status = StepStatus::Pending;
            }
        }

        let mut flow = Flow::build(state.name.clone(), state.execution_mode, steps)?;
        flow.set_last_records(
            state
                .last_records
                .iter()
                .map(|(id, record)| (id.clone(), record.clone()))
                .collect(),
        );

        let completed = flow
            .steps()
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        if reset > 0 {
            warn!("Reset {} interrupted or failed step(s) to Pending", reset);
        }
        info!(
            "Resuming '{}': {}/{} steps already completed",
            flow.name(),
            completed,
            flow.len()
        );
        Ok(flow)
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}
