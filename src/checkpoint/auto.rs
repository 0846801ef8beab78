//! Timed Checkpointing
//!
//! A dedicated thread that captures and writes a checkpoint on a fixed
//! wall-clock interval, plus once more when stopped. Captures read the
//! progress tracker, never the dispatcher, so workers are not blocked.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::Result;

use super::format::Checkpoint;
use super::manager::CheckpointManager;

/// Granularity at which the timer notices a stop request.
const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Running checkpoint timer.
pub struct AutoCheckpointer {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<usize>,
}

impl AutoCheckpointer {
    /// Starts the timer.
    ///
    /// # Arguments
    ///
    /// * `interval` - Time between saves
    /// * `path` - Checkpoint file, overwritten atomically on every save
    /// * `capture` - Builds the checkpoint to write
    pub fn start<F>(interval: Duration, path: PathBuf, capture: F) -> Result<Self>
    where
        F: Fn() -> Result<Checkpoint> + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("auto-checkpoint".to_string())
            .spawn(move || {
                let mut saves = 0;
                let mut next = Instant::now() + interval;
                loop {
                    let stopping = flag.load(Ordering::SeqCst);
                    if stopping || Instant::now() >= next {
                        match capture().and_then(|checkpoint| CheckpointManager::write(&checkpoint, &path)) {
                            Ok(()) => saves += 1,
                            Err(e) => warn!("Automatic checkpoint to {} failed: {}", path.display(), e),
                        }
                        if stopping {
                            break;
                        }
                        next = Instant::now() + interval;
                    }
                    let remaining = next.saturating_duration_since(Instant::now());
                    thread::sleep(remaining.min(STOP_CHECK_INTERVAL));
                }
                saves
            })?;

        info!("Automatic checkpoints every {:?}", interval);
        Ok(Self { stop, handle })
    }

    /// Writes a final checkpoint and stops the timer.
    ///
    /// # Returns
    ///
    /// Number of checkpoints written, including the final one.
    pub fn stop(self) -> usize {
        self.stop.store(true, Ordering::SeqCst);
        match self.handle.join() {
            Ok(saves) => {
                debug!("Checkpoint timer stopped after {} save(s)", saves);
                saves
            }
            Err(_) => {
                warn!("Checkpoint timer thread panicked");
                0
            }
        }
    }
}
