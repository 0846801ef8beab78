//! Run Control Signals
//!
//! Flow-scoped cancellation and pause flags shared between callers and the
//! dispatcher, plus the per-step interrupt handed to engines.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cancellation and pause flags for the current run.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    cancel: Arc<AtomicBool>,
    pause: Arc<AtomicBool>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of the whole flow.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Stops dispatching new steps; running steps finish.
    pub fn pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.pause.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }

    /// Clears both flags ahead of a new run.
    pub fn reset(&self) {
        self.cancel.store(false, Ordering::SeqCst);
        self.pause.store(false, Ordering::SeqCst);
    }

    /// Creates an interrupt for one step invocation, tied to this run.
    pub fn interrupt(&self) -> Interrupt {
        Interrupt {
            step: Arc::new(AtomicBool::new(false)),
            flow: Arc::clone(&self.cancel),
        }
    }
}

/// Best-effort stop request observed by engines.
///
/// Set when the step times out or the flow is cancelled. Engines that poll
/// it can return early; their result is discarded either way.
#[derive(Debug, Clone)]
pub struct Interrupt {
    step: Arc<AtomicBool>,
    flow: Arc<AtomicBool>,
}

impl Interrupt {
    /// An interrupt that is never raised by a run.
    pub fn detached() -> Self {
        Self {
            step: Arc::new(AtomicBool::new(false)),
            flow: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn raise(&self) {
        self.step.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.step.load(Ordering::SeqCst) || self.flow.load(Ordering::SeqCst)
    }
}
