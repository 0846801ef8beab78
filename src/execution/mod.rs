//! Execution Module
//!
//! Runs flows: engine lookup, the dispatcher, run control signals and the
//! records each invocation leaves behind.
//!
//! # Architecture
//!
//! - [`registry`]: step type to process engine bindings
//! - [`engine`]: mode-aware dispatcher with timeouts, retries and cancellation
//! - [`control`]: cancellation, pause and per-step interrupts
//! - [`record`]: execution records
//! - [`batch`]: ad-hoc operation queue

pub mod batch;
pub mod control;
pub mod engine;
pub mod record;
pub mod registry;

pub use batch::BatchQueue;
pub use control::{Interrupt, RunControl};
pub use engine::RunOutcome;
pub use record::{ExecutionRecord, CANCELLED_DETAIL, TIMEOUT_DETAIL};
pub use registry::{engine_fn, ProcessEngine, StepContext, StepOutcome, StepRegistry};
