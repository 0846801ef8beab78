//! Checkpoint Module
//!
//! Durable, resumable snapshots of a flow and its workpiece.
//!
//! - [`format`]: the versioned checkpoint document
//! - [`manager`]: atomic save, load and resume
//! - [`auto`]: timer-driven checkpointing during a run

pub mod auto;
pub mod format;
pub mod manager;

pub use auto::AutoCheckpointer;
pub use format::{Checkpoint, FlowState, FORMAT_VERSION};
pub use manager::CheckpointManager;
