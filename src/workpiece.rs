//! Workpiece Interface
//!
//! The workpiece (e.g. a wafer) is owned by an external collaborator. The
//! orchestrator hands a shared handle to each step's engine and asks for an
//! opaque snapshot when checkpointing; it never interprets the state itself.

use std::any::Any;
use std::sync::Arc;

/// Shared, externally synchronised simulation subject.
///
/// Implementations provide their own interior mutability; the orchestrator
/// guarantees conflicting steps are never run concurrently, as declared in
/// the flow.
pub trait Workpiece: Send + Sync {
    /// Short label used in logs.
    fn label(&self) -> &str;

    /// Serialises the current state into an opaque blob.
    fn snapshot(&self) -> Result<Vec<u8>, String>;

    /// Access to the concrete type for engines that know it.
    fn as_any(&self) -> &dyn Any;
}

/// Handle passed to engines and kept by the orchestrator for checkpoints.
pub type WorkpieceHandle = Arc<dyn Workpiece>;

/// Rebuilds a workpiece from a snapshot blob.
pub trait WorkpieceRestore {
    fn restore(&self, blob: &[u8]) -> Result<WorkpieceHandle, String>;
}

impl<F> WorkpieceRestore for F
where
    F: Fn(&[u8]) -> Result<WorkpieceHandle, String>,
{
    fn restore(&self, blob: &[u8]) -> Result<WorkpieceHandle, String> {
        self(blob)
    }
}

/// Placeholder subject for runs that do not touch a workpiece, such as
/// ad-hoc batch operations. Its snapshot is empty.
#[derive(Debug, Default)]
pub struct NullWorkpiece;

impl Workpiece for NullWorkpiece {
    fn label(&self) -> &str {
        "none"
    }

    fn snapshot(&self) -> Result<Vec<u8>, String> {
        Ok(Vec::new())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
