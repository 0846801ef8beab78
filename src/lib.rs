//! FabRunner - Process Flow Orchestrator
//!
//! Coordinates multi-step fabrication simulations: an ordered graph of
//! process steps (oxidation, doping, lithography, ...) is run against a
//! workpiece by pluggable physical-model engines, sequentially or in
//! parallel, with progress tracking and resumable checkpoints.
//!
//! # Architecture
//!
//! - [`flow`]: Step definitions, the validated dependency graph, flow files
//! - [`execution`]: Engine registry, the mode-aware dispatcher, batch queue
//! - [`monitoring`]: Progress statistics, timeline and resource sampling
//! - [`checkpoint`]: Durable snapshots and resume
//! - [`orchestrator`]: The entry point callers hold
//!
//! # Example
//!
//! ```rust,no_run
//! use fabrunner::sim::{self, Wafer};
//! use fabrunner::{load_flow, Orchestrator, OrchestratorConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a flow from YAML
//!     let mut file = load_flow("flows/nmos_front_end.yaml")?;
//!
//!     let mut config = OrchestratorConfig::default();
//!     config.set_worker_limit(4).apply(&file.settings);
//!
//!     // Run it against a simulated wafer
//!     let orchestrator = Orchestrator::new(sim::registry(), config);
//!     let report = orchestrator.run(&mut file.flow, Wafer::handle("W01"))?;
//!     println!("{}", report.timeline().gantt_chart());
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod execution;
pub mod flow;
pub mod monitoring;
pub mod orchestrator;
pub mod sim;
pub mod workpiece;

// Re-export commonly used types
pub use checkpoint::{Checkpoint, CheckpointManager};
pub use config::{FlowSettings, OrchestratorConfig};
pub use error::{OrchestratorError, Result};
pub use execution::{
    engine_fn, BatchQueue, ExecutionRecord, ProcessEngine, RunOutcome, StepContext, StepOutcome,
    StepRegistry,
};
pub use flow::{
    load_flow, ExecutionMode, Flow, FlowBuilder, ProcessStep, StepStatus, StepType,
};
pub use monitoring::SimulationProgress;
pub use orchestrator::{Orchestrator, RunReport};
pub use workpiece::{Workpiece, WorkpieceHandle, WorkpieceRestore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "FabRunner";
