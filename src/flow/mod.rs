//! Process Flow Module
//!
//! Data structures and utilities for defining, validating and loading
//! process flows.
//!
//! # Structure
//!
//! - [`model`]: Step definitions, step types and statuses
//! - [`graph`]: Validated dependency graph and scheduling queries
//! - [`loader`]: YAML flow files

pub mod graph;
pub mod loader;
pub mod model;

pub use graph::{Flow, FlowBuilder, TopologicalOrder};
pub use loader::{load_flow, parse_flow, save_flow, FlowFile};
pub use model::{
    ExecutionMode, ParameterValue, Parameters, ProcessStep, StepStatus, StepType, WorkpieceAccess,
};
