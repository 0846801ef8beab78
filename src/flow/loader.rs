//! Flow File Loader
//!
//! Reads and writes flow definitions as YAML documents:
//!
//! ```yaml
//! name: nmos-front-end
//! mode: parallel
//! settings:
//!   workers: 4
//!   continue_on_error: true
//! steps:
//!   - id: field_oxide
//!     type: oxidation
//!     parameters: { temperature: 1100, time: 90, ambient: wet }
//!     workpiece: wafer
//! ```
//!
//! Loading always goes through [`Flow::build`], so a file that loads is a
//! valid flow.

use std::fs;
use std::path::Path;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::config::FlowSettings;
use crate::error::{OrchestratorError, Result};

use super::graph::Flow;
use super::model::{ExecutionMode, ProcessStep};

/// On-disk shape of a flow file.
#[derive(Serialize, Deserialize, Debug)]
struct FlowDocument {
    name: String,
    #[serde(default)]
    mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "FlowSettings::is_empty")]
    settings: FlowSettings,
    #[serde(default)]
    steps: Vec<ProcessStep>,
}

/// A loaded flow together with the settings declared next to it.
#[derive(Debug, Clone)]
pub struct FlowFile {
    pub flow: Flow,
    pub settings: FlowSettings,
}

/// Loads a flow from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use fabrunner::flow::load_flow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let file = load_flow("cmos.yaml")?;
///     println!("Loaded {} steps", file.flow.len());
///     Ok(())
/// }
/// ```
pub fn load_flow(path: impl AsRef<Path>) -> Result<FlowFile> {
    let path = path.as_ref();
    info!("Loading flow from: {}", path.display());

    let yaml = fs::read_to_string(path).map_err(|e| {
        OrchestratorError::FlowFile(format!("failed to read '{}': {}", path.display(), e))
    })?;
    debug!("YAML content loaded ({} bytes)", yaml.len());

    parse_flow(&yaml)
}

/// Parses a flow document from YAML text.
pub fn parse_flow(yaml: &str) -> Result<FlowFile> {
    let document: FlowDocument = serde_yaml::from_str(yaml)
        .map_err(|e| OrchestratorError::FlowFile(format!("failed to parse flow YAML: {}", e)))?;

    info!(
        "Parsed flow '{}': {} steps, {:?} mode",
        document.name,
        document.steps.len(),
        document.mode
    );

    let flow = Flow::build(document.name, document.mode, document.steps)?;
    Ok(FlowFile {
        flow,
        settings: document.settings,
    })
}

/// Writes a flow (with its current step statuses) back to YAML.
pub fn save_flow(flow: &Flow, settings: &FlowSettings, path: impl AsRef<Path>) -> Result<()> {
    let document = FlowDocument {
        name: flow.name().to_string(),
        mode: flow.execution_mode(),
        settings: settings.clone(),
        steps: flow.steps().to_vec(),
    };
    let yaml = serde_yaml::to_string(&document)?;
    fs::write(path.as_ref(), yaml)?;
    info!("Saved flow '{}' to {}", flow.name(), path.as_ref().display());
    Ok(())
}
