//! Step Registry
//!
//! Maps a step type to the process engine that implements it. Engines are
//! external collaborators (oxidation kinetics, implant Monte Carlo, ...);
//! the orchestrator only calls them.
//!
//! Registration takes `&mut self` and happens before the registry is handed
//! to an [`Orchestrator`](crate::Orchestrator), which keeps it behind an
//! `Arc` for concurrent lookups.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::debug;

use crate::error::{OrchestratorError, Result};
use crate::flow::{Parameters, StepType};
use crate::workpiece::Workpiece;

use super::control::Interrupt;

/// Everything an engine sees of one invocation.
pub struct StepContext<'a> {
    pub step_id: &'a str,
    pub step_type: StepType,
    pub parameters: &'a Parameters,
    pub workpiece: &'a dyn Workpiece,
    /// Workpiece unit index in pipelined runs
    pub unit: Option<usize>,
    pub attempt: u32,
    interrupt: &'a Interrupt,
}

impl<'a> StepContext<'a> {
    pub fn new(
        step_id: &'a str,
        step_type: StepType,
        parameters: &'a Parameters,
        workpiece: &'a dyn Workpiece,
        interrupt: &'a Interrupt,
    ) -> Self {
        Self {
            step_id,
            step_type,
            parameters,
            workpiece,
            unit: None,
            attempt: 1,
            interrupt,
        }
    }

    /// True once the step has timed out or the flow was cancelled.
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_raised()
    }
}

impl fmt::Debug for StepContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepContext")
            .field("step_id", &self.step_id)
            .field("step_type", &self.step_type)
            .field("workpiece", &self.workpiece.label())
            .field("unit", &self.unit)
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// What an engine reports back.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StepOutcome {
    pub success: bool,
    pub output_reference: Option<String>,
    pub error_detail: Option<String>,
}

impl StepOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn with_output(output_reference: impl Into<String>) -> Self {
        Self {
            success: true,
            output_reference: Some(output_reference.into()),
            error_detail: None,
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            output_reference: None,
            error_detail: Some(detail.into()),
        }
    }
}

/// A pluggable physical-model implementation.
///
/// Called synchronously on a worker thread; the orchestrator supplies the
/// concurrency. Implementations must not keep the workpiece past the call.
pub trait ProcessEngine: Send + Sync {
    fn execute(&self, ctx: &StepContext<'_>) -> StepOutcome;
}

impl<F> ProcessEngine for F
where
    F: Fn(&StepContext<'_>) -> StepOutcome + Send + Sync,
{
    fn execute(&self, ctx: &StepContext<'_>) -> StepOutcome {
        self(ctx)
    }
}

/// Wraps a closure as a [`ProcessEngine`], pinning its signature so that
/// `|ctx| ...` closures infer the right argument type.
pub fn engine_fn<F>(f: F) -> F
where
    F: Fn(&StepContext<'_>) -> StepOutcome + Send + Sync,
{
    f
}

/// Lookup table from step type to engine.
#[derive(Clone, Default)]
pub struct StepRegistry {
    engines: HashMap<StepType, Arc<dyn ProcessEngine>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `step_type` to `engine`, replacing any previous binding.
    pub fn register<E>(&mut self, step_type: StepType, engine: E) -> &mut Self
    where
        E: ProcessEngine + 'static,
    {
        self.register_shared(step_type, Arc::new(engine))
    }

    /// Binds an already shared engine, e.g. one instance for several types.
    pub fn register_shared(&mut self, step_type: StepType, engine: Arc<dyn ProcessEngine>) -> &mut Self {
        if self.engines.insert(step_type, engine).is_some() {
            debug!("Replaced engine for step type '{}'", step_type);
        }
        self
    }

    /// Returns the engine bound to `step_type`.
    pub fn resolve(&self, step_type: StepType) -> Result<Arc<dyn ProcessEngine>> {
        self.engines
            .get(&step_type)
            .cloned()
            .ok_or(OrchestratorError::UnknownStepType(step_type))
    }

    pub fn contains(&self, step_type: StepType) -> bool {
        self.engines.contains_key(&step_type)
    }

    /// Registered step types, sorted.
    pub fn step_types(&self) -> Vec<StepType> {
        let mut types: Vec<_> = self.engines.keys().copied().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRegistry")
            .field("step_types", &self.step_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workpiece::NullWorkpiece;

    fn ok_engine(_: &StepContext<'_>) -> StepOutcome {
        StepOutcome::with_output("ok")
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = StepRegistry::new();
        registry.register(StepType::Oxidation, ok_engine);

        assert!(registry.contains(StepType::Oxidation));
        assert_eq!(registry.len(), 1);

        let engine = registry.resolve(StepType::Oxidation).unwrap();
        let params = Parameters::new();
        let interrupt = Interrupt::detached();
        let ctx = StepContext::new("ox", StepType::Oxidation, &params, &NullWorkpiece, &interrupt);
        let outcome = engine.execute(&ctx);
        assert!(outcome.success);
        assert_eq!(outcome.output_reference.as_deref(), Some("ok"));
    }

    #[test]
    fn test_resolve_unknown() {
        let registry = StepRegistry::new();
        match registry.resolve(StepType::Etching) {
            Err(OrchestratorError::UnknownStepType(t)) => assert_eq!(t, StepType::Etching),
            _ => panic!("expected UnknownStepType"),
        }
    }

    #[test]
    fn test_shared_engine_for_several_types() {
        let engine: Arc<dyn ProcessEngine> = Arc::new(ok_engine);
        let mut registry = StepRegistry::new();
        registry
            .register_shared(StepType::Deposition, Arc::clone(&engine))
            .register_shared(StepType::Metallization, engine);

        assert_eq!(
            registry.step_types(),
            vec![StepType::Deposition, StepType::Metallization]
        );
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = StepRegistry::new();
        registry.register(StepType::Cmp, ok_engine);
        registry.register(StepType::Cmp, engine_fn(|_| StepOutcome::failure("worn pad")));

        let engine = registry.resolve(StepType::Cmp).unwrap();
        let params = Parameters::new();
        let interrupt = Interrupt::detached();
        let ctx = StepContext::new("cmp", StepType::Cmp, &params, &NullWorkpiece, &interrupt);
        assert_eq!(engine.execute(&ctx).error_detail.as_deref(), Some("worn pad"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_context_interrupt() {
        let params = Parameters::new();
        let interrupt = Interrupt::detached();
        let ctx = StepContext::new("x", StepType::Custom, &params, &NullWorkpiece, &interrupt);
        assert!(!ctx.is_interrupted());
        interrupt.raise();
        assert!(ctx.is_interrupted());
    }
}
