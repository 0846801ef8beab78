//! Flow Graph
//!
//! Validates a set of process steps into an acyclic [`Flow`] and answers the
//! scheduling questions the execution engine asks of it:
//! - topological order (stable, insertion-order tie-breaks)
//! - ready set for a given set of completed steps
//! - stages (rank in the dependency graph) for pipelined replay
//!
//! Workpiece conflicts are folded into the graph at build time as implicit
//! edges, so the engine only ever reasons about dependencies. Steps that do
//! not name a workpiece share the run's workpiece; steps marked
//! [`WorkpieceAccess::Independent`] never conflict.

use std::collections::{BTreeSet, HashMap, HashSet};

use log::{debug, info};
use once_cell::sync::OnceCell;

use crate::error::{OrchestratorError, Result};
use crate::execution::ExecutionRecord;

use super::model::{ExecutionMode, ProcessStep, StepStatus, WorkpieceAccess};

/// A validated, acyclic graph of process steps plus its execution mode.
#[derive(Debug, Clone)]
pub struct Flow {
    name: String,
    mode: ExecutionMode,
    steps: Vec<ProcessStep>,
    index: HashMap<String, usize>,
    /// Declared plus implicit dependencies, as step indices
    deps: Vec<Vec<usize>>,
    /// Steps declaring a dependency on each step
    dependents: Vec<Vec<usize>>,
    /// Ordering-only edges from workpiece conflicts
    implicit: Vec<Vec<usize>>,
    order: Vec<usize>,
    stages: OnceCell<Vec<usize>>,
    last_records: HashMap<String, ExecutionRecord>,
}

/// Fluent construction of a [`Flow`].
///
/// # Example
///
/// ```
/// use fabrunner::flow::{ExecutionMode, FlowBuilder, ProcessStep, StepType};
///
/// let flow = FlowBuilder::new("twin-well")
///     .mode(ExecutionMode::Parallel)
///     .step(ProcessStep::new("ox", StepType::Oxidation))
///     .step(ProcessStep::new("implant", StepType::Doping).depends_on("ox"))
///     .build()
///     .unwrap();
///
/// assert_eq!(flow.len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct FlowBuilder {
    name: String,
    mode: ExecutionMode,
    steps: Vec<ProcessStep>,
}

impl FlowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: ExecutionMode::default(),
            steps: Vec::new(),
        }
    }

    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn step(mut self, step: ProcessStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(mut self, steps: impl IntoIterator<Item = ProcessStep>) -> Self {
        self.steps.extend(steps);
        self
    }

    pub fn build(self) -> Result<Flow> {
        Flow::build(self.name, self.mode, self.steps)
    }
}

impl Flow {
    /// Starts a [`FlowBuilder`].
    pub fn builder(name: impl Into<String>) -> FlowBuilder {
        FlowBuilder::new(name)
    }

    /// Validates `steps` and returns the flow.
    ///
    /// Performs the following checks:
    /// 1. No empty or duplicate step IDs
    /// 2. Every dependency names a step in the same flow
    /// 3. The dependency graph is acyclic
    ///
    /// Step statuses are kept as given, which is how a resumed flow carries
    /// its completed steps forward.
    pub fn build(
        name: impl Into<String>,
        mode: ExecutionMode,
        mut steps: Vec<ProcessStep>,
    ) -> Result<Flow> {
        let name = name.into();
        info!("Validating flow '{}' with {} steps", name, steps.len());

        let mut index = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter_mut().enumerate() {
            step.id = step.id.trim().to_string();
            if step.id.is_empty() {
                return Err(OrchestratorError::EmptyStepId);
            }
            if step.name.trim().is_empty() {
                step.name = step.id.clone();
            }
            if index.insert(step.id.clone(), i).is_some() {
                return Err(OrchestratorError::DuplicateStepId(step.id.clone()));
            }
        }

        let mut deps: Vec<Vec<usize>> = Vec::with_capacity(steps.len());
        for step in &mut steps {
            let mut seen = HashSet::new();
            step.dependencies.retain(|d| seen.insert(d.clone()));

            let mut resolved = Vec::with_capacity(step.dependencies.len());
            for dep in &step.dependencies {
                let target = index.get(dep).copied().ok_or_else(|| {
                    OrchestratorError::UnresolvedDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                resolved.push(target);
            }
            deps.push(resolved);
        }

        let explicit_order = topological_sort(&steps, &deps)?;

        let mut dependents = vec![Vec::new(); steps.len()];
        for (i, ds) in deps.iter().enumerate() {
            for &d in ds {
                dependents[d].push(i);
            }
        }

        let implicit = if mode == ExecutionMode::Batch {
            vec![Vec::new(); steps.len()]
        } else {
            workpiece_conflicts(&steps, &explicit_order)
        };

        for (i, extra) in implicit.iter().enumerate() {
            for &e in extra {
                if !deps[i].contains(&e) {
                    deps[i].push(e);
                }
            }
        }

        // Implicit edges only point forward in the explicit order, so this
        // cannot fail; it re-applies the insertion-order tie-break.
        let order = topological_sort(&steps, &deps)?;

        debug!(
            "Topological order: {:?}",
            order.iter().map(|&i| &steps[i].id).collect::<Vec<_>>()
        );

        Ok(Flow {
            name,
            mode,
            steps,
            index,
            deps,
            dependents,
            implicit,
            order,
            stages: OnceCell::new(),
            last_records: HashMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Returns the number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the flow has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// All steps in insertion order.
    pub fn steps(&self) -> &[ProcessStep] {
        &self.steps
    }

    /// Gets a step by ID.
    pub fn step(&self, id: &str) -> Option<&ProcessStep> {
        self.index.get(id).map(|&i| &self.steps[i])
    }

    pub fn status(&self, id: &str) -> Option<StepStatus> {
        self.step(id).map(|s| s.status)
    }

    /// Step id to status mapping.
    pub fn statuses(&self) -> HashMap<String, StepStatus> {
        self.steps.iter().map(|s| (s.id.clone(), s.status)).collect()
    }

    /// Effective dependencies of a step (declared plus implicit).
    pub fn dependencies_of(&self, id: &str) -> Vec<&str> {
        self.index
            .get(id)
            .map(|&i| self.deps[i].iter().map(|&d| self.steps[d].id.as_str()).collect())
            .unwrap_or_default()
    }

    /// Dependencies added by workpiece conflict folding.
    pub fn implicit_dependencies_of(&self, id: &str) -> Vec<&str> {
        self.index
            .get(id)
            .map(|&i| {
                self.implicit[i]
                    .iter()
                    .map(|&d| self.steps[d].id.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Step IDs in dependency order.
    ///
    /// The sequence is computed once at build time; each call starts a fresh
    /// iteration over it.
    pub fn topological_order(&self) -> TopologicalOrder<'_> {
        TopologicalOrder {
            flow: self,
            position: 0,
        }
    }

    /// Steps whose dependencies are all in `completed_ids` and whose own
    /// status is Pending, in topological order.
    ///
    /// A workpiece conflict edge only orders the two steps, so it is also
    /// satisfied once the earlier step has finished in any way.
    pub fn ready_set(&self, completed_ids: &HashSet<String>) -> Vec<&ProcessStep> {
        self.order
            .iter()
            .filter(|&&i| self.steps[i].status == StepStatus::Pending)
            .filter(|&&i| {
                self.deps[i].iter().all(|&d| {
                    completed_ids.contains(&self.steps[d].id)
                        || (self.implicit[i].contains(&d) && self.steps[d].status.is_terminal())
                })
            })
            .map(|&i| &self.steps[i])
            .collect()
    }

    /// Steps grouped by rank: a step's stage is one more than the highest
    /// stage among its dependencies, roots are stage 0.
    pub fn stages(&self) -> Vec<Vec<&str>> {
        let ranks = self.ranks();
        let depth = ranks.iter().copied().max().map_or(0, |m| m + 1);
        let mut stages = vec![Vec::new(); depth];
        for &i in &self.order {
            stages[ranks[i]].push(self.steps[i].id.as_str());
        }
        stages
    }

    /// Forgets all progress: every step back to Pending.
    pub fn reset(&mut self) {
        for step in &mut self.steps {
            step.status = StepStatus::Pending;
        }
        self.last_records.clear();
    }

    /// Last execution record per step.
    pub fn last_records(&self) -> &HashMap<String, ExecutionRecord> {
        &self.last_records
    }

    pub fn last_record(&self, id: &str) -> Option<&ExecutionRecord> {
        self.last_records.get(id)
    }

    /// Returns true when every step is Completed.
    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Completed)
    }

    // Index-based accessors for the execution engine.

    pub(crate) fn order_indices(&self) -> &[usize] {
        &self.order
    }

    pub(crate) fn deps_at(&self, i: usize) -> &[usize] {
        &self.deps[i]
    }

    /// Steps that declared a dependency on step `i`; conflict edges excluded.
    pub(crate) fn dependents_at(&self, i: usize) -> &[usize] {
        &self.dependents[i]
    }

    pub(crate) fn implicit_at(&self, i: usize) -> &[usize] {
        &self.implicit[i]
    }

    pub(crate) fn step_at(&self, i: usize) -> &ProcessStep {
        &self.steps[i]
    }

    pub(crate) fn status_at(&self, i: usize) -> StepStatus {
        self.steps[i].status
    }

    pub(crate) fn set_status_at(&mut self, i: usize, status: StepStatus) {
        self.steps[i].status = status;
    }

    pub(crate) fn rank_at(&self, i: usize) -> usize {
        self.ranks()[i]
    }

    pub(crate) fn set_last_record(&mut self, record: ExecutionRecord) {
        self.last_records.insert(record.step_id.clone(), record);
    }

    pub(crate) fn set_last_records(&mut self, records: HashMap<String, ExecutionRecord>) {
        self.last_records = records;
    }

    fn ranks(&self) -> &[usize] {
        self.stages.get_or_init(|| {
            let mut ranks = vec![0; self.steps.len()];
            for &i in &self.order {
                ranks[i] = self.deps[i].iter().map(|&d| ranks[d] + 1).max().unwrap_or(0);
            }
            ranks
        })
    }
}

/// Iterator over step IDs in topological order.
#[derive(Debug, Clone)]
pub struct TopologicalOrder<'a> {
    flow: &'a Flow,
    position: usize,
}

impl<'a> Iterator for TopologicalOrder<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        let i = *self.flow.order.get(self.position)?;
        self.position += 1;
        Some(self.flow.steps[i].id.as_str())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.flow.order.len() - self.position;
        (left, Some(left))
    }
}

impl ExactSizeIterator for TopologicalOrder<'_> {}

/// Kahn's algorithm; among simultaneously ready steps the earliest inserted
/// goes first.
fn topological_sort(steps: &[ProcessStep], deps: &[Vec<usize>]) -> Result<Vec<usize>> {
    let mut in_degree: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut successors = vec![Vec::new(); steps.len()];
    for (i, ds) in deps.iter().enumerate() {
        for &d in ds {
            successors[d].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..steps.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut sorted = Vec::with_capacity(steps.len());

    while let Some(current) = ready.pop_first() {
        sorted.push(current);
        for &next in &successors[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if sorted.len() != steps.len() {
        let remaining: HashSet<usize> = (0..steps.len()).filter(|&i| in_degree[i] > 0).collect();
        return Err(OrchestratorError::CyclicDependency(find_cycle(steps, deps, &remaining)));
    }

    Ok(sorted)
}

/// Walks dependency edges inside the unsorted remainder until a step repeats.
fn find_cycle(steps: &[ProcessStep], deps: &[Vec<usize>], remaining: &HashSet<usize>) -> Vec<String> {
    let Some(&start) = remaining.iter().min() else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut position: HashMap<usize, usize> = HashMap::from([(start, 0)]);
    let mut current = start;

    loop {
        // Every step left after Kahn's pass has a dependency that is also left.
        let Some(&next) = deps[current].iter().find(|d| remaining.contains(d)) else {
            break;
        };
        if let Some(&at) = position.get(&next) {
            let mut cycle: Vec<String> = path[at..].iter().map(|&i| steps[i].id.clone()).collect();
            cycle.reverse();
            cycle.insert(0, steps[next].id.clone());
            return cycle;
        }
        position.insert(next, path.len());
        path.push(next);
        current = next;
    }

    path.iter().map(|&i| steps[i].id.clone()).collect()
}

/// Implicit edges serialising access to shared workpieces.
///
/// Walking steps in `order`, a read depends on the last write to its
/// workpiece and a write depends on every read since that write (or on the
/// write itself when nothing read in between). Undeclared workpieces key to
/// the run's own workpiece.
fn workpiece_conflicts(steps: &[ProcessStep], order: &[usize]) -> Vec<Vec<usize>> {
    #[derive(Default)]
    struct Ledger {
        last_write: Option<usize>,
        reads_since: Vec<usize>,
    }

    let mut ledgers: HashMap<Option<&str>, Ledger> = HashMap::new();
    let mut implicit = vec![Vec::new(); steps.len()];

    for &i in order {
        let step = &steps[i];
        let access = step.effective_access();
        if access == WorkpieceAccess::Independent {
            continue;
        }
        let ledger = ledgers.entry(step.workpiece.as_deref()).or_default();

        match access {
            WorkpieceAccess::Read => {
                implicit[i].extend(ledger.last_write);
                ledger.reads_since.push(i);
            }
            WorkpieceAccess::Write => {
                if ledger.reads_since.is_empty() {
                    implicit[i].extend(ledger.last_write);
                } else {
                    implicit[i].append(&mut ledger.reads_since);
                }
                ledger.last_write = Some(i);
            }
            WorkpieceAccess::Independent => {}
        }
    }

    for (i, extra) in implicit.iter_mut().enumerate() {
        extra.retain(|e| !steps[i].dependencies.contains(&steps[*e].id));
        if !extra.is_empty() {
            debug!(
                "Step '{}' serialised on workpiece after {:?}",
                steps[i].id,
                extra.iter().map(|&e| &steps[e].id).collect::<Vec<_>>()
            );
        }
    }

    implicit
}
