//! Workflow definition and DAG management.
//!
//! This module provides [`Workflow`] and [`WorkflowBuilder`] for constructing
//! stage graphs backed by petgraph. Runs are driven by
//! [`Workflow::run`].

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::config::OrchestratorConfig;
use crate::status::{PipelineStatus, StageStatusEntry};
use crate::{
    HeddleError, ReportSink, Result, Stage, StageStatus, UnitTolerance, Validator, WorkflowEvent,
    WorkflowState,
};

/// Default channel capacity for workflow events.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default attempt ceiling per stage.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default number of concurrent units per stage.
pub const DEFAULT_WORKER_POOL_SIZE: usize = 8;

/// The condition an edge puts on its upstream stage.
///
/// A downstream stage runs once every incoming edge is terminal and every
/// condition holds. If any condition fails it is skipped. A skipped stage
/// satisfies no condition, so skips propagate downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCondition {
    /// The upstream stage recorded an output, approved or exhausted.
    #[default]
    Always,

    /// The upstream stage was approved.
    Approved,

    /// The upstream stage exhausted its attempts without approval.
    Exhausted,
}

impl EdgeCondition {
    /// Returns true if an upstream stage in `status` satisfies this edge.
    pub fn is_met(&self, status: StageStatus) -> bool {
        match self {
            EdgeCondition::Always => status.has_output(),
            EdgeCondition::Approved => status == StageStatus::Approved,
            EdgeCondition::Exhausted => status == StageStatus::RejectedExhausted,
        }
    }
}

impl fmt::Display for EdgeCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdgeCondition::Always => f.write_str("always"),
            EdgeCondition::Approved => f.write_str("approved"),
            EdgeCondition::Exhausted => f.write_str("exhausted"),
        }
    }
}

/// Per-stage execution settings, resolved at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StageSettings {
    pub(crate) max_attempts: u32,
    pub(crate) worker_pool_size: usize,
    pub(crate) fan_out: Option<usize>,
    pub(crate) tolerance: Option<UnitTolerance>,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            fan_out: None,
            tolerance: None,
        }
    }
}

/// A registered stage in the workflow.
struct RegisteredStage {
    name: String,
    stage: Arc<dyn Stage>,
    settings: StageSettings,
}

/// Where a stage stands with respect to its upstream stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    /// Some upstream stage is not terminal yet.
    Waiting,
    /// Every upstream stage is terminal and every condition holds.
    Ready,
    /// Every upstream stage is terminal but a condition failed.
    Skip,
}

/// A stage graph backed by a directed acyclic graph (DAG).
///
/// Edges point from a stage to the stages that consume it. A stage may
/// start only once every upstream stage is terminal (approved, exhausted,
/// or skipped). Independent stages run concurrently.
///
/// # Construction
///
/// Use [`Workflow::builder()`] to create a new workflow:
///
/// ```
/// use heddle::{Workflow, Verdict, Validator, ValidationContext, StageOutput};
/// # use heddle::{Stage, StageContext, Result, UnitOutputs};
/// # use async_trait::async_trait;
/// # use std::sync::Arc;
/// #
/// # #[derive(Debug)]
/// # struct Draft;
/// # #[async_trait]
/// # impl Stage for Draft {
/// #     fn name(&self) -> &str { "draft" }
/// #     async fn synthesize(&self, _u: &UnitOutputs, _c: &StageContext) -> Result<Option<String>> {
/// #         Ok(Some("draft".to_string()))
/// #     }
/// # }
/// # #[derive(Debug)]
/// # struct Polish;
/// # #[async_trait]
/// # impl Stage for Polish {
/// #     fn name(&self) -> &str { "polish" }
/// #     async fn synthesize(&self, _u: &UnitOutputs, _c: &StageContext) -> Result<Option<String>> {
/// #         Ok(Some("polished".to_string()))
/// #     }
/// # }
/// # #[derive(Debug)]
/// # struct Approve;
/// # #[async_trait]
/// # impl Validator for Approve {
/// #     async fn judge(&self, _c: &ValidationContext, _o: &StageOutput) -> Result<Verdict> {
/// #         Ok(Verdict::approve("APPROVED"))
/// #     }
/// # }
///
/// let workflow = Workflow::builder()
///     .stage("draft", Draft)
///     .stage("polish", Polish)
///     .dependency("polish", "draft")
///     .validator(Arc::new(Approve))
///     .build()?;
/// # Ok::<(), heddle::HeddleError>(())
/// ```
///
/// # Thread Safety
///
/// `Workflow` is `Send + Sync` and can be shared across async tasks.
pub struct Workflow {
    /// The underlying directed graph.
    graph: DiGraph<RegisteredStage, EdgeCondition>,
    /// Mapping from stage name to node index.
    name_to_index: HashMap<String, NodeIndex>,
    /// Cached topological order of stage names.
    pub(crate) topo_order: Vec<String>,
    /// Event broadcast channel sender.
    pub(crate) event_tx: broadcast::Sender<WorkflowEvent>,
    /// The validation gate every stage output passes through.
    pub(crate) validator: Option<Arc<dyn Validator>>,
    /// Receives the finished state.
    pub(crate) report_sink: Option<Arc<dyn ReportSink>>,
    /// Timeout applied to every collaborator call.
    pub(crate) call_timeout: Option<Duration>,
    /// Deadline for a whole run.
    pub(crate) run_deadline: Option<Duration>,
}

impl Workflow {
    /// Creates a new workflow builder.
    pub fn builder() -> WorkflowBuilder {
        WorkflowBuilder::new()
    }

    /// Subscribes to run events.
    ///
    /// Returns a receiver that will receive all events broadcast by this
    /// workflow. Events are not persisted; if the receiver is too slow,
    /// events may be dropped.
    ///
    /// # Example
    ///
    /// ```
    /// # use heddle::Workflow;
    /// let workflow = Workflow::builder().build().unwrap();
    /// let mut events = workflow.subscribe();
    ///
    /// // In a separate task:
    /// // while let Ok(event) = events.recv().await {
    /// //     println!("Event: {:?}", event);
    /// // }
    /// ```
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.event_tx.subscribe()
    }

    /// Returns the stage names in topological order.
    pub fn stages(&self) -> &[String] {
        &self.topo_order
    }

    /// Returns the number of stages in the workflow.
    pub fn stage_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns true if a stage with the given name exists.
    pub fn has_stage(&self, name: &str) -> bool {
        self.name_to_index.contains_key(name)
    }

    fn index_of(&self, stage: &str) -> Result<NodeIndex> {
        self.name_to_index
            .get(stage)
            .copied()
            .ok_or_else(|| HeddleError::StageNotFound(stage.to_string()))
    }

    /// Returns the immediate dependencies of a stage.
    ///
    /// # Errors
    ///
    /// Returns [`HeddleError::StageNotFound`] if the stage doesn't exist.
    pub fn dependencies(&self, stage: &str) -> Result<Vec<&str>> {
        let node_index = self.index_of(stage)?;
        let deps = self
            .graph
            .neighbors_directed(node_index, Direction::Incoming)
            .map(|idx| self.graph[idx].name.as_str())
            .collect();
        Ok(deps)
    }

    /// Returns the stages that depend on the given stage.
    ///
    /// # Errors
    ///
    /// Returns [`HeddleError::StageNotFound`] if the stage doesn't exist.
    pub fn dependents(&self, stage: &str) -> Result<Vec<&str>> {
        let node_index = self.index_of(stage)?;
        let deps = self
            .graph
            .neighbors_directed(node_index, Direction::Outgoing)
            .map(|idx| self.graph[idx].name.as_str())
            .collect();
        Ok(deps)
    }

    /// Returns the incoming edges of a stage with their conditions.
    ///
    /// # Errors
    ///
    /// Returns [`HeddleError::StageNotFound`] if the stage doesn't exist.
    pub fn incoming_edges(&self, stage: &str) -> Result<Vec<(&str, EdgeCondition)>> {
        let node_index = self.index_of(stage)?;
        let edges = self
            .graph
            .edges_directed(node_index, Direction::Incoming)
            .map(|edge| (self.graph[edge.source()].name.as_str(), *edge.weight()))
            .collect();
        Ok(edges)
    }

    pub(crate) fn get_stage(&self, name: &str) -> Result<&Arc<dyn Stage>> {
        let node_index = self.index_of(name)?;
        Ok(&self.graph[node_index].stage)
    }

    pub(crate) fn settings(&self, name: &str) -> Result<StageSettings> {
        let node_index = self.index_of(name)?;
        Ok(self.graph[node_index].settings)
    }

    /// Returns the attempt ceiling of a stage.
    ///
    /// # Errors
    ///
    /// Returns [`HeddleError::StageNotFound`] if the stage doesn't exist.
    pub fn max_attempts_for(&self, stage: &str) -> Result<u32> {
        Ok(self.settings(stage)?.max_attempts)
    }

    /// Returns the worker pool size of a stage.
    ///
    /// # Errors
    ///
    /// Returns [`HeddleError::StageNotFound`] if the stage doesn't exist.
    pub fn worker_pool_size_for(&self, stage: &str) -> Result<usize> {
        Ok(self.settings(stage)?.worker_pool_size)
    }

    /// Returns stages that have no dependencies (root stages).
    pub fn root_stages(&self) -> Vec<&str> {
        self.topo_order
            .iter()
            .filter(|name| {
                self.dependencies(name)
                    .map(|deps| deps.is_empty())
                    .unwrap_or(false)
            })
            .map(|s| s.as_str())
            .collect()
    }

    /// Returns stages that have no dependents (leaf stages).
    pub fn leaf_stages(&self) -> Vec<&str> {
        self.topo_order
            .iter()
            .filter(|name| {
                self.dependents(name)
                    .map(|deps| deps.is_empty())
                    .unwrap_or(false)
            })
            .map(|s| s.as_str())
            .collect()
    }

    pub(crate) fn readiness(&self, stage: &str, state: &WorkflowState) -> Result<Readiness> {
        let mut conditions_met = true;
        for (upstream, condition) in self.incoming_edges(stage)? {
            let status = state.status(upstream);
            if !status.is_terminal() {
                return Ok(Readiness::Waiting);
            }
            if !condition.is_met(status) {
                conditions_met = false;
            }
        }
        Ok(if conditions_met {
            Readiness::Ready
        } else {
            Readiness::Skip
        })
    }

    /// Returns the stages that would be dispatched next for a state.
    ///
    /// A stage is ready if it has not started or is waiting for a retry,
    /// has attempts left, and every upstream stage is terminal with its
    /// edge condition met.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph cannot be queried.
    pub fn ready_stages(&self, state: &WorkflowState) -> Result<Vec<String>> {
        let mut ready = Vec::new();

        for stage_name in &self.topo_order {
            match state.status(stage_name) {
                StageStatus::Pending | StageStatus::RejectedRetryable => {}
                StageStatus::Running
                | StageStatus::Approved
                | StageStatus::RejectedExhausted
                | StageStatus::Skipped
                | StageStatus::Failed => continue,
            }

            if state.attempts(stage_name) >= self.max_attempts_for(stage_name)? {
                continue;
            }

            if self.readiness(stage_name, state)? == Readiness::Ready {
                ready.push(stage_name.clone());
            }
        }

        Ok(ready)
    }

    /// Returns true if every stage is terminal in `state`.
    pub fn is_complete(&self, state: &WorkflowState) -> bool {
        self.topo_order
            .iter()
            .all(|stage| state.status(stage).is_terminal())
    }

    /// Returns a status snapshot of a run, in topological order.
    ///
    /// # Example
    ///
    /// ```
    /// # use heddle::{Workflow, WorkflowState};
    /// let workflow = Workflow::builder().build().unwrap();
    /// let state = WorkflowState::with_run_id("run-1");
    /// let status = workflow.status(&state).unwrap();
    /// println!("{}", status);
    /// ```
    ///
    /// # Errors
    ///
    /// Returns an error if the graph cannot be queried.
    pub fn status(&self, state: &WorkflowState) -> Result<PipelineStatus> {
        let stages = self
            .topo_order
            .iter()
            .map(|name| {
                let max_attempts = self.max_attempts_for(name)?;
                Ok(StageStatusEntry::from_state(name, state, max_attempts))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(PipelineStatus::new(state.run_id(), stages))
    }
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("stages", &self.topo_order)
            .field("stage_count", &self.stage_count())
            .field("call_timeout", &self.call_timeout)
            .field("run_deadline", &self.run_deadline)
            .finish()
    }
}

/// A deferred edge specification.
struct DeferredEdge {
    stage: String,
    depends_on: String,
    condition: EdgeCondition,
}

/// Builder for constructing [`Workflow`] instances.
///
/// Stage names, edges and per-stage overrides are validated in
/// [`build`](Self::build), so they may be declared in any order.
pub struct WorkflowBuilder {
    /// The graph being built.
    graph: DiGraph<RegisteredStage, EdgeCondition>,
    /// Mapping from stage name to node index.
    name_to_index: HashMap<String, NodeIndex>,
    /// Deferred edges to be resolved at build time.
    deferred_edges: Vec<DeferredEdge>,
    defaults: StageSettings,
    max_attempt_overrides: HashMap<String, u32>,
    pool_size_overrides: HashMap<String, usize>,
    fan_outs: HashMap<String, usize>,
    tolerances: HashMap<String, UnitTolerance>,
    configured: Vec<String>,
    validator: Option<Arc<dyn Validator>>,
    report_sink: Option<Arc<dyn ReportSink>>,
    call_timeout: Option<Duration>,
    run_deadline: Option<Duration>,
}

impl WorkflowBuilder {
    /// Creates a new, empty workflow builder.
    fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            name_to_index: HashMap::new(),
            deferred_edges: Vec::new(),
            defaults: StageSettings::default(),
            max_attempt_overrides: HashMap::new(),
            pool_size_overrides: HashMap::new(),
            fan_outs: HashMap::new(),
            tolerances: HashMap::new(),
            configured: Vec::new(),
            validator: None,
            report_sink: None,
            call_timeout: None,
            run_deadline: None,
        }
    }

    /// Adds a stage to the workflow.
    ///
    /// # Panics
    ///
    /// Panics if a stage with the same name already exists. Use
    /// [`try_stage`](Self::try_stage) for a fallible version.
    pub fn stage(self, name: impl Into<String>, stage: impl Stage + 'static) -> Self {
        let name = name.into();
        match self.try_stage(name.clone(), stage) {
            Ok(builder) => builder,
            Err(_) => panic!("duplicate stage name: {}", name),
        }
    }

    /// Adds a stage to the workflow, returning an error on duplicate.
    ///
    /// This is the fallible version of [`stage`](Self::stage).
    pub fn try_stage(mut self, name: impl Into<String>, stage: impl Stage + 'static) -> Result<Self> {
        let name = name.into();
        if self.name_to_index.contains_key(&name) {
            return Err(HeddleError::DuplicateStage(name));
        }

        let registered = RegisteredStage {
            name: name.clone(),
            stage: Arc::new(stage),
            settings: StageSettings::default(),
        };
        let index = self.graph.add_node(registered);
        self.name_to_index.insert(name, index);
        Ok(self)
    }

    /// Declares that `stage` depends on `depends_on`.
    ///
    /// `depends_on` must record an output before `stage` can run.
    pub fn dependency(self, stage: impl Into<String>, depends_on: impl Into<String>) -> Self {
        self.edge(depends_on, stage, EdgeCondition::Always)
    }

    /// Declares a conditional edge from `from` to `to`.
    ///
    /// Declaring the same pair twice keeps the last condition.
    pub fn edge(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        condition: EdgeCondition,
    ) -> Self {
        self.deferred_edges.push(DeferredEdge {
            stage: to.into(),
            depends_on: from.into(),
            condition,
        });
        self
    }

    /// Sets the default attempt ceiling. Must be at least 1.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.defaults.max_attempts = max_attempts;
        self
    }

    /// Overrides the attempt ceiling of one stage.
    pub fn stage_max_attempts(mut self, stage: impl Into<String>, max_attempts: u32) -> Self {
        self.max_attempt_overrides.insert(stage.into(), max_attempts);
        self
    }

    /// Sets the default number of concurrent units per stage.
    pub fn worker_pool_size(mut self, size: usize) -> Self {
        self.defaults.worker_pool_size = size;
        self
    }

    /// Overrides the worker pool size of one stage.
    pub fn stage_worker_pool_size(mut self, stage: impl Into<String>, size: usize) -> Self {
        self.pool_size_overrides.insert(stage.into(), size);
        self
    }

    /// Declares how many units a stage must plan.
    pub fn fan_out(mut self, stage: impl Into<String>, units: usize) -> Self {
        self.fan_outs.insert(stage.into(), units);
        self
    }

    /// Overrides a stage's own unit tolerance.
    pub fn tolerance(mut self, stage: impl Into<String>, tolerance: UnitTolerance) -> Self {
        self.tolerances.insert(stage.into(), tolerance);
        self
    }

    /// Sets the timeout applied to every collaborator call.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Sets a deadline for whole runs.
    pub fn run_deadline(mut self, deadline: Duration) -> Self {
        self.run_deadline = Some(deadline);
        self
    }

    /// Sets the validation gate. Required once the workflow has stages.
    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Sets the sink that receives finished states.
    pub fn report_sink(mut self, sink: Arc<dyn ReportSink>) -> Self {
        self.report_sink = Some(sink);
        self
    }

    /// Applies a loaded configuration.
    ///
    /// Global values replace the builder's defaults; `[[stages]]` entries
    /// add overrides and dependencies; `[[edges]]` add conditional edges.
    /// Every stage the configuration names must be registered by
    /// [`build`](Self::build) time.
    pub fn configure(mut self, config: &OrchestratorConfig) -> Self {
        self.defaults.max_attempts = config.max_attempts;
        self.defaults.worker_pool_size = config.worker_pool_size;
        self.call_timeout = Some(config.call_timeout());
        self.run_deadline = config.run_deadline();

        for stage in &config.stages {
            self.configured.push(stage.id.clone());
            if let Some(max_attempts) = stage.max_attempts {
                self.max_attempt_overrides.insert(stage.id.clone(), max_attempts);
            }
            if let Some(size) = stage.worker_pool_size {
                self.pool_size_overrides.insert(stage.id.clone(), size);
            }
            if let Some(units) = stage.fan_out {
                self.fan_outs.insert(stage.id.clone(), units);
            }
            if let Some(tolerance) = stage.tolerance {
                self.tolerances.insert(stage.id.clone(), tolerance);
            }
            for depends_on in &stage.depends_on {
                self = self.dependency(stage.id.clone(), depends_on.clone());
            }
        }

        for edge in &config.edges {
            self = self.edge(edge.from.clone(), edge.to.clone(), edge.when);
        }

        self
    }

    fn check_known<'a>(&self, names: impl IntoIterator<Item = &'a String>) -> Result<()> {
        for name in names {
            if !self.name_to_index.contains_key(name) {
                return Err(HeddleError::StageNotFound(name.clone()));
            }
        }
        Ok(())
    }

    /// Builds the workflow, validating the DAG.
    ///
    /// # Errors
    ///
    /// - [`HeddleError::StageNotFound`] if an edge or override references a
    ///   non-existent stage
    /// - [`HeddleError::DagCycle`] if the dependencies form a cycle
    /// - [`HeddleError::InvalidWorkflow`] if a ceiling or pool size is 0,
    ///   or if stages exist without a validator
    pub fn build(mut self) -> Result<Workflow> {
        self.check_known(self.max_attempt_overrides.keys())?;
        self.check_known(self.pool_size_overrides.keys())?;
        self.check_known(self.fan_outs.keys())?;
        self.check_known(self.tolerances.keys())?;
        self.check_known(self.configured.iter())?;

        // Resolve deferred edges
        for edge in &self.deferred_edges {
            let stage_idx = self
                .name_to_index
                .get(&edge.stage)
                .ok_or_else(|| HeddleError::StageNotFound(edge.stage.clone()))?;
            let depends_on_idx = self
                .name_to_index
                .get(&edge.depends_on)
                .ok_or_else(|| HeddleError::StageNotFound(edge.depends_on.clone()))?;

            // Edge direction: depends_on → stage (dependency flows forward)
            self.graph
                .update_edge(*depends_on_idx, *stage_idx, edge.condition);
        }

        // Check for cycles
        if petgraph::algo::is_cyclic_directed(&self.graph) {
            return Err(HeddleError::DagCycle);
        }

        let topo_order = petgraph::algo::toposort(&self.graph, None)
            .map_err(|_| HeddleError::DagCycle)?
            .into_iter()
            .map(|idx| self.graph[idx].name.clone())
            .collect();

        for (name, index) in &self.name_to_index {
            let settings = StageSettings {
                max_attempts: self
                    .max_attempt_overrides
                    .get(name)
                    .copied()
                    .unwrap_or(self.defaults.max_attempts),
                worker_pool_size: self
                    .pool_size_overrides
                    .get(name)
                    .copied()
                    .unwrap_or(self.defaults.worker_pool_size),
                fan_out: self.fan_outs.get(name).copied(),
                tolerance: self.tolerances.get(name).copied(),
            };

            if settings.max_attempts == 0 {
                return Err(HeddleError::InvalidWorkflow(format!(
                    "stage {} must allow at least one attempt",
                    name
                )));
            }
            if settings.worker_pool_size == 0 {
                return Err(HeddleError::InvalidWorkflow(format!(
                    "stage {} needs at least one worker",
                    name
                )));
            }

            self.graph[*index].settings = settings;
        }

        if self.graph.node_count() > 0 && self.validator.is_none() {
            return Err(HeddleError::InvalidWorkflow(
                "a validator is required".to_string(),
            ));
        }

        // Create event broadcast channel
        let (event_tx, _) = broadcast::channel(DEFAULT_EVENT_CHANNEL_CAPACITY);

        Ok(Workflow {
            graph: self.graph,
            name_to_index: self.name_to_index,
            topo_order,
            event_tx,
            validator: self.validator,
            report_sink: self.report_sink,
            call_timeout: self.call_timeout,
            run_deadline: self.run_deadline,
        })
    }
}

impl Default for WorkflowBuilder {
    fn default() -> Self {
        Self::new()
    }
}
