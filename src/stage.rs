//! Stage types for the Heddle orchestrator.
//!
//! A stage is a named pipeline step. It plans a set of units, runs each of
//! them (concurrently, on the stage's worker pool), and optionally
//! synthesizes the joined unit outputs into a single text. The executor
//! drives that sequence.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::future::Future;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::guard::CallGuard;
use crate::{HeddleError, Result, StageOutput, UnitOutputs};

/// What a stage does when some of its units fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitTolerance {
    /// Any unit error fails the stage (and therefore the run).
    #[default]
    Strict,

    /// Failed units are dropped and logged; the stage fails only if every
    /// unit failed.
    Tolerant,
}

/// Context provided to stages during execution.
///
/// The context is an immutable snapshot taken by the executor when the
/// attempt starts. Units of the same attempt share it.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// Name of the current stage.
    pub stage_name: String,

    /// Attempt number, starting at 1.
    pub attempt: u32,

    /// Feedback of the rejection that triggered this attempt, if any.
    pub feedback: Option<String>,

    /// Recorded outputs of the stage's direct dependencies.
    pub upstream: BTreeMap<String, StageOutput>,

    /// Optional metadata that can be used by stages.
    pub metadata: HashMap<String, serde_json::Value>,

    /// Timeout and cancellation applied to collaborator calls.
    pub guard: CallGuard,
}

impl StageContext {
    /// Creates a context for the first attempt of a stage.
    pub fn new(stage_name: impl Into<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
            attempt: 1,
            feedback: None,
            upstream: BTreeMap::new(),
            metadata: HashMap::new(),
            guard: CallGuard::unbounded(),
        }
    }

    /// Sets the attempt number.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Sets the validator feedback for a retry.
    ///
    /// Empty feedback is treated as none.
    pub fn with_feedback(mut self, feedback: impl Into<String>) -> Self {
        let feedback = feedback.into();
        self.feedback = (!feedback.is_empty()).then_some(feedback);
        self
    }

    /// Adds an upstream stage output.
    pub fn with_upstream(mut self, stage: impl Into<String>, output: StageOutput) -> Self {
        self.upstream.insert(stage.into(), output);
        self
    }

    /// Adds metadata to the context.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Sets the call guard.
    pub fn with_guard(mut self, guard: CallGuard) -> Self {
        self.guard = guard;
        self
    }

    /// Returns the retry feedback, if this attempt is a retry.
    pub fn feedback(&self) -> Option<&str> {
        self.feedback.as_deref()
    }

    /// Returns true if this attempt re-runs a rejected output.
    pub fn is_retry(&self) -> bool {
        self.feedback.is_some()
    }

    /// Returns an upstream output by stage name.
    pub fn upstream(&self, stage: &str) -> Option<&StageOutput> {
        self.upstream.get(stage)
    }

    /// Gets metadata by key.
    pub fn get_metadata(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }

    /// Runs a collaborator call under the context's timeout and
    /// cancellation.
    ///
    /// # Errors
    ///
    /// See [`CallGuard::call`].
    pub async fn call<T, F>(&self, operation: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.guard.call(operation, call).await
    }
}

/// A trait representing a stage in the workflow.
///
/// Stages are the building blocks of a workflow. The executor calls
/// [`plan_units`](Stage::plan_units) once per attempt, runs
/// [`run_unit`](Stage::run_unit) for every planned unit, waits for all of
/// them, and then calls [`synthesize`](Stage::synthesize) over the joined
/// results. A stage never writes workflow state; it only returns values.
///
/// # Object Safety
///
/// This trait is object-safe, allowing for dynamic dispatch with `dyn Stage`.
///
/// # Examples
///
/// ```
/// use heddle::{Stage, StageContext, Result, UnitOutputs};
/// use async_trait::async_trait;
///
/// #[derive(Debug)]
/// struct Shout;
///
/// #[async_trait]
/// impl Stage for Shout {
///     fn name(&self) -> &str {
///         "shout"
///     }
///
///     async fn plan_units(&self, _ctx: &StageContext) -> Result<Vec<String>> {
///         Ok(vec!["a".to_string(), "b".to_string()])
///     }
///
///     async fn run_unit(&self, unit: &str, _ctx: &StageContext) -> Result<String> {
///         Ok(unit.to_uppercase())
///     }
///
///     async fn synthesize(&self, units: &UnitOutputs, _ctx: &StageContext) -> Result<Option<String>> {
///         Ok(Some(units.values().cloned().collect::<Vec<_>>().join("")))
///     }
/// }
/// ```
#[async_trait]
pub trait Stage: Debug + Send + Sync {
    /// Returns the name of this stage.
    fn name(&self) -> &str;

    /// Returns the unit ids to fan out over in this attempt.
    ///
    /// The default plans no units, for stages that only synthesize.
    async fn plan_units(&self, _ctx: &StageContext) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Runs one unit and returns its output.
    ///
    /// Units must not depend on each other or on completion order.
    async fn run_unit(&self, unit: &str, ctx: &StageContext) -> Result<String> {
        Err(HeddleError::StageExecution(format!(
            "stage {} planned unit {} but has no unit runner",
            ctx.stage_name, unit
        )))
    }

    /// Produces the stage's single output from its joined unit outputs.
    ///
    /// Returning `None` makes the unit collection itself the output. Only
    /// called once every planned unit has returned.
    async fn synthesize(&self, _units: &UnitOutputs, _ctx: &StageContext) -> Result<Option<String>> {
        Ok(None)
    }

    /// Returns how the stage treats failed units.
    fn tolerance(&self) -> UnitTolerance {
        UnitTolerance::Strict
    }
}
