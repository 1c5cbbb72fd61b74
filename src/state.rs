//! Per-run workflow state.
//!
//! [`WorkflowState`] is the single record threaded through one pipeline run.
//! Readers get shared accessors; every mutator is crate-private because the
//! executor is the only component allowed to write it, and only after a
//! stage attempt (including its whole fan-out) has finished.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{HeddleError, Result};

/// Outputs of one stage's fan-out, keyed by unit id.
///
/// A `BTreeMap` so that anything built from it (synthesis prompts, reports)
/// is independent of the order in which units finished.
pub type UnitOutputs = BTreeMap<String, String>;

/// The status of a stage within a run.
///
/// Mirrors the retry controller's state machine, plus `Skipped` for stages
/// whose incoming edge conditions were not met and `Failed` for stages that
/// aborted the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    /// Not started yet.
    Pending,

    /// An attempt is in flight.
    Running,

    /// The validator approved the output.
    Approved,

    /// The validator rejected the output; another attempt is queued.
    RejectedRetryable,

    /// The validator rejected the output at the attempt ceiling. The last
    /// output was kept.
    RejectedExhausted,

    /// The stage's edge conditions were not satisfied.
    Skipped,

    /// The stage hit an infrastructure error and aborted the run.
    Failed,
}

impl StageStatus {
    /// Returns true if the stage will not run again in this run.
    ///
    /// `Failed` is not terminal in this sense: it ends the whole run instead.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Approved | StageStatus::RejectedExhausted | StageStatus::Skipped
        )
    }

    /// Returns true if the stage produced an output that downstream stages
    /// may consume.
    pub fn has_output(&self) -> bool {
        matches!(self, StageStatus::Approved | StageStatus::RejectedExhausted)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Approved => "approved",
            StageStatus::RejectedRetryable => "rejected (retrying)",
            StageStatus::RejectedExhausted => "rejected (exhausted)",
            StageStatus::Skipped => "skipped",
            StageStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Ledger entry for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Current status of the stage.
    pub status: StageStatus,

    /// When the first attempt started.
    pub started_at: Option<DateTime<Utc>>,

    /// When the stage reached a terminal or failed status.
    pub completed_at: Option<DateTime<Utc>>,

    /// Error message if the stage failed.
    pub error: Option<String>,
}

impl StageRecord {
    /// Creates a new pending record.
    pub fn new() -> Self {
        Self {
            status: StageStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Marks an attempt as running, keeping the first start time.
    pub fn mark_running(&mut self) {
        self.status = StageStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Marks the stage approved.
    pub fn mark_approved(&mut self) {
        self.status = StageStatus::Approved;
        self.completed_at = Some(Utc::now());
    }

    /// Marks the stage rejected with another attempt to come.
    pub fn mark_retryable(&mut self) {
        self.status = StageStatus::RejectedRetryable;
    }

    /// Marks the stage rejected at its attempt ceiling.
    pub fn mark_exhausted(&mut self) {
        self.status = StageStatus::RejectedExhausted;
        self.completed_at = Some(Utc::now());
    }

    /// Marks the stage skipped.
    pub fn mark_skipped(&mut self) {
        self.status = StageStatus::Skipped;
        self.completed_at = Some(Utc::now());
    }

    /// Marks the stage failed with an error message.
    pub fn mark_failed(&mut self, error: String) {
        self.status = StageStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(error);
    }

    /// Returns an interrupted attempt to pending.
    pub fn mark_interrupted(&mut self) {
        self.status = StageStatus::Pending;
    }
}

impl Default for StageRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// The output of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StageOutput {
    /// A single text produced by the stage's synthesis step.
    Synthesized(String),

    /// The unit outputs themselves, for stages without synthesis.
    Units(UnitOutputs),
}

impl StageOutput {
    /// Returns the synthesized text, if this output has one.
    pub fn as_synthesized(&self) -> Option<&str> {
        match self {
            StageOutput::Synthesized(text) => Some(text),
            StageOutput::Units(_) => None,
        }
    }

    /// Returns the unit collection, if this output is one.
    pub fn units(&self) -> Option<&UnitOutputs> {
        match self {
            StageOutput::Synthesized(_) => None,
            StageOutput::Units(units) => Some(units),
        }
    }

    /// Renders the output as prompt-ready text.
    ///
    /// Unit collections render as `unit:\ntext` blocks in key order.
    pub fn to_text(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for StageOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageOutput::Synthesized(text) => f.write_str(text),
            StageOutput::Units(units) => {
                for (idx, (unit, text)) in units.iter().enumerate() {
                    if idx > 0 {
                        f.write_str("\n\n")?;
                    }
                    write!(f, "{}:\n{}", unit, text)?;
                }
                Ok(())
            }
        }
    }
}

/// Merges fan-out results with "union keys, error on duplicate".
///
/// # Errors
///
/// Returns [`HeddleError::DuplicateUnit`] if a unit id appears twice.
pub fn union_units(
    stage: &str,
    results: impl IntoIterator<Item = (String, String)>,
) -> Result<UnitOutputs> {
    let mut merged = UnitOutputs::new();
    for (unit, text) in results {
        if merged.contains_key(&unit) {
            return Err(HeddleError::DuplicateUnit {
                stage: stage.to_string(),
                unit,
            });
        }
        merged.insert(unit, text);
    }
    Ok(merged)
}

/// The shared record of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    run_id: String,
    created_at: DateTime<Utc>,
    stage_outputs: BTreeMap<String, StageOutput>,
    unit_outputs: BTreeMap<String, UnitOutputs>,
    attempt_counts: BTreeMap<String, u32>,
    last_feedback: BTreeMap<String, String>,
    rerun_requested: BTreeMap<String, bool>,
    phase: Option<String>,
    ledger: BTreeMap<String, StageRecord>,
    #[serde(default)]
    stage_order: Vec<String>,
    aborted: Option<String>,
}

impl WorkflowState {
    /// Creates an empty state with a timestamp-derived run id.
    pub fn new() -> Self {
        let now = Utc::now();
        Self::with_run_id(format!("run-{}", now.format("%Y%m%dT%H%M%S%.6f")))
    }

    /// Creates an empty state with the given run id.
    pub fn with_run_id(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            created_at: Utc::now(),
            stage_outputs: BTreeMap::new(),
            unit_outputs: BTreeMap::new(),
            attempt_counts: BTreeMap::new(),
            last_feedback: BTreeMap::new(),
            rerun_requested: BTreeMap::new(),
            phase: None,
            ledger: BTreeMap::new(),
            stage_order: Vec::new(),
            aborted: None,
        }
    }

    /// Returns the run id.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Returns when the state was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns the recorded output of a stage.
    ///
    /// Present only once the stage is approved or exhausted.
    pub fn stage_output(&self, stage: &str) -> Option<&StageOutput> {
        self.stage_outputs.get(stage)
    }

    /// Returns all recorded stage outputs.
    pub fn stage_outputs(&self) -> &BTreeMap<String, StageOutput> {
        &self.stage_outputs
    }

    /// Returns the unit outputs of a stage's latest completed fan-in.
    pub fn unit_outputs(&self, stage: &str) -> Option<&UnitOutputs> {
        self.unit_outputs.get(stage)
    }

    /// Returns the number of attempts a stage has started.
    pub fn attempts(&self, stage: &str) -> u32 {
        self.attempt_counts.get(stage).copied().unwrap_or(0)
    }

    /// Returns all attempt counters.
    pub fn attempt_counts(&self) -> &BTreeMap<String, u32> {
        &self.attempt_counts
    }

    /// Returns the most recent rejection feedback for a stage.
    ///
    /// `None` means the stage has not been rejected. It says nothing about
    /// whether the stage passed.
    pub fn last_feedback(&self, stage: &str) -> Option<&str> {
        self.last_feedback
            .get(stage)
            .map(String::as_str)
            .filter(|feedback| !feedback.is_empty())
    }

    /// Returns true while a rejected stage waits for its retry to finish.
    pub fn rerun_requested(&self, stage: &str) -> bool {
        self.rerun_requested.get(stage).copied().unwrap_or(false)
    }

    /// Returns the stage most recently dispatched.
    pub fn phase(&self) -> Option<&str> {
        self.phase.as_deref()
    }

    /// Returns the ledger entry of a stage.
    pub fn record(&self, stage: &str) -> Option<&StageRecord> {
        self.ledger.get(stage)
    }

    /// Returns the full ledger.
    pub fn ledger(&self) -> &BTreeMap<String, StageRecord> {
        &self.ledger
    }

    /// Returns the pipeline order of the workflow that last ran this state.
    ///
    /// Empty until the state has been run.
    pub fn stage_order(&self) -> &[String] {
        &self.stage_order
    }

    /// Returns every stage in the ledger, pipeline order first, then any
    /// stage the workflow does not name, by name.
    pub fn stages_in_order(&self) -> Vec<&str> {
        let mut stages: Vec<&str> = self
            .stage_order
            .iter()
            .map(String::as_str)
            .filter(|stage| self.ledger.contains_key(*stage))
            .collect();
        stages.extend(
            self.ledger
                .keys()
                .map(String::as_str)
                .filter(|stage| !self.stage_order.iter().any(|s| s == stage)),
        );
        stages
    }

    /// Returns the status of a stage, `Pending` if it has no record.
    pub fn status(&self, stage: &str) -> StageStatus {
        self.ledger
            .get(stage)
            .map(|record| record.status)
            .unwrap_or(StageStatus::Pending)
    }

    /// Returns the stages that hit their retry ceiling without approval,
    /// in pipeline order.
    pub fn exhausted_stages(&self) -> Vec<&str> {
        self.stages_in_order()
            .into_iter()
            .filter(|stage| self.status(stage) == StageStatus::RejectedExhausted)
            .collect()
    }

    /// Returns true if a run on this state aborted fatally.
    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }

    /// Returns the abort reason, if any.
    pub fn abort_reason(&self) -> Option<&str> {
        self.aborted.as_deref()
    }

    pub(crate) fn record_mut(&mut self, stage: &str) -> &mut StageRecord {
        self.ledger.entry(stage.to_string()).or_default()
    }

    pub(crate) fn increment_attempt(&mut self, stage: &str) -> u32 {
        let count = self.attempt_counts.entry(stage.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub(crate) fn set_stage_order(&mut self, order: &[String]) {
        self.stage_order = order.to_vec();
    }

    pub(crate) fn set_phase(&mut self, stage: &str) {
        self.phase = Some(stage.to_string());
    }

    pub(crate) fn set_feedback(&mut self, stage: &str, feedback: String) {
        self.last_feedback.insert(stage.to_string(), feedback);
    }

    pub(crate) fn set_rerun(&mut self, stage: &str, requested: bool) {
        self.rerun_requested.insert(stage.to_string(), requested);
    }

    /// Replaces a stage's unit outputs in one batch.
    pub(crate) fn replace_unit_outputs(&mut self, stage: &str, units: UnitOutputs) {
        self.unit_outputs.insert(stage.to_string(), units);
    }

    pub(crate) fn write_stage_output(&mut self, stage: &str, output: StageOutput) {
        self.stage_outputs.insert(stage.to_string(), output);
    }

    pub(crate) fn mark_aborted(&mut self, reason: String) {
        self.aborted = Some(reason);
    }
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self::new()
    }
}
