//! Error types for the Heddle orchestrator.
//!
//! Heddle separates two kinds of trouble. A validator rejecting a stage's
//! output is *not* an error: it drives the retry loop and never surfaces
//! here. Everything in [`HeddleError`] is an infrastructure or definition
//! failure and aborts the run it occurs in.

use std::time::Duration;

use thiserror::Error;

/// The main error type for Heddle operations.
///
/// This enum uses `#[non_exhaustive]` to allow adding new error variants
/// in the future without breaking backward compatibility.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HeddleError {
    /// Workflow configuration or structure is invalid.
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// Stage not found in workflow.
    #[error("Stage not found: {0}")]
    StageNotFound(String),

    /// Duplicate stage name in workflow.
    #[error("Duplicate stage name: {0}")]
    DuplicateStage(String),

    /// Cycle detected in workflow DAG.
    #[error("Cycle detected in workflow DAG")]
    DagCycle,

    /// Error occurred during stage execution.
    #[error("Stage execution error: {0}")]
    StageExecution(String),

    /// The statistics provider could not deliver data.
    #[error("Stats provider error: {0}")]
    StatsProvider(String),

    /// The text generator failed or returned a malformed response.
    #[error("Generator error: {0}")]
    Generator(String),

    /// The validator could not produce a verdict.
    #[error("Validator error: {0}")]
    Validator(String),

    /// The report sink failed to persist the final state.
    #[error("Report sink error: {0}")]
    ReportSink(String),

    /// An external call did not finish within its timeout.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// The guarded operation.
        operation: String,
        /// The timeout that expired.
        after: Duration,
    },

    /// The run was cancelled or hit its deadline.
    #[error("Run cancelled")]
    Cancelled,

    /// A unit of a fan-out stage failed.
    #[error("Unit {unit} of stage {stage} failed: {source}")]
    UnitFailed {
        /// The owning stage.
        stage: String,
        /// The failing unit.
        unit: String,
        /// The unit's own error.
        #[source]
        source: Box<HeddleError>,
    },

    /// A fan-out planned or returned the same unit twice.
    #[error("Duplicate unit {unit} in stage {stage}")]
    DuplicateUnit {
        /// The owning stage.
        stage: String,
        /// The duplicated unit.
        unit: String,
    },

    /// A run aborted on a fatal error in one stage.
    #[error("Run aborted in stage {stage}: {source}")]
    RunAborted {
        /// The stage that failed.
        stage: String,
        /// The underlying error.
        #[source]
        source: Box<HeddleError>,
    },

    /// The state belongs to a run that already aborted.
    #[error("Run {run_id} already aborted: {reason}")]
    AlreadyAborted {
        /// The aborted run.
        run_id: String,
        /// Why it aborted.
        reason: String,
    },

    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML configuration could not be parsed.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// I/O error from file or writer operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HeddleError {
    /// Wraps an error as a fatal abort of `stage`.
    ///
    /// Errors that already name an aborted stage are returned unchanged.
    pub fn aborted_in(stage: impl Into<String>, source: HeddleError) -> Self {
        match source {
            already @ HeddleError::RunAborted { .. } => already,
            other => HeddleError::RunAborted {
                stage: stage.into(),
                source: Box::new(other),
            },
        }
    }

    /// Returns the stage a fatal abort occurred in, if this is one.
    pub fn aborted_stage(&self) -> Option<&str> {
        match self {
            HeddleError::RunAborted { stage, .. } => Some(stage),
            _ => None,
        }
    }
}

/// A specialized `Result` type for Heddle operations.
pub type Result<T> = std::result::Result<T, HeddleError>;
