//! Pipeline status reporting and visualization.
//!
//! This module provides [`PipelineStatus`] for inspecting where a run
//! stands: one entry per stage, with attempts and the latest feedback.

use std::fmt;

use crate::{StageStatus, WorkflowState};
use chrono::{DateTime, Utc};

/// Status entry for a single stage within a run.
#[derive(Debug, Clone)]
pub struct StageStatusEntry {
    /// The stage name.
    pub name: String,
    /// The current status of this stage.
    pub status: StageStatus,
    /// When the first attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When this stage finished.
    pub completed_at: Option<DateTime<Utc>>,
    /// Attempts started so far.
    pub attempts: u32,
    /// The stage's attempt ceiling.
    pub max_attempts: u32,
    /// The most recent rejection feedback.
    pub feedback: Option<String>,
    /// Error message if the stage failed.
    pub error: Option<String>,
}

impl StageStatusEntry {
    /// Creates a new pending status entry.
    pub fn pending(name: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            name: name.into(),
            status: StageStatus::Pending,
            started_at: None,
            completed_at: None,
            attempts: 0,
            max_attempts,
            feedback: None,
            error: None,
        }
    }

    /// Creates a status entry from a run's state.
    pub fn from_state(name: impl Into<String>, state: &WorkflowState, max_attempts: u32) -> Self {
        let name = name.into();
        let mut entry = Self::pending(name.clone(), max_attempts);
        entry.attempts = state.attempts(&name);
        entry.feedback = state.last_feedback(&name).map(str::to_string);

        if let Some(record) = state.record(&name) {
            entry.status = record.status;
            entry.started_at = record.started_at;
            entry.completed_at = record.completed_at;
            entry.error = record.error.clone();
        }

        entry
    }

    /// Returns a status indicator character.
    pub fn status_char(&self) -> char {
        match self.status {
            StageStatus::Pending => '⏳',
            StageStatus::Running => '🔄',
            StageStatus::Approved => '✅',
            StageStatus::RejectedRetryable => '🔁',
            StageStatus::RejectedExhausted => '⚠',
            StageStatus::Skipped => '⏭',
            StageStatus::Failed => '❌',
        }
    }
}

/// The status of every stage of a run.
#[derive(Debug, Clone)]
pub struct PipelineStatus {
    /// The run identifier.
    pub run_id: String,
    /// Status of each stage in topological order.
    pub stages: Vec<StageStatusEntry>,
}

impl PipelineStatus {
    /// Creates a new pipeline status.
    pub fn new(run_id: impl Into<String>, stages: Vec<StageStatusEntry>) -> Self {
        Self {
            run_id: run_id.into(),
            stages,
        }
    }

    /// Returns true if every stage is terminal.
    pub fn is_complete(&self) -> bool {
        self.stages.iter().all(|s| s.status.is_terminal())
    }

    /// Returns true if any stage has failed.
    pub fn has_failures(&self) -> bool {
        self.stages
            .iter()
            .any(|s| matches!(s.status, StageStatus::Failed))
    }

    fn names_with(&self, status: StageStatus) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.status == status)
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Returns the names of stages that are currently running.
    pub fn running_stages(&self) -> Vec<&str> {
        self.names_with(StageStatus::Running)
    }

    /// Returns the names of stages that have failed.
    pub fn failed_stages(&self) -> Vec<&str> {
        self.names_with(StageStatus::Failed)
    }

    /// Returns the names of stages that exhausted their attempts.
    pub fn flagged_stages(&self) -> Vec<&str> {
        self.names_with(StageStatus::RejectedExhausted)
    }

    /// Returns the names of skipped stages.
    pub fn skipped_stages(&self) -> Vec<&str> {
        self.names_with(StageStatus::Skipped)
    }

    /// Returns the share of terminal stages as a percentage.
    pub fn progress_percent(&self) -> f32 {
        if self.stages.is_empty() {
            return 100.0;
        }

        let terminal = self
            .stages
            .iter()
            .filter(|s| s.status.is_terminal())
            .count();

        (terminal as f32 / self.stages.len() as f32) * 100.0
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Pipeline status for run \"{}\":", self.run_id)?;
        writeln!(f)?;

        for stage in &self.stages {
            let time_str = stage
                .completed_at
                .or(stage.started_at)
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());

            write!(
                f,
                "  {} {:<15} {:<22} {}/{}  {}",
                stage.status_char(),
                stage.name,
                stage.status.to_string(),
                stage.attempts,
                stage.max_attempts,
                time_str
            )?;

            if let Some(ref error) = stage.error {
                write!(f, "  Error: {}", error)?;
            }

            writeln!(f)?;

            if let Some(ref feedback) = stage.feedback {
                writeln!(f, "     └─ feedback: {}", feedback)?;
            }
        }

        writeln!(f)?;
        writeln!(f, "Progress: {:.0}%", self.progress_percent())?;

        if self.has_failures() {
            writeln!(f, "Status: Aborted ({})", self.failed_stages().join(", "))?;
        } else if self.is_complete() {
            let flagged = self.flagged_stages();
            if flagged.is_empty() {
                writeln!(f, "Status: Complete")?;
            } else {
                writeln!(f, "Status: Complete, flagged: {}", flagged.join(", "))?;
            }
        } else {
            writeln!(f, "Status: In progress")?;
        }

        Ok(())
    }
}
