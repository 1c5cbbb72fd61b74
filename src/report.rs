//! The finished report and where it goes.
//!
//! When every stage of a run is terminal the executor hands the state to a
//! [`ReportSink`]. Two sinks are provided: [`MemoryReportSink`] for tests
//! and embedding, and [`JsonReportSink`] for any `io::Write`.

use std::fmt::{self, Write as _};
use std::io::Write;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{HeddleError, Result, StageOutput, StageStatus, WorkflowState};

/// Receives the final state of a run.
///
/// An `Err` from the sink aborts the run.
#[async_trait]
pub trait ReportSink: fmt::Debug + Send + Sync {
    /// Persists a finished run.
    async fn persist(&self, state: &WorkflowState) -> Result<()>;
}

/// One stage's line in a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEntry {
    /// The stage name.
    pub stage: String,
    /// The final status.
    pub status: StageStatus,
    /// Attempts made.
    pub attempts: u32,
    /// The most recent rejection feedback, if any.
    pub last_feedback: Option<String>,
    /// Whether a rerun was still requested.
    pub rerun_requested: bool,
    /// The recorded output, absent for skipped stages.
    pub output: Option<StageOutput>,
}

/// A finished run, as handed to sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// The run identifier.
    pub run_id: String,
    /// When the report was built.
    pub generated_at: DateTime<Utc>,
    /// One entry per stage in the ledger, in pipeline order.
    pub stages: Vec<ReportEntry>,
    /// Stages that exhausted their attempts without approval.
    pub flagged: Vec<String>,
}

impl Report {
    /// Builds a report from a state.
    pub fn from_state(state: &WorkflowState) -> Self {
        let stages = state
            .stages_in_order()
            .into_iter()
            .map(|stage| ReportEntry {
                stage: stage.to_string(),
                status: state.status(stage),
                attempts: state.attempts(stage),
                last_feedback: state.last_feedback(stage).map(str::to_string),
                rerun_requested: state.rerun_requested(stage),
                output: state.stage_output(stage).cloned(),
            })
            .collect();

        Self {
            run_id: state.run_id().to_string(),
            generated_at: Utc::now(),
            stages,
            flagged: state
                .exhausted_stages()
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }

    /// Returns an entry by stage name.
    pub fn entry(&self, stage: &str) -> Option<&ReportEntry> {
        self.stages.iter().find(|entry| entry.stage == stage)
    }

    /// Renders the report as Markdown.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        // Writing to a String cannot fail.
        let _ = self.write_markdown(&mut out);
        out
    }

    fn write_markdown(&self, out: &mut String) -> fmt::Result {
        writeln!(out, "# Report {}", self.run_id)?;
        writeln!(out)?;
        writeln!(out, "Generated {}", self.generated_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
        writeln!(out)?;

        let approved = self
            .stages
            .iter()
            .filter(|entry| entry.status == StageStatus::Approved)
            .count();
        writeln!(out, "## Summary")?;
        writeln!(out)?;
        writeln!(out, "{} of {} stages approved.", approved, self.stages.len())?;
        if !self.flagged.is_empty() {
            writeln!(
                out,
                "Flagged for review (not approved): {}.",
                self.flagged.join(", ")
            )?;
        }

        for entry in &self.stages {
            writeln!(out)?;
            writeln!(out, "## {}", entry.stage)?;
            writeln!(out)?;
            writeln!(out, "Status: {} after {} attempt(s)", entry.status, entry.attempts)?;
            if let Some(feedback) = &entry.last_feedback {
                writeln!(out, "Last feedback: {}", feedback)?;
            }
            if let Some(output) = &entry.output {
                writeln!(out)?;
                writeln!(out, "{}", output)?;
            }
        }

        Ok(())
    }
}

/// An in-memory [`ReportSink`].
///
/// Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryReportSink {
    reports: Arc<RwLock<Vec<Report>>>,
}

impl MemoryReportSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every persisted report, oldest first.
    pub async fn reports(&self) -> Vec<Report> {
        self.reports.read().await.clone()
    }

    /// Returns the most recent report.
    pub async fn latest(&self) -> Option<Report> {
        self.reports.read().await.last().cloned()
    }

    /// Returns the number of persisted reports.
    pub async fn len(&self) -> usize {
        self.reports.read().await.len()
    }

    /// Returns true if nothing was persisted.
    pub async fn is_empty(&self) -> bool {
        self.reports.read().await.is_empty()
    }
}

#[async_trait]
impl ReportSink for MemoryReportSink {
    async fn persist(&self, state: &WorkflowState) -> Result<()> {
        let report = Report::from_state(state);
        self.reports.write().await.push(report);
        Ok(())
    }
}

/// Writes each report as pretty JSON followed by a newline.
pub struct JsonReportSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonReportSink<W> {
    /// Creates a sink over a writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Returns the writer.
    ///
    /// # Errors
    ///
    /// Returns [`HeddleError::ReportSink`] if a writer panicked mid-write.
    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|_| HeddleError::ReportSink("writer lock poisoned".to_string()))
    }
}

impl<W> fmt::Debug for JsonReportSink<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonReportSink").finish_non_exhaustive()
    }
}

#[async_trait]
impl<W: Write + Send> ReportSink for JsonReportSink<W> {
    async fn persist(&self, state: &WorkflowState) -> Result<()> {
        let report = Report::from_state(state);
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| HeddleError::ReportSink("writer lock poisoned".to_string()))?;
        serde_json::to_writer_pretty(&mut *writer, &report)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}
