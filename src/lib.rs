//! # Heddle
//!
//! A validation-gated report orchestrator backed by a
//! [petgraph](https://docs.rs/petgraph) DAG.
//!
//! Heddle turns precomputed statistics into a multi-section narrative
//! report. Each stage fans out over its units (survey questions, countries,
//! personas), joins the results, optionally synthesizes them into one text,
//! and passes the output through a validation gate. A rejected output is
//! re-run with the validator's feedback, up to a per-stage attempt ceiling;
//! after that the last output is kept and flagged for review.
//!
//! - Independent stages run concurrently
//! - Units of a stage run on a bounded worker pool
//! - Only the executor writes the [`WorkflowState`], and only after an
//!   attempt has completed
//! - Any infrastructure error aborts the run and names the failing stage
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use heddle::{survey_pipeline, MemoryReportSink, PromptValidator, WorkflowState};
//!
//! let sink = Arc::new(MemoryReportSink::new());
//! let workflow = survey_pipeline(stats, generator.clone())
//!     .validator(Arc::new(PromptValidator::new(generator)))
//!     .report_sink(sink.clone())
//!     .build()?;
//!
//! let mut state = WorkflowState::new();
//! workflow.run(&mut state).await?;
//! println!("{}", workflow.status(&state)?);
//! ```
//!
//! ## Design Philosophy
//!
//! The name comes from the **heddle**, the part of a loom that lifts
//! selected warp threads so the weft can pass between them. Stages are the
//! threads; the validation gate decides which of them get lifted again.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![forbid(unsafe_code)]

pub mod analysis;
pub mod collaborator;
pub mod config;
pub mod error;
pub mod event;
mod executor;
mod fanout;
pub mod guard;
pub mod report;
pub mod retry;
pub mod stage;
pub mod state;
pub mod status;
pub mod survey;
pub mod workflow;

pub use analysis::{AnalysisStage, StaticUnit, UnitSource};
pub use collaborator::{
    parse_verdict, Generator, PromptValidator, StatsProvider, ValidationContext, Validator,
    Verdict,
};
pub use config::{EdgeConfig, OrchestratorConfig, StageConfig};
pub use error::{HeddleError, Result};
pub use event::WorkflowEvent;
pub use guard::CallGuard;
pub use report::{JsonReportSink, MemoryReportSink, Report, ReportEntry, ReportSink};
pub use retry::{RetryController, Transition};
pub use stage::{Stage, StageContext, UnitTolerance};
pub use state::{union_units, StageOutput, StageRecord, StageStatus, UnitOutputs, WorkflowState};
pub use status::{PipelineStatus, StageStatusEntry};
pub use survey::survey_pipeline;
pub use workflow::{EdgeCondition, Workflow, WorkflowBuilder};

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_returns_valid_semver() {
        let version = version();
        assert!(!version.is_empty());
        assert!(version.contains('.'));
    }
}
