//! Run events.
//!
//! [`WorkflowEvent`]s are broadcast while a run executes: stage dispatch,
//! unit progress, validation outcomes, and the end of the run. Subscribe
//! through [`Workflow::subscribe`](crate::Workflow::subscribe) to drive
//! logging, progress displays, or tests.

use tokio::sync::broadcast;

/// An event emitted during a run.
///
/// Every event carries the run id, so that a subscriber shared by several
/// runs can tell them apart.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum WorkflowEvent {
    /// A stage attempt was dispatched.
    StageStarted {
        /// The run identifier.
        run_id: String,
        /// The stage name.
        stage: String,
        /// The attempt number, starting at 1.
        attempt: u32,
    },

    /// A stage planned its units and started fanning out.
    FanOutStarted {
        /// The run identifier.
        run_id: String,
        /// The stage name.
        stage: String,
        /// The planned unit ids, in dispatch order.
        units: Vec<String>,
    },

    /// A unit acquired a worker and started.
    UnitStarted {
        /// The run identifier.
        run_id: String,
        /// The owning stage.
        stage: String,
        /// The unit id.
        unit: String,
    },

    /// A unit returned its output.
    UnitCompleted {
        /// The run identifier.
        run_id: String,
        /// The owning stage.
        stage: String,
        /// The unit id.
        unit: String,
    },

    /// A unit failed.
    UnitFailed {
        /// The run identifier.
        run_id: String,
        /// The owning stage.
        stage: String,
        /// The unit id.
        unit: String,
        /// Error message describing the failure.
        error: String,
    },

    /// The validator approved a stage's output.
    StageApproved {
        /// The run identifier.
        run_id: String,
        /// The stage name.
        stage: String,
        /// The approved attempt.
        attempt: u32,
    },

    /// The validator rejected a stage's output and a retry is queued.
    StageRejected {
        /// The run identifier.
        run_id: String,
        /// The stage name.
        stage: String,
        /// The rejected attempt.
        attempt: u32,
        /// The validator's feedback.
        feedback: String,
    },

    /// The validator rejected a stage's output at its attempt ceiling.
    StageExhausted {
        /// The run identifier.
        run_id: String,
        /// The stage name.
        stage: String,
        /// Attempts made.
        attempts: u32,
        /// The final feedback.
        feedback: String,
    },

    /// A stage was skipped because its edge conditions were not met.
    StageSkipped {
        /// The run identifier.
        run_id: String,
        /// The stage name.
        stage: String,
    },

    /// A stage hit a fatal error.
    StageFailed {
        /// The run identifier.
        run_id: String,
        /// The stage name.
        stage: String,
        /// Error message describing the failure.
        error: String,
    },

    /// Every stage reached a terminal status.
    RunCompleted {
        /// The run identifier.
        run_id: String,
    },

    /// The run aborted on a fatal error.
    RunAborted {
        /// The run identifier.
        run_id: String,
        /// The stage the error occurred in.
        stage: String,
        /// Error message describing the failure.
        error: String,
    },
}

impl WorkflowEvent {
    /// Returns the run ID for this event.
    pub fn run_id(&self) -> &str {
        match self {
            Self::StageStarted { run_id, .. }
            | Self::FanOutStarted { run_id, .. }
            | Self::UnitStarted { run_id, .. }
            | Self::UnitCompleted { run_id, .. }
            | Self::UnitFailed { run_id, .. }
            | Self::StageApproved { run_id, .. }
            | Self::StageRejected { run_id, .. }
            | Self::StageExhausted { run_id, .. }
            | Self::StageSkipped { run_id, .. }
            | Self::StageFailed { run_id, .. }
            | Self::RunCompleted { run_id }
            | Self::RunAborted { run_id, .. } => run_id,
        }
    }

    /// Returns the stage name for this event, if applicable.
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::StageStarted { stage, .. }
            | Self::FanOutStarted { stage, .. }
            | Self::UnitStarted { stage, .. }
            | Self::UnitCompleted { stage, .. }
            | Self::UnitFailed { stage, .. }
            | Self::StageApproved { stage, .. }
            | Self::StageRejected { stage, .. }
            | Self::StageExhausted { stage, .. }
            | Self::StageSkipped { stage, .. }
            | Self::StageFailed { stage, .. }
            | Self::RunAborted { stage, .. } => Some(stage),
            Self::RunCompleted { .. } => None,
        }
    }

    /// Returns true if this is an error event.
    ///
    /// Rejections are not errors.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::StageFailed { .. } | Self::UnitFailed { .. } | Self::RunAborted { .. }
        )
    }

    /// Returns true if this event ends a stage or the run.
    pub fn is_completion(&self) -> bool {
        matches!(
            self,
            Self::StageApproved { .. }
                | Self::StageExhausted { .. }
                | Self::StageSkipped { .. }
                | Self::RunCompleted { .. }
        )
    }
}

/// Sends events for one run.
///
/// Cheap to clone into spawned attempt and unit tasks.
#[derive(Debug, Clone)]
pub(crate) struct Emitter {
    tx: broadcast::Sender<WorkflowEvent>,
    run_id: String,
}

impl Emitter {
    pub(crate) fn new(tx: broadcast::Sender<WorkflowEvent>, run_id: impl Into<String>) -> Self {
        Self {
            tx,
            run_id: run_id.into(),
        }
    }

    pub(crate) fn run_id(&self) -> &str {
        &self.run_id
    }

    pub(crate) fn emit(&self, event: WorkflowEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.tx.send(event);
    }

    pub(crate) fn stage_started(&self, stage: &str, attempt: u32) {
        self.emit(WorkflowEvent::StageStarted {
            run_id: self.run_id.clone(),
            stage: stage.to_string(),
            attempt,
        });
    }

    pub(crate) fn fan_out_started(&self, stage: &str, units: Vec<String>) {
        self.emit(WorkflowEvent::FanOutStarted {
            run_id: self.run_id.clone(),
            stage: stage.to_string(),
            units,
        });
    }

    pub(crate) fn unit_started(&self, stage: &str, unit: &str) {
        self.emit(WorkflowEvent::UnitStarted {
            run_id: self.run_id.clone(),
            stage: stage.to_string(),
            unit: unit.to_string(),
        });
    }

    pub(crate) fn unit_completed(&self, stage: &str, unit: &str) {
        self.emit(WorkflowEvent::UnitCompleted {
            run_id: self.run_id.clone(),
            stage: stage.to_string(),
            unit: unit.to_string(),
        });
    }

    pub(crate) fn unit_failed(&self, stage: &str, unit: &str, error: String) {
        self.emit(WorkflowEvent::UnitFailed {
            run_id: self.run_id.clone(),
            stage: stage.to_string(),
            unit: unit.to_string(),
            error,
        });
    }

    pub(crate) fn stage_approved(&self, stage: &str, attempt: u32) {
        self.emit(WorkflowEvent::StageApproved {
            run_id: self.run_id.clone(),
            stage: stage.to_string(),
            attempt,
        });
    }

    pub(crate) fn stage_rejected(&self, stage: &str, attempt: u32, feedback: String) {
        self.emit(WorkflowEvent::StageRejected {
            run_id: self.run_id.clone(),
            stage: stage.to_string(),
            attempt,
            feedback,
        });
    }

    pub(crate) fn stage_exhausted(&self, stage: &str, attempts: u32, feedback: String) {
        self.emit(WorkflowEvent::StageExhausted {
            run_id: self.run_id.clone(),
            stage: stage.to_string(),
            attempts,
            feedback,
        });
    }

    pub(crate) fn stage_skipped(&self, stage: &str) {
        self.emit(WorkflowEvent::StageSkipped {
            run_id: self.run_id.clone(),
            stage: stage.to_string(),
        });
    }

    pub(crate) fn stage_failed(&self, stage: &str, error: String) {
        self.emit(WorkflowEvent::StageFailed {
            run_id: self.run_id.clone(),
            stage: stage.to_string(),
            error,
        });
    }

    pub(crate) fn run_completed(&self) {
        self.emit(WorkflowEvent::RunCompleted {
            run_id: self.run_id.clone(),
        });
    }

    pub(crate) fn run_aborted(&self, stage: &str, error: String) {
        self.emit(WorkflowEvent::RunAborted {
            run_id: self.run_id.clone(),
            stage: stage.to_string(),
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_run_id() {
        let event = WorkflowEvent::StageStarted {
            run_id: "run-1".to_string(),
            stage: "section1".to_string(),
            attempt: 1,
        };
        assert_eq!(event.run_id(), "run-1");
    }

    #[test]
    fn test_event_stage() {
        let event = WorkflowEvent::StageApproved {
            run_id: "run-1".to_string(),
            stage: "combined".to_string(),
            attempt: 2,
        };
        assert_eq!(event.stage(), Some("combined"));

        let event = WorkflowEvent::RunCompleted {
            run_id: "run-1".to_string(),
        };
        assert_eq!(event.stage(), None);
    }

    #[test]
    fn test_is_error() {
        let rejected = WorkflowEvent::StageRejected {
            run_id: "x".to_string(),
            stage: "s".to_string(),
            attempt: 1,
            feedback: "REJECTED: vague".to_string(),
        };
        assert!(!rejected.is_error());

        let failure = WorkflowEvent::UnitFailed {
            run_id: "x".to_string(),
            stage: "s".to_string(),
            unit: "q1".to_string(),
            error: "err".to_string(),
        };
        assert!(failure.is_error());
    }

    #[test]
    fn test_is_completion() {
        let exhausted = WorkflowEvent::StageExhausted {
            run_id: "x".to_string(),
            stage: "s".to_string(),
            attempts: 3,
            feedback: "still wrong".to_string(),
        };
        assert!(exhausted.is_completion());

        let started = WorkflowEvent::UnitStarted {
            run_id: "x".to_string(),
            stage: "s".to_string(),
            unit: "q1".to_string(),
        };
        assert!(!started.is_completion());
    }

    #[tokio::test]
    async fn test_emitter_stamps_run_id() {
        let (tx, mut rx) = broadcast::channel(16);
        let emitter = Emitter::new(tx, "run-7");

        emitter.stage_started("country", 1);
        emitter.unit_completed("country", "DE");

        let first = rx.recv().await.unwrap();
        assert_eq!(
            first,
            WorkflowEvent::StageStarted {
                run_id: "run-7".to_string(),
                stage: "country".to_string(),
                attempt: 1,
            }
        );
        let second = rx.recv().await.unwrap();
        assert_eq!(second.run_id(), emitter.run_id());
        assert!(matches!(second, WorkflowEvent::UnitCompleted { ref unit, .. } if unit == "DE"));
    }

    #[test]
    fn test_emitter_without_subscribers() {
        let (tx, rx) = broadcast::channel(4);
        drop(rx);
        let emitter = Emitter::new(tx, "run-1");
        emitter.run_completed();
    }
}
