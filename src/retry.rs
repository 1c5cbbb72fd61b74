//! Bounded per-stage retry driven by validation verdicts.
//!
//! The controller owns the state machine
//!
//! ```text
//! Pending -> Running -> Approved
//!                    -> RejectedRetryable -> Running ...
//!                    -> RejectedExhausted
//! ```
//!
//! for one stage. It is the only code that touches `attempt_counts`,
//! `last_feedback`, `rerun_requested` and the stage's ledger status. Retries
//! are local: resolving one stage never touches another stage's entries.

use tracing::{info, warn};

use crate::collaborator::Verdict;
use crate::event::Emitter;
use crate::{StageOutput, StageStatus, WorkflowState};

/// The outcome of resolving a verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The output was approved and recorded.
    Approved {
        /// The approved attempt.
        attempt: u32,
    },

    /// The output was rejected below the ceiling; the stage runs again.
    Retry {
        /// The rejected attempt.
        attempt: u32,
        /// Feedback injected into the next attempt.
        feedback: String,
    },

    /// The output was rejected at the ceiling and recorded anyway.
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// The final feedback.
        feedback: String,
    },
}

impl Transition {
    /// Returns true if the stage reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Transition::Retry { .. })
    }
}

/// Drives one stage's attempts against its ceiling.
#[derive(Debug, Clone)]
pub struct RetryController {
    stage: String,
    max_attempts: u32,
}

impl RetryController {
    /// Creates a controller. A ceiling of 0 is treated as 1.
    pub fn new(stage: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            stage: stage.into(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Returns the stage this controller drives.
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Returns the attempt ceiling.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns true if the stage may start another attempt.
    pub fn can_start(&self, state: &WorkflowState) -> bool {
        matches!(
            state.status(&self.stage),
            StageStatus::Pending | StageStatus::RejectedRetryable
        ) && state.attempts(&self.stage) < self.max_attempts
    }

    /// Moves the stage to `Running` and returns the new attempt number.
    ///
    /// Callers must check [`can_start`](Self::can_start) first.
    pub(crate) fn begin(&self, state: &mut WorkflowState) -> u32 {
        let attempt = state.increment_attempt(&self.stage);
        state.set_phase(&self.stage);
        state.record_mut(&self.stage).mark_running();
        attempt
    }

    /// Closes a stage that was waiting for a retry but has no attempts left.
    ///
    /// Happens when a state is resumed under a lower ceiling than the one
    /// it was rejected under. No candidate survives a rejection, so the
    /// stage is flagged without an output.
    pub(crate) fn exhaust(&self, state: &mut WorkflowState, events: &Emitter) -> Transition {
        let stage = self.stage.as_str();
        let attempts = state.attempts(stage);
        let feedback = state.last_feedback(stage).unwrap_or_default().to_string();

        state.set_rerun(stage, false);
        state.record_mut(stage).mark_exhausted();
        warn!(
            stage,
            attempts,
            max_attempts = self.max_attempts,
            "stage awaiting retry is past its ceiling, flagging it"
        );
        events.stage_exhausted(stage, attempts, feedback.clone());
        Transition::Exhausted { attempts, feedback }
    }

    /// Applies a verdict to the candidate output of the running attempt.
    pub(crate) fn resolve(
        &self,
        state: &mut WorkflowState,
        candidate: StageOutput,
        verdict: Verdict,
        events: &Emitter,
    ) -> Transition {
        let stage = self.stage.as_str();
        let attempt = state.attempts(stage);

        if verdict.passed {
            state.write_stage_output(stage, candidate);
            state.set_rerun(stage, false);
            state.record_mut(stage).mark_approved();
            info!(stage, attempt, "stage approved");
            events.stage_approved(stage, attempt);
            return Transition::Approved { attempt };
        }

        state.set_feedback(stage, verdict.feedback.clone());

        if attempt < self.max_attempts {
            state.set_rerun(stage, true);
            state.record_mut(stage).mark_retryable();
            info!(
                stage,
                attempt,
                max_attempts = self.max_attempts,
                feedback = %verdict.feedback,
                "stage rejected, retrying"
            );
            events.stage_rejected(stage, attempt, verdict.feedback.clone());
            Transition::Retry {
                attempt,
                feedback: verdict.feedback,
            }
        } else {
            state.write_stage_output(stage, candidate);
            state.set_rerun(stage, false);
            state.record_mut(stage).mark_exhausted();
            warn!(
                stage,
                attempts = attempt,
                feedback = %verdict.feedback,
                "stage rejected at retry ceiling, keeping last output"
            );
            events.stage_exhausted(stage, attempt, verdict.feedback.clone());
            Transition::Exhausted {
                attempts: attempt,
                feedback: verdict.feedback,
            }
        }
    }
}
