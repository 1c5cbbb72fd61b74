//! External collaborators of the orchestrator.
//!
//! The orchestrator never computes statistics, writes prose, or judges it.
//! It talks to three collaborators through these traits:
//!
//! - [`StatsProvider`]: structured input data per analysis unit
//! - [`Generator`]: a single text completion per prompt
//! - [`Validator`]: an approve/reject verdict plus feedback for an output
//!
//! All three are object-safe and `Send + Sync`; stages hold them as
//! `Arc<dyn ...>` and call them concurrently.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{Result, StageOutput, UnitOutputs};

/// Source of the statistics each analysis unit is built from.
#[async_trait]
pub trait StatsProvider: Debug + Send + Sync {
    /// Lists the unit ids of a named analysis (for example the questions of
    /// a survey section, or the countries present in the data).
    ///
    /// Ids must be unique across analyses so that [`fetch`](Self::fetch)
    /// can address them directly.
    async fn units(&self, analysis: &str) -> Result<Vec<String>>;

    /// Fetches the structured data of one unit.
    async fn fetch(&self, unit_id: &str) -> Result<JsonValue>;
}

/// A stateless text generator.
///
/// Every call is self-contained: all context the generator needs is in the
/// prompt.
#[async_trait]
pub trait Generator: Debug + Send + Sync {
    /// Completes a prompt.
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// The verdict of a validation gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    /// Whether the output was approved.
    pub passed: bool,

    /// Human-readable feedback, re-embedded verbatim into retry prompts.
    pub feedback: String,
}

impl Verdict {
    /// An approving verdict.
    pub fn approve(feedback: impl Into<String>) -> Self {
        Self {
            passed: true,
            feedback: feedback.into(),
        }
    }

    /// A rejecting verdict.
    pub fn reject(feedback: impl Into<String>) -> Self {
        Self {
            passed: false,
            feedback: feedback.into(),
        }
    }
}

/// What a validator may look at besides the candidate output.
#[derive(Debug, Clone)]
pub struct ValidationContext {
    /// The stage being judged.
    pub stage: String,

    /// The attempt number being judged, starting at 1.
    pub attempt: u32,

    /// Recorded outputs of the stage's direct dependencies.
    pub upstream: BTreeMap<String, StageOutput>,

    /// The fan-out results behind the candidate.
    pub unit_outputs: UnitOutputs,
}

/// Judges a stage's output.
///
/// Must be idempotent from the orchestrator's point of view. A returned
/// `Err` is an infrastructure failure and aborts the run; a rejection is
/// `Ok(Verdict { passed: false, .. })`.
#[async_trait]
pub trait Validator: Debug + Send + Sync {
    /// Returns the verdict for `candidate`.
    async fn judge(&self, ctx: &ValidationContext, candidate: &StageOutput) -> Result<Verdict>;
}

/// Parses a reply in the `APPROVED` / `REJECTED: <reason>` protocol.
///
/// The verdict passes only if the trimmed reply starts with `APPROVED`,
/// case-insensitively. Anything else, including a malformed reply, is a
/// rejection. The whole reply is kept as feedback.
pub fn parse_verdict(reply: &str) -> Verdict {
    let trimmed = reply.trim();
    Verdict {
        passed: trimmed.to_uppercase().starts_with("APPROVED"),
        feedback: trimmed.to_string(),
    }
}

/// A [`Validator`] that asks a [`Generator`] for an
/// `APPROVED` / `REJECTED: <reason>` reply.
#[derive(Debug, Clone)]
pub struct PromptValidator {
    generator: Arc<dyn Generator>,
    criteria: String,
}

impl PromptValidator {
    /// Creates a validator with the default review criteria.
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self {
            generator,
            criteria: "Review the output for accuracy, consistency, and data support.".to_string(),
        }
    }

    /// Replaces the review criteria.
    pub fn with_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.criteria = criteria.into();
        self
    }

    /// Builds the review prompt for a candidate.
    pub fn prompt(&self, ctx: &ValidationContext, candidate: &StageOutput) -> String {
        let mut prompt = format!(
            "You are a validation agent for {stage}. {criteria}\n\
             If everything is valid, respond with exactly APPROVED.\n\
             If not, respond with exactly REJECTED: <reason>.\n\
             Do not provide any other text.\n\n\
             Output of {stage}:\n{candidate}",
            stage = ctx.stage,
            criteria = self.criteria,
            candidate = candidate,
        );

        if candidate.as_synthesized().is_some() && !ctx.unit_outputs.is_empty() {
            prompt.push_str("\n\nUnit outputs it was built from:\n");
            prompt.push_str(&StageOutput::Units(ctx.unit_outputs.clone()).to_text());
        }

        for (stage, output) in &ctx.upstream {
            prompt.push_str(&format!("\n\nSource material from {}:\n{}", stage, output));
        }

        prompt
    }
}

#[async_trait]
impl Validator for PromptValidator {
    async fn judge(&self, ctx: &ValidationContext, candidate: &StageOutput) -> Result<Verdict> {
        let reply = self.generator.complete(&self.prompt(ctx, candidate)).await?;
        Ok(parse_verdict(&reply))
    }
}
