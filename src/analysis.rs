//! A prompt-driven analysis stage.
//!
//! [`AnalysisStage`] covers the common shape of a report stage: fan out over
//! units (questions, countries, personas), ask the [`Generator`] for a short
//! analysis of each, and optionally ask it once more to merge the results.
//! Retry feedback is appended to every prompt of the attempt.

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    Generator, HeddleError, Result, Stage, StageContext, StatsProvider, UnitOutputs,
    UnitTolerance,
};

/// A unit whose prompt carries its own instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticUnit {
    /// The unit id.
    pub id: String,
    /// Text appended to the unit prompt.
    pub instructions: String,
}

impl StaticUnit {
    /// Creates a static unit.
    pub fn new(id: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            instructions: instructions.into(),
        }
    }
}

/// Where an [`AnalysisStage`] gets its units from.
#[derive(Debug, Clone, Default)]
pub enum UnitSource {
    /// No units; the stage only synthesizes.
    #[default]
    None,
    /// A fixed list.
    Static(Vec<StaticUnit>),
    /// The units of a named analysis, with their statistics.
    Stats {
        /// The analysis passed to [`StatsProvider::units`].
        analysis: String,
    },
}

/// A stage built from prompt templates.
///
/// Templates may use `{stage}` and `{unit}` placeholders.
///
/// # Examples
///
/// ```no_run
/// # use std::sync::Arc;
/// # use heddle::{AnalysisStage, Generator, StatsProvider};
/// # fn build(generator: Arc<dyn Generator>, stats: Arc<dyn StatsProvider>) {
/// let stage = AnalysisStage::new("section1", generator)
///     .with_stats(stats)
///     .fan_out_stats("section1")
///     .unit_prompt("Analyze {unit} of {stage}.")
///     .synthesis_prompt("Summarize the analyses of {stage}.");
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct AnalysisStage {
    name: String,
    generator: Arc<dyn Generator>,
    stats: Option<Arc<dyn StatsProvider>>,
    units: UnitSource,
    unit_prompt: String,
    synthesis_prompt: Option<String>,
    upstream: Vec<String>,
    tolerance: UnitTolerance,
}

impl AnalysisStage {
    /// Creates a stage with no units and no synthesis.
    pub fn new(name: impl Into<String>, generator: Arc<dyn Generator>) -> Self {
        Self {
            name: name.into(),
            generator,
            stats: None,
            units: UnitSource::None,
            unit_prompt: "Analyze {unit} for {stage}.".to_string(),
            synthesis_prompt: None,
            upstream: Vec::new(),
            tolerance: UnitTolerance::Strict,
        }
    }

    /// Sets the statistics source.
    pub fn with_stats(mut self, stats: Arc<dyn StatsProvider>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Fans out over the units of a named analysis.
    ///
    /// Requires [`with_stats`](Self::with_stats).
    pub fn fan_out_stats(mut self, analysis: impl Into<String>) -> Self {
        self.units = UnitSource::Stats {
            analysis: analysis.into(),
        };
        self
    }

    /// Fans out over a fixed list of units.
    pub fn fan_out_static(mut self, units: impl IntoIterator<Item = StaticUnit>) -> Self {
        self.units = UnitSource::Static(units.into_iter().collect());
        self
    }

    /// Sets the per-unit prompt template.
    pub fn unit_prompt(mut self, template: impl Into<String>) -> Self {
        self.unit_prompt = template.into();
        self
    }

    /// Sets the synthesis prompt template, enabling synthesis.
    pub fn synthesis_prompt(mut self, template: impl Into<String>) -> Self {
        self.synthesis_prompt = Some(template.into());
        self
    }

    /// Includes a dependency's output in every prompt.
    pub fn include_upstream(mut self, stage: impl Into<String>) -> Self {
        self.upstream.push(stage.into());
        self
    }

    /// Drops failed units instead of failing the stage.
    pub fn tolerant(mut self) -> Self {
        self.tolerance = UnitTolerance::Tolerant;
        self
    }

    /// Returns the unit source.
    pub fn unit_source(&self) -> &UnitSource {
        &self.units
    }

    fn stats(&self) -> Result<&Arc<dyn StatsProvider>> {
        self.stats.as_ref().ok_or_else(|| {
            HeddleError::StageExecution(format!("stage {} has no stats provider", self.name))
        })
    }

    fn render(&self, template: &str, unit: &str) -> String {
        template.replace("{stage}", &self.name).replace("{unit}", unit)
    }

    fn append_context(&self, prompt: &mut String, ctx: &StageContext) {
        for stage in &self.upstream {
            if let Some(output) = ctx.upstream(stage) {
                let _ = write!(prompt, "\n\n{}:\n{}", stage, output);
            }
        }

        if let Some(feedback) = ctx.feedback() {
            let _ = write!(
                prompt,
                "\n\nPrevious validation feedback: {}\nPlease address these issues.",
                feedback
            );
        }
    }

    /// Builds the prompt of one unit.
    ///
    /// `data` is the unit's statistics, when the units come from a
    /// [`StatsProvider`].
    pub fn unit_prompt_for(
        &self,
        unit: &str,
        data: Option<&serde_json::Value>,
        ctx: &StageContext,
    ) -> Result<String> {
        let mut prompt = self.render(&self.unit_prompt, unit);

        if let UnitSource::Static(units) = &self.units {
            if let Some(entry) = units.iter().find(|entry| entry.id == unit) {
                prompt.push_str("\n\n");
                prompt.push_str(&entry.instructions);
            }
        }

        if let Some(data) = data {
            prompt.push_str("\n\nStatistics:\n");
            prompt.push_str(&serde_json::to_string_pretty(data)?);
        }

        self.append_context(&mut prompt, ctx);
        Ok(prompt)
    }

    /// Builds the synthesis prompt, or `None` if the stage does not
    /// synthesize.
    pub fn synthesis_prompt_for(&self, units: &UnitOutputs, ctx: &StageContext) -> Option<String> {
        let template = self.synthesis_prompt.as_ref()?;
        let mut prompt = self.render(template, "");

        for (unit, text) in units {
            let _ = write!(prompt, "\n\n{}:\n{}", unit, text);
        }

        self.append_context(&mut prompt, ctx);
        Some(prompt)
    }
}

#[async_trait]
impl Stage for AnalysisStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn plan_units(&self, ctx: &StageContext) -> Result<Vec<String>> {
        match &self.units {
            UnitSource::None => Ok(Vec::new()),
            UnitSource::Static(units) => Ok(units.iter().map(|unit| unit.id.clone()).collect()),
            UnitSource::Stats { analysis } => {
                let stats = self.stats()?;
                ctx.call("stats provider", stats.units(analysis)).await
            }
        }
    }

    async fn run_unit(&self, unit: &str, ctx: &StageContext) -> Result<String> {
        let data = match &self.units {
            UnitSource::Stats { .. } => {
                let stats = self.stats()?;
                Some(ctx.call("stats provider", stats.fetch(unit)).await?)
            }
            _ => None,
        };

        let prompt = self.unit_prompt_for(unit, data.as_ref(), ctx)?;
        ctx.call("generator", self.generator.complete(&prompt)).await
    }

    async fn synthesize(&self, units: &UnitOutputs, ctx: &StageContext) -> Result<Option<String>> {
        let Some(prompt) = self.synthesis_prompt_for(units, ctx) else {
            return Ok(None);
        };
        let text = ctx.call("generator", self.generator.complete(&prompt)).await?;
        Ok(Some(text))
    }

    fn tolerance(&self) -> UnitTolerance {
        self.tolerance
    }
}
