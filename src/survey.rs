//! The survey report pipeline.
//!
//! Seven stages:
//!
//! ```text
//! section1 ─┐
//! section2 ─┤
//! section3 ─┼─> combined ─> country ─┐
//! section4 ─┘        │                ├─> personas
//!                    └────────────────┘
//! ```
//!
//! Each section fans out over its questions and merges the answers into a
//! section summary. `combined` merges the four summaries. `country` fans
//! out over the countries in the data, and `personas` reads the combined
//! and country findings from three perspectives.

use std::sync::Arc;

use crate::{AnalysisStage, Generator, StaticUnit, StatsProvider, Workflow, WorkflowBuilder};

/// The section stages, in report order.
pub const SECTIONS: [&str; 4] = ["section1", "section2", "section3", "section4"];

/// The cross-section summary stage.
pub const COMBINED: &str = "combined";

/// The per-country analysis stage.
pub const COUNTRY: &str = "country";

/// The persona interpretation stage.
pub const PERSONAS: &str = "personas";

/// The analysis [`COUNTRY`] fans out over.
pub const COUNTRY_ANALYSIS: &str = "country";

const QUESTION_PROMPT: &str = "You are an expert analyst for {stage}, question {unit}. \
Give a short, reasoned analysis of the data below. \
Use specific data points only as evidence for your analysis. \
Be concise (1-2 sentences).";

const SECTION_PROMPT: &str = "You are the moderator for {stage}. \
Summarize the question analyses below into a cohesive narrative for the section, \
highlighting key trends and notable differences.";

const COMBINED_PROMPT: &str = "You are a combined analysis moderator. \
Analyze the section summaries below and give an overall summary of global trends, \
strengths, weaknesses, and unique characteristics. \
Focus on the analysis, not on repeating the data.";

const COUNTRY_PROMPT: &str = "You are an expert analyst. Based on the demographic and \
statistical data for {unit} below, describe what makes this country stand out. \
Identify outliers and unusual patterns, and use specific data points as evidence. \
Do not use information that is not in the data.";

const PERSONA_PROMPT: &str = "Interpret the findings below from the perspective of a {unit}. \
What stands out? What actions or concerns would you have? Keep it to at most 2 sentences.";

/// The persona units.
pub fn persona_units() -> Vec<StaticUnit> {
    vec![
        StaticUnit::new("Customer", "You are a customer."),
        StaticUnit::new("Business Customer", "You are a business customer."),
        StaticUnit::new("Vendor", "You are the vendor of the surveyed product."),
    ]
}

/// Builds the survey report pipeline.
///
/// The returned builder still needs a validator, and may take a report
/// sink, a configuration, or more stages before
/// [`build`](WorkflowBuilder::build).
pub fn survey_pipeline(
    stats: Arc<dyn StatsProvider>,
    generator: Arc<dyn Generator>,
) -> WorkflowBuilder {
    let mut builder = Workflow::builder();

    for section in SECTIONS {
        let stage = AnalysisStage::new(section, generator.clone())
            .with_stats(stats.clone())
            .fan_out_stats(section)
            .unit_prompt(QUESTION_PROMPT)
            .synthesis_prompt(SECTION_PROMPT);
        builder = builder.stage(section, stage);
    }

    let mut combined = AnalysisStage::new(COMBINED, generator.clone()).synthesis_prompt(COMBINED_PROMPT);
    for section in SECTIONS {
        combined = combined.include_upstream(section);
    }
    builder = builder.stage(COMBINED, combined);
    for section in SECTIONS {
        builder = builder.dependency(COMBINED, section);
    }

    let country = AnalysisStage::new(COUNTRY, generator.clone())
        .with_stats(stats)
        .fan_out_stats(COUNTRY_ANALYSIS)
        .unit_prompt(COUNTRY_PROMPT);
    builder = builder.stage(COUNTRY, country).dependency(COUNTRY, COMBINED);

    let personas = AnalysisStage::new(PERSONAS, generator)
        .fan_out_static(persona_units())
        .unit_prompt(PERSONA_PROMPT)
        .include_upstream(COMBINED)
        .include_upstream(COUNTRY);

    builder
        .stage(PERSONAS, personas)
        .dependency(PERSONAS, COMBINED)
        .dependency(PERSONAS, COUNTRY)
        .fan_out(PERSONAS, 3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Result, StageOutput, ValidationContext, Validator, Verdict};
    use async_trait::async_trait;
    use serde_json::Value;

    #[derive(Debug)]
    struct NoStats;

    #[async_trait]
    impl StatsProvider for NoStats {
        async fn units(&self, _analysis: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn fetch(&self, _unit_id: &str) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    #[derive(Debug)]
    struct Echo;

    #[async_trait]
    impl Generator for Echo {
        async fn complete(&self, prompt: &str) -> Result<String> {
            Ok(prompt.len().to_string())
        }
    }

    #[derive(Debug)]
    struct ApproveAll;

    #[async_trait]
    impl Validator for ApproveAll {
        async fn judge(&self, _ctx: &ValidationContext, _candidate: &StageOutput) -> Result<Verdict> {
            Ok(Verdict::approve("APPROVED"))
        }
    }

    fn workflow() -> Workflow {
        survey_pipeline(Arc::new(NoStats), Arc::new(Echo))
            .validator(Arc::new(ApproveAll))
            .build()
            .unwrap()
    }

    #[test]
    fn test_pipeline_shape() {
        let workflow = workflow();
        assert_eq!(workflow.stage_count(), 7);

        let mut roots = workflow.root_stages();
        roots.sort();
        assert_eq!(roots, SECTIONS.to_vec());
        assert_eq!(workflow.leaf_stages(), vec![PERSONAS]);

        let mut deps = workflow.dependencies(COMBINED).unwrap();
        deps.sort();
        assert_eq!(deps, SECTIONS.to_vec());

        let mut deps = workflow.dependencies(PERSONAS).unwrap();
        deps.sort();
        assert_eq!(deps, vec![COMBINED, COUNTRY]);
    }

    #[test]
    fn test_topological_order() {
        let workflow = workflow();
        let order = workflow.stages();
        let position = |name: &str| order.iter().position(|s| s == name).unwrap();

        for section in SECTIONS {
            assert!(position(section) < position(COMBINED));
        }
        assert!(position(COMBINED) < position(COUNTRY));
        assert!(position(COUNTRY) < position(PERSONAS));
    }

    #[test]
    fn test_persona_units() {
        let ids: Vec<_> = persona_units().into_iter().map(|unit| unit.id).collect();
        assert_eq!(ids, vec!["Customer", "Business Customer", "Vendor"]);
    }
}
