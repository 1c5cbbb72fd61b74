//! Runs the survey report pipeline against canned collaborators.
//!
//! ```text
//! RUST_LOG=heddle=debug cargo run --example survey_report
//! ```
//!
//! The reviewer rejects the first combined summary, so the log shows one
//! retry carrying the reviewer's feedback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use heddle::{
    survey_pipeline, Generator, HeddleError, MemoryReportSink, OrchestratorConfig,
    PromptValidator, Result, StatsProvider, WorkflowState,
};

const CONFIG: &str = r#"
max_attempts = 3
worker_pool_size = 4
call_timeout_secs = 10

[[stages]]
id = "country"
tolerance = "tolerant"
"#;

#[derive(Debug)]
struct CannedStats {
    units: HashMap<&'static str, Vec<&'static str>>,
}

impl CannedStats {
    fn new() -> Self {
        let mut units = HashMap::new();
        units.insert("section1", vec!["Q1", "Q2"]);
        units.insert("section2", vec!["Q3", "Q4"]);
        units.insert("section3", vec!["Q5"]);
        units.insert("section4", vec!["Q6", "Q7"]);
        units.insert("country", vec!["Germany", "Japan", "Brazil"]);
        Self { units }
    }
}

#[async_trait]
impl StatsProvider for CannedStats {
    async fn units(&self, analysis: &str) -> Result<Vec<String>> {
        self.units
            .get(analysis)
            .map(|units| units.iter().map(|u| u.to_string()).collect())
            .ok_or_else(|| HeddleError::StatsProvider(format!("no analysis named {}", analysis)))
    }

    async fn fetch(&self, unit_id: &str) -> Result<Value> {
        let seed = unit_id.bytes().map(u32::from).sum::<u32>();
        Ok(json!({
            "unit": unit_id,
            "respondents": 120 + seed % 80,
            "answers": {
                "Yes": 40 + seed % 30,
                "No": 20 + seed % 15,
                "Not sure": 5 + seed % 10,
            },
        }))
    }
}

/// Writes one line per prompt, naming what it was asked about.
#[derive(Debug)]
struct CannedWriter;

#[async_trait]
impl Generator for CannedWriter {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let topic = prompt.lines().next().unwrap_or_default();
        let topic: String = topic.chars().take(72).collect();
        let revised = if prompt.contains("Previous validation feedback") {
            " (revised)"
        } else {
            ""
        };
        Ok(format!("Findings for: {}{}", topic, revised))
    }
}

/// Approves everything except the first combined summary.
#[derive(Debug, Default)]
struct CannedReviewer {
    combined_reviews: AtomicU32,
}

#[async_trait]
impl Generator for CannedReviewer {
    async fn complete(&self, prompt: &str) -> Result<String> {
        if prompt.contains("validation agent for combined")
            && self.combined_reviews.fetch_add(1, Ordering::SeqCst) == 0
        {
            return Ok("REJECTED: The summary does not name the weakest section.".to_string());
        }
        Ok("APPROVED".to_string())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .init();

    let config = OrchestratorConfig::from_toml_str(CONFIG)?;
    let sink = Arc::new(MemoryReportSink::new());
    let reviewer = PromptValidator::new(Arc::new(CannedReviewer::default()))
        .with_criteria("Check that every claim is supported by the source data.");

    let workflow = survey_pipeline(Arc::new(CannedStats::new()), Arc::new(CannedWriter))
        .configure(&config)
        .validator(Arc::new(reviewer))
        .report_sink(sink.clone())
        .build()?;

    let mut state = WorkflowState::new();
    workflow.run(&mut state).await?;

    println!("{}", workflow.status(&state)?);
    if let Some(report) = sink.latest().await {
        println!("{}", report.to_markdown());
    }

    Ok(())
}
