//! Scripted collaborators and stages shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Barrier;

use heddle::{
    Generator, HeddleError, Result, Stage, StageContext, StageOutput, StatsProvider,
    UnitOutputs, UnitTolerance, ValidationContext, Validator, Verdict,
};

/// Statistics backed by in-memory tables.
#[derive(Debug, Default)]
pub struct TableStats {
    units: HashMap<String, Vec<String>>,
    data: HashMap<String, Value>,
    failing: HashSet<String>,
    fetches: AtomicU32,
}

impl TableStats {
    /// Four sections of questions plus three countries.
    pub fn survey() -> Self {
        let mut stats = Self::default();
        stats.add("section1", &["Q1", "Q2"]);
        stats.add("section2", &["Q3", "Q4", "Q5"]);
        stats.add("section3", &["Q6"]);
        stats.add("section4", &["Q7", "Q8"]);
        stats.add("country", &["Germany", "Japan", "Brazil"]);
        stats
    }

    pub fn add(&mut self, analysis: &str, units: &[&str]) {
        for (idx, unit) in units.iter().enumerate() {
            self.data.insert(
                unit.to_string(),
                json!({ "unit": unit, "respondents": 100 + idx, "yes_share": 0.5 }),
            );
        }
        self.units
            .insert(analysis.to_string(), units.iter().map(|u| u.to_string()).collect());
    }

    pub fn failing_on(mut self, unit: &str) -> Self {
        self.failing.insert(unit.to_string());
        self
    }

    pub fn fetches(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn unit_count(&self) -> usize {
        self.units.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl StatsProvider for TableStats {
    async fn units(&self, analysis: &str) -> Result<Vec<String>> {
        self.units
            .get(analysis)
            .cloned()
            .ok_or_else(|| HeddleError::StatsProvider(format!("unknown analysis {}", analysis)))
    }

    async fn fetch(&self, unit_id: &str) -> Result<Value> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(unit_id) {
            return Err(HeddleError::StatsProvider(format!("no data for {}", unit_id)));
        }
        self.data
            .get(unit_id)
            .cloned()
            .ok_or_else(|| HeddleError::StatsProvider(format!("unknown unit {}", unit_id)))
    }
}

/// Records every prompt and answers with a numbered reply.
#[derive(Debug, Default)]
pub struct RecordingGenerator {
    prompts: Mutex<Vec<String>>,
}

impl RecordingGenerator {
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn prompts_containing(&self, needle: &str) -> Vec<String> {
        self.prompts()
            .into_iter()
            .filter(|prompt| prompt.contains(needle))
            .collect()
    }
}

#[async_trait]
impl Generator for RecordingGenerator {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let mut prompts = self.prompts.lock().unwrap();
        prompts.push(prompt.to_string());
        Ok(format!("generated text #{}", prompts.len()))
    }
}

/// Rejects chosen stages a fixed number of times.
#[derive(Debug, Default)]
pub struct ScriptedValidator {
    rejections: HashMap<String, u32>,
    broken: HashSet<String>,
    calls: Mutex<Vec<(String, u32)>>,
}

impl ScriptedValidator {
    pub fn approve_all() -> Self {
        Self::default()
    }

    pub fn reject(mut self, stage: &str, times: u32) -> Self {
        self.rejections.insert(stage.to_string(), times);
        self
    }

    pub fn always_reject(self, stage: &str) -> Self {
        self.reject(stage, u32::MAX)
    }

    pub fn broken_on(mut self, stage: &str) -> Self {
        self.broken.insert(stage.to_string());
        self
    }

    pub fn calls(&self) -> Vec<(String, u32)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, stage: &str) -> usize {
        self.calls().iter().filter(|(s, _)| s == stage).count()
    }

    pub fn feedback_for(stage: &str, attempt: u32) -> String {
        format!("REJECTED: {} attempt {} lacks evidence", stage, attempt)
    }
}

#[async_trait]
impl Validator for ScriptedValidator {
    async fn judge(&self, ctx: &ValidationContext, _candidate: &StageOutput) -> Result<Verdict> {
        self.calls
            .lock()
            .unwrap()
            .push((ctx.stage.clone(), ctx.attempt));

        if self.broken.contains(&ctx.stage) {
            return Err(HeddleError::Validator("validator unreachable".to_string()));
        }

        let times = self.rejections.get(&ctx.stage).copied().unwrap_or(0);
        if ctx.attempt <= times {
            Ok(Verdict::reject(Self::feedback_for(&ctx.stage, ctx.attempt)))
        } else {
            Ok(Verdict::approve("APPROVED"))
        }
    }
}

/// A logical clock shared by stages.
#[derive(Debug, Default)]
pub struct Timeline {
    clock: AtomicU64,
    marks: Mutex<Vec<(String, &'static str, u64)>>,
}

impl Timeline {
    pub fn mark(&self, stage: &str, what: &'static str) {
        let tick = self.clock.fetch_add(1, Ordering::SeqCst);
        self.marks.lock().unwrap().push((stage.to_string(), what, tick));
    }

    pub fn first(&self, stage: &str, what: &str) -> Option<u64> {
        self.marks
            .lock()
            .unwrap()
            .iter()
            .find(|(s, w, _)| s == stage && *w == what)
            .map(|(_, _, tick)| *tick)
    }

    pub fn last(&self, stage: &str, what: &str) -> Option<u64> {
        self.marks
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(s, w, _)| s == stage && *w == what)
            .map(|(_, _, tick)| *tick)
    }
}

/// What a [`ScriptedStage`] observed.
#[derive(Debug, Default)]
pub struct Probe {
    pub plans: AtomicU32,
    pub units_run: AtomicU32,
    pub units_finished: AtomicU32,
    pub syntheses: AtomicU32,
    pub feedback: Mutex<Vec<Option<String>>>,
    pub upstream: Mutex<Vec<BTreeMap<String, StageOutput>>>,
    pub unit_sets: Mutex<Vec<UnitOutputs>>,
}

impl Probe {
    pub fn plans(&self) -> u32 {
        self.plans.load(Ordering::SeqCst)
    }

    pub fn units_run(&self) -> u32 {
        self.units_run.load(Ordering::SeqCst)
    }

    pub fn units_finished(&self) -> u32 {
        self.units_finished.load(Ordering::SeqCst)
    }

    pub fn syntheses(&self) -> u32 {
        self.syntheses.load(Ordering::SeqCst)
    }
}

/// A stage whose behavior is set up by the test.
///
/// Each attempt synthesizes `"<name> v<n>"`.
#[derive(Debug, Clone)]
pub struct ScriptedStage {
    name: String,
    units: Vec<String>,
    failing_unit: Option<String>,
    unit_delay: Option<Duration>,
    tolerance: UnitTolerance,
    timeline: Option<Arc<Timeline>>,
    barrier: Option<Arc<Barrier>>,
    probe: Arc<Probe>,
}

impl ScriptedStage {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            units: Vec::new(),
            failing_unit: None,
            unit_delay: None,
            tolerance: UnitTolerance::Strict,
            timeline: None,
            barrier: None,
            probe: Arc::new(Probe::default()),
        }
    }

    pub fn with_units(mut self, units: &[&str]) -> Self {
        self.units = units.iter().map(|u| u.to_string()).collect();
        self
    }

    pub fn failing_unit(mut self, unit: &str) -> Self {
        self.failing_unit = Some(unit.to_string());
        self
    }

    pub fn unit_delay(mut self, delay: Duration) -> Self {
        self.unit_delay = Some(delay);
        self
    }

    pub fn tolerant(mut self) -> Self {
        self.tolerance = UnitTolerance::Tolerant;
        self
    }

    pub fn timeline(mut self, timeline: Arc<Timeline>) -> Self {
        self.timeline = Some(timeline);
        self
    }

    pub fn barrier(mut self, barrier: Arc<Barrier>) -> Self {
        self.barrier = Some(barrier);
        self
    }

    pub fn probe(&self) -> Arc<Probe> {
        Arc::clone(&self.probe)
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn plan_units(&self, ctx: &StageContext) -> Result<Vec<String>> {
        if let Some(timeline) = &self.timeline {
            timeline.mark(&self.name, "start");
        }
        self.probe.plans.fetch_add(1, Ordering::SeqCst);
        self.probe
            .feedback
            .lock()
            .unwrap()
            .push(ctx.feedback().map(str::to_string));
        self.probe.upstream.lock().unwrap().push(ctx.upstream.clone());
        Ok(self.units.clone())
    }

    async fn run_unit(&self, unit: &str, _ctx: &StageContext) -> Result<String> {
        self.probe.units_run.fetch_add(1, Ordering::SeqCst);
        match self.unit_delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
        if self.failing_unit.as_deref() == Some(unit) {
            return Err(HeddleError::StatsProvider(format!("no data for {}", unit)));
        }
        self.probe.units_finished.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{} answer", unit))
    }

    async fn synthesize(&self, units: &UnitOutputs, _ctx: &StageContext) -> Result<Option<String>> {
        self.probe.unit_sets.lock().unwrap().push(units.clone());
        if let Some(barrier) = &self.barrier {
            barrier.wait().await;
        }
        let n = self.probe.syntheses.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(timeline) = &self.timeline {
            timeline.mark(&self.name, "finish");
        }
        Ok(Some(format!("{} v{}", self.name, n)))
    }

    fn tolerance(&self) -> UnitTolerance {
        self.tolerance
    }
}
