//! Fan-out/fan-in over a stage's units.
//!
//! One [`UnitPool`] exists per stage attempt. It runs every planned unit as
//! its own task in a `JoinSet`, gated by a semaphore of `size` permits, and
//! returns only after every task has finished. Results come back to the
//! caller; units never write shared state.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::event::Emitter;
use crate::{union_units, HeddleError, Result, Stage, StageContext, StageOutput, UnitOutputs, UnitTolerance};

/// The joined result of one stage attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StageRun {
    /// The candidate output to validate.
    pub(crate) output: StageOutput,
    /// Every unit output that entered the candidate.
    pub(crate) units: UnitOutputs,
}

/// A bounded pool for one fan-out.
#[derive(Debug, Clone, Copy)]
pub(crate) struct UnitPool {
    size: usize,
}

impl UnitPool {
    /// Creates a pool with `size` workers. A size of 0 is treated as 1.
    pub(crate) fn new(size: usize) -> Self {
        Self { size: size.max(1) }
    }

    /// Runs every unit and waits for all of them.
    ///
    /// Results are returned in dispatch order, one per unit, whatever the
    /// completion order was.
    pub(crate) async fn run(
        &self,
        stage: Arc<dyn Stage>,
        ctx: Arc<StageContext>,
        units: Vec<String>,
        events: &Emitter,
    ) -> Vec<(String, Result<String>)> {
        let permits = Arc::new(Semaphore::new(self.size));
        let mut tasks = JoinSet::new();

        for (idx, unit) in units.iter().enumerate() {
            let stage = Arc::clone(&stage);
            let ctx = Arc::clone(&ctx);
            let permits = Arc::clone(&permits);
            let events = events.clone();
            let unit = unit.clone();
            let span = info_span!("unit", unit = %unit);

            tasks.spawn(
                async move {
                    let permit = tokio::select! {
                        biased;
                        _ = ctx.guard.cancel_token().cancelled() => {
                            return (idx, Err(HeddleError::Cancelled));
                        }
                        permit = permits.acquire_owned() => permit,
                    };
                    let _permit = match permit {
                        Ok(permit) => permit,
                        Err(_) => {
                            return (
                                idx,
                                Err(HeddleError::StageExecution("worker pool closed".to_string())),
                            );
                        }
                    };

                    events.unit_started(&ctx.stage_name, &unit);
                    let result = stage.run_unit(&unit, &ctx).await;
                    match &result {
                        Ok(_) => {
                            debug!("unit completed");
                            events.unit_completed(&ctx.stage_name, &unit);
                        }
                        Err(e) => {
                            debug!(error = %e, "unit failed");
                            events.unit_failed(&ctx.stage_name, &unit, e.to_string());
                        }
                    }
                    (idx, result)
                }
                .instrument(span),
            );
        }

        let mut slots: Vec<Option<Result<String>>> = units.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, result)) => slots[idx] = Some(result),
                Err(e) => warn!(error = %e, "unit task did not finish"),
            }
        }

        units
            .into_iter()
            .zip(slots)
            .map(|(unit, slot)| {
                let result = slot.unwrap_or_else(|| {
                    Err(HeddleError::StageExecution(format!(
                        "unit {} panicked or was aborted",
                        unit
                    )))
                });
                (unit, result)
            })
            .collect()
    }
}

/// Runs one attempt of a stage: plan, fan out, join, synthesize.
///
/// `fan_out` is the declared unit cardinality, if any; a plan of a
/// different size is an error.
pub(crate) async fn execute(
    stage: Arc<dyn Stage>,
    ctx: Arc<StageContext>,
    pool: UnitPool,
    fan_out: Option<usize>,
    tolerance: UnitTolerance,
    events: &Emitter,
) -> Result<StageRun> {
    let stage_name = ctx.stage_name.clone();
    let units = stage.plan_units(&ctx).await?;

    let mut seen = HashSet::new();
    for unit in &units {
        if !seen.insert(unit.as_str()) {
            return Err(HeddleError::DuplicateUnit {
                stage: stage_name,
                unit: unit.clone(),
            });
        }
    }

    if let Some(expected) = fan_out {
        if units.len() != expected {
            return Err(HeddleError::StageExecution(format!(
                "stage {} planned {} units, expected {}",
                stage_name,
                units.len(),
                expected
            )));
        }
    }

    let unit_count = units.len();
    let results = if units.is_empty() {
        Vec::new()
    } else {
        events.fan_out_started(&stage_name, units.clone());
        let span = info_span!("fanout", stage = %stage_name, unit_count, workers = pool.size);
        async {
            info!("starting fan-out");
            let results = pool.run(Arc::clone(&stage), Arc::clone(&ctx), units, events).await;
            info!("fan-in complete");
            results
        }
        .instrument(span)
        .await
    };

    let collected = apply_tolerance(&stage_name, results, tolerance)?;
    let units = union_units(&stage_name, collected)?;

    let output = match stage.synthesize(&units, &ctx).await? {
        Some(text) => StageOutput::Synthesized(text),
        None => StageOutput::Units(units.clone()),
    };

    Ok(StageRun { output, units })
}

/// Splits joined results into kept outputs or a stage error.
fn apply_tolerance(
    stage: &str,
    results: Vec<(String, Result<String>)>,
    tolerance: UnitTolerance,
) -> Result<Vec<(String, String)>> {
    let total = results.len();
    let mut kept = Vec::with_capacity(total);
    let mut first_failure: Option<(String, HeddleError)> = None;

    for (unit, result) in results {
        match result {
            Ok(text) => kept.push((unit, text)),
            // Cancellation and timeouts are run-level failures, never a unit's.
            Err(e @ HeddleError::Cancelled) | Err(e @ HeddleError::Timeout { .. }) => return Err(e),
            Err(e) => match tolerance {
                UnitTolerance::Strict => {
                    if first_failure.is_none() {
                        first_failure = Some((unit, e));
                    }
                }
                UnitTolerance::Tolerant => {
                    warn!(stage, unit = %unit, error = %e, "dropping failed unit");
                    if first_failure.is_none() {
                        first_failure = Some((unit, e));
                    }
                }
            },
        }
    }

    match (tolerance, first_failure) {
        (_, None) => Ok(kept),
        (UnitTolerance::Strict, Some((unit, e))) => Err(HeddleError::UnitFailed {
            stage: stage.to_string(),
            unit,
            source: Box::new(e),
        }),
        (UnitTolerance::Tolerant, Some((unit, e))) if kept.is_empty() => {
            Err(HeddleError::StageExecution(format!(
                "all {} units of stage {} failed, first was {}: {}",
                total, stage, unit, e
            )))
        }
        (UnitTolerance::Tolerant, Some(_)) => Ok(kept),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WorkflowEvent;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tokio_util::sync::CancellationToken;

    use crate::guard::CallGuard;

    #[derive(Debug, Default)]
    struct Echo {
        units: Vec<String>,
        failing: Vec<String>,
        synthesize: bool,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Echo {
        fn new(units: &[&str]) -> Self {
            Self {
                units: units.iter().map(|u| u.to_string()).collect(),
                ..Self::default()
            }
        }

        fn failing(mut self, units: &[&str]) -> Self {
            self.failing = units.iter().map(|u| u.to_string()).collect();
            self
        }

        fn synthesizing(mut self) -> Self {
            self.synthesize = true;
            self
        }
    }

    #[async_trait]
    impl Stage for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn plan_units(&self, _ctx: &StageContext) -> Result<Vec<String>> {
            Ok(self.units.clone())
        }

        async fn run_unit(&self, unit: &str, _ctx: &StageContext) -> Result<String> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if unit == "boom" {
                panic!("unit exploded");
            }
            if self.failing.iter().any(|f| f == unit) {
                return Err(HeddleError::StatsProvider(format!("no data for {}", unit)));
            }
            Ok(format!("out-{}", unit))
        }

        async fn synthesize(&self, units: &UnitOutputs, _ctx: &StageContext) -> Result<Option<String>> {
            if !self.synthesize {
                return Ok(None);
            }
            Ok(Some(units.keys().cloned().collect::<Vec<_>>().join(",")))
        }
    }

    fn emitter() -> (Emitter, broadcast::Receiver<WorkflowEvent>) {
        let (tx, rx) = broadcast::channel(128);
        (Emitter::new(tx, "run-1"), rx)
    }

    fn ctx() -> Arc<StageContext> {
        Arc::new(StageContext::new("echo"))
    }

    #[tokio::test]
    async fn test_pool_returns_results_in_dispatch_order() {
        let (events, _rx) = emitter();
        let stage = Arc::new(Echo::new(&["c", "a", "b"]));
        let results = UnitPool::new(2)
            .run(stage, ctx(), vec!["c".into(), "a".into(), "b".into()], &events)
            .await;

        let order: Vec<_> = results.iter().map(|(unit, _)| unit.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_bounds_concurrency() {
        let (events, _rx) = emitter();
        let names: Vec<String> = (0..8).map(|i| format!("u{}", i)).collect();
        let stage = Arc::new(Echo::new(&[]));
        let results = UnitPool::new(3)
            .run(stage.clone(), ctx(), names, &events)
            .await;

        assert_eq!(results.len(), 8);
        assert!(stage.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_execute_synthesizes_over_all_units() {
        let (events, mut rx) = emitter();
        let stage = Arc::new(Echo::new(&["q2", "q1", "q3"]).synthesizing());
        let run = execute(stage, ctx(), UnitPool::new(4), Some(3), UnitTolerance::Strict, &events)
            .await
            .unwrap();

        assert_eq!(run.output, StageOutput::Synthesized("q1,q2,q3".to_string()));
        assert_eq!(run.units.len(), 3);
        assert_eq!(run.units.get("q1").map(String::as_str), Some("out-q1"));

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, WorkflowEvent::FanOutStarted { ref units, .. } if units.len() == 3));
    }

    #[tokio::test]
    async fn test_execute_without_synthesis_outputs_units() {
        let (events, _rx) = emitter();
        let stage = Arc::new(Echo::new(&["DE", "FR"]));
        let run = execute(stage, ctx(), UnitPool::new(1), None, UnitTolerance::Strict, &events)
            .await
            .unwrap();

        let units = run.output.units().unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units, &run.units);
    }

    #[tokio::test]
    async fn test_strict_reports_first_failure_in_dispatch_order() {
        let (events, _rx) = emitter();
        let stage = Arc::new(Echo::new(&["a", "b", "c", "d", "e"]).failing(&["d", "b"]));
        let result = execute(stage, ctx(), UnitPool::new(5), None, UnitTolerance::Strict, &events).await;

        match result {
            Err(HeddleError::UnitFailed { stage, unit, source }) => {
                assert_eq!(stage, "echo");
                assert_eq!(unit, "b");
                assert!(matches!(*source, HeddleError::StatsProvider(ref m) if m == "no data for b"));
            }
            other => panic!("expected UnitFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tolerant_drops_failed_units() {
        let (events, _rx) = emitter();
        let stage = Arc::new(Echo::new(&["a", "b", "c"]).failing(&["b"]));
        let run = execute(stage, ctx(), UnitPool::new(2), None, UnitTolerance::Tolerant, &events)
            .await
            .unwrap();

        assert_eq!(run.units.keys().collect::<Vec<_>>(), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_tolerant_fails_when_every_unit_fails() {
        let (events, _rx) = emitter();
        let stage = Arc::new(Echo::new(&["a", "b"]).failing(&["a", "b"]));
        let result = execute(stage, ctx(), UnitPool::new(2), None, UnitTolerance::Tolerant, &events).await;
        assert!(matches!(result, Err(HeddleError::StageExecution(_))));
    }

    #[tokio::test]
    async fn test_duplicate_plan_is_rejected() {
        let (events, _rx) = emitter();
        let stage = Arc::new(Echo::new(&["q1", "q1"]));
        let result = execute(stage, ctx(), UnitPool::new(2), None, UnitTolerance::Strict, &events).await;
        assert!(matches!(result, Err(HeddleError::DuplicateUnit { ref unit, .. }) if unit == "q1"));
    }

    #[tokio::test]
    async fn test_cardinality_mismatch_is_rejected() {
        let (events, _rx) = emitter();
        let stage = Arc::new(Echo::new(&["a", "b"]));
        let result = execute(stage, ctx(), UnitPool::new(2), Some(3), UnitTolerance::Strict, &events).await;
        assert!(matches!(result, Err(HeddleError::StageExecution(_))));
    }

    #[tokio::test]
    async fn test_panicking_unit_becomes_error() {
        let (events, _rx) = emitter();
        let stage = Arc::new(Echo::new(&["a", "boom"]));
        let result = execute(stage, ctx(), UnitPool::new(2), None, UnitTolerance::Strict, &events).await;
        assert!(matches!(result, Err(HeddleError::UnitFailed { ref unit, .. }) if unit == "boom"));
    }

    #[tokio::test]
    async fn test_cancelled_pool_reports_cancellation() {
        let (events, _rx) = emitter();
        let token = CancellationToken::new();
        token.cancel();
        let ctx = Arc::new(StageContext::new("echo").with_guard(CallGuard::new(None, token)));
        let stage = Arc::new(Echo::new(&["a", "b"]));

        let result = execute(stage, ctx, UnitPool::new(1), None, UnitTolerance::Tolerant, &events).await;
        assert!(matches!(result, Err(HeddleError::Cancelled)));
    }
}
