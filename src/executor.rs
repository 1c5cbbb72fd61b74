//! Drives a [`Workflow`] over a [`WorkflowState`].
//!
//! The executor dispatches every ready stage as its own task, waits for
//! whichever attempt finishes first, applies the verdict through the
//! stage's [`RetryController`], and dispatches again. It is the only writer
//! of the state, and writes only after an attempt has fully completed.
//!
//! A rejection re-runs just the rejected stage. An `Err` anywhere aborts
//! the whole run: in-flight attempts are cancelled and discarded, and
//! [`HeddleError::RunAborted`] names the failing stage.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::event::Emitter;
use crate::fanout::{self, UnitPool};
use crate::guard::CallGuard;
use crate::retry::RetryController;
use crate::workflow::Readiness;
use crate::{
    HeddleError, Result, Stage, StageContext, StageOutput, StageStatus, UnitOutputs,
    UnitTolerance, ValidationContext, Validator, Verdict, Workflow, WorkflowState,
};

/// What one finished attempt hands back to the executor.
#[derive(Debug)]
struct AttemptReport {
    output: StageOutput,
    units: UnitOutputs,
    verdict: Verdict,
}

type Joined = (String, Result<AttemptReport>);

/// Attempts currently in flight.
struct InFlight {
    tasks: JoinSet<Joined>,
    handles: HashMap<String, AbortHandle>,
}

impl InFlight {
    fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            handles: HashMap::new(),
        }
    }

    fn is_running(&self, stage: &str) -> bool {
        self.handles.contains_key(stage)
    }

    fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    fn spawn<F>(&mut self, stage: String, attempt: F)
    where
        F: std::future::Future<Output = Result<AttemptReport>> + Send + 'static,
    {
        // The attempt runs in its own task so that a panic surfaces as a
        // JoinError tied to the stage name.
        let handle = tokio::spawn(attempt);
        self.handles.insert(stage.clone(), handle.abort_handle());
        self.tasks.spawn(async move {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(HeddleError::StageExecution(format!(
                    "stage task panicked: {}",
                    e
                ))),
                Err(_) => Err(HeddleError::Cancelled),
            };
            (stage, result)
        });
    }

    async fn abort_all(&mut self) -> Vec<String> {
        for handle in self.handles.values() {
            handle.abort();
        }
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
        self.handles.drain().map(|(stage, _)| stage).collect()
    }
}

impl Workflow {
    /// Runs the workflow on `state` until every stage is terminal.
    ///
    /// Stages that are already terminal are never re-run, so calling this
    /// on a finished state does nothing. The report sink is invoked only
    /// when the call moved at least one stage forward.
    ///
    /// A resumed stage that is awaiting a retry but already used every
    /// attempt this workflow allows is marked exhausted, without an output,
    /// and the run continues past it.
    ///
    /// # Errors
    ///
    /// Returns [`HeddleError::RunAborted`] on any fatal error, and
    /// [`HeddleError::AlreadyAborted`] if `state` belongs to an aborted run.
    pub async fn run(&self, state: &mut WorkflowState) -> Result<()> {
        self.run_until(state, CancellationToken::new()).await
    }

    /// Runs the workflow, stopping early if `cancel` fires.
    ///
    /// Cancellation aborts the run like any other fatal error.
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run).
    pub async fn run_until(&self, state: &mut WorkflowState, cancel: CancellationToken) -> Result<()> {
        let span = info_span!("run", run_id = %state.run_id(), stages = self.stage_count());
        self.drive(state, cancel).instrument(span).await
    }

    async fn drive(&self, state: &mut WorkflowState, cancel: CancellationToken) -> Result<()> {
        if let Some(reason) = state.abort_reason() {
            return Err(HeddleError::AlreadyAborted {
                run_id: state.run_id().to_string(),
                reason: reason.to_string(),
            });
        }

        state.set_stage_order(&self.topo_order);

        let run_token = cancel.child_token();
        let _stop_timer = run_token.clone().drop_guard();
        if let Some(limit) = self.run_deadline {
            let token = run_token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(limit) => token.cancel(),
                    _ = token.cancelled() => {}
                }
            });
        }

        let events = Emitter::new(self.event_tx.clone(), state.run_id());
        let guard = CallGuard::new(self.call_timeout, run_token.clone());
        let mut in_flight = InFlight::new();
        let mut progressed = false;

        info!("run started");

        loop {
            if let Err((stage, e)) = self.dispatch(state, &guard, &events, &mut in_flight, &mut progressed) {
                return Err(self.abort(state, &events, &mut in_flight, stage, e).await);
            }

            if in_flight.is_empty() {
                break;
            }

            let joined = tokio::select! {
                biased;
                _ = run_token.cancelled() => None,
                joined = in_flight.tasks.join_next() => joined,
            };

            match joined {
                None => {
                    let stage = self
                        .topo_order
                        .iter()
                        .find(|s| in_flight.is_running(s))
                        .cloned()
                        .or_else(|| state.phase().map(str::to_string))
                        .unwrap_or_default();
                    let e = match self.run_deadline {
                        Some(after) if !cancel.is_cancelled() => HeddleError::Timeout {
                            operation: "run".to_string(),
                            after,
                        },
                        _ => HeddleError::Cancelled,
                    };
                    return Err(self.abort(state, &events, &mut in_flight, stage, e).await);
                }
                Some(Err(e)) => {
                    let stage = state.phase().unwrap_or_default().to_string();
                    let e = HeddleError::StageExecution(format!("attempt supervisor failed: {}", e));
                    return Err(self.abort(state, &events, &mut in_flight, stage, e).await);
                }
                Some(Ok((stage, Err(e)))) => {
                    in_flight.handles.remove(&stage);
                    return Err(self.abort(state, &events, &mut in_flight, stage, e).await);
                }
                Some(Ok((stage, Ok(report)))) => {
                    in_flight.handles.remove(&stage);
                    let max_attempts = match self.max_attempts_for(&stage) {
                        Ok(max) => max,
                        Err(e) => return Err(self.abort(state, &events, &mut in_flight, stage, e).await),
                    };
                    state.replace_unit_outputs(&stage, report.units);
                    let transition = RetryController::new(stage.as_str(), max_attempts).resolve(
                        state,
                        report.output,
                        report.verdict,
                        &events,
                    );
                    debug!(stage = %stage, ?transition, "attempt resolved");
                }
            }
        }

        let stuck: Vec<&str> = self
            .topo_order
            .iter()
            .filter(|s| !state.status(s).is_terminal())
            .map(String::as_str)
            .collect();
        if !stuck.is_empty() {
            warn!(?stuck, "run stalled");
            return Err(HeddleError::StageExecution(format!(
                "stages can never become ready: {}",
                stuck.join(", ")
            )));
        }

        if progressed {
            if let Some(sink) = &self.report_sink {
                if let Err(e) = guard.call("report sink", sink.persist(state)).await {
                    warn!(error = %e, "report sink failed");
                    let message = e.to_string();
                    state.mark_aborted(format!("report sink: {}", message));
                    events.run_aborted("report sink", message);
                    return Err(HeddleError::aborted_in("report sink", e));
                }
            }
        }

        let exhausted = state.exhausted_stages();
        if exhausted.is_empty() {
            info!("run complete");
        } else {
            warn!(?exhausted, "run complete with unapproved stages");
        }
        events.run_completed();
        Ok(())
    }

    /// Starts every stage that can start, marking skips along the way.
    ///
    /// Returns the stage and error if a stage cannot be started.
    fn dispatch(
        &self,
        state: &mut WorkflowState,
        guard: &CallGuard,
        events: &Emitter,
        in_flight: &mut InFlight,
        progressed: &mut bool,
    ) -> std::result::Result<(), (String, HeddleError)> {
        for name in &self.topo_order {
            if in_flight.is_running(name) {
                continue;
            }
            let status = state.status(name);
            if status.is_terminal() || status == StageStatus::Failed {
                continue;
            }

            match self.readiness(name, state).map_err(|e| (name.clone(), e))? {
                Readiness::Waiting => continue,
                Readiness::Skip => {
                    info!(stage = %name, "edge conditions unmet, skipping stage");
                    state.record_mut(name).mark_skipped();
                    events.stage_skipped(name);
                    *progressed = true;
                }
                Readiness::Ready => {
                    self.start_attempt(name, state, guard, events, in_flight)
                        .map_err(|e| (name.clone(), e))?;
                    *progressed = true;
                }
            }
        }
        Ok(())
    }

    fn start_attempt(
        &self,
        name: &str,
        state: &mut WorkflowState,
        guard: &CallGuard,
        events: &Emitter,
        in_flight: &mut InFlight,
    ) -> Result<()> {
        let settings = self.settings(name)?;
        let retry = RetryController::new(name, settings.max_attempts);
        if !retry.can_start(state) {
            if state.status(name) == StageStatus::RejectedRetryable {
                retry.exhaust(state, events);
                return Ok(());
            }
            return Err(HeddleError::StageExecution(format!(
                "stage {} has no attempts left ({} of {})",
                name,
                state.attempts(name),
                settings.max_attempts
            )));
        }
        let validator = self
            .validator
            .clone()
            .ok_or_else(|| HeddleError::InvalidWorkflow("a validator is required".to_string()))?;
        let stage = Arc::clone(self.get_stage(name)?);
        let tolerance = settings.tolerance.unwrap_or_else(|| stage.tolerance());

        let attempt = retry.begin(state);
        let ctx = self.attempt_context(name, attempt, state, guard.clone())?;
        info!(stage = %name, attempt, max_attempts = settings.max_attempts, "dispatching stage");
        events.stage_started(name, attempt);

        let span = info_span!("stage", stage = %name, attempt);
        let task = run_attempt(
            stage,
            Arc::new(ctx),
            validator,
            UnitPool::new(settings.worker_pool_size),
            settings.fan_out,
            tolerance,
            events.clone(),
        )
        .instrument(span);
        in_flight.spawn(name.to_string(), task);
        Ok(())
    }

    /// Snapshots what an attempt may read: its feedback and the outputs of
    /// its direct dependencies.
    fn attempt_context(
        &self,
        name: &str,
        attempt: u32,
        state: &WorkflowState,
        guard: CallGuard,
    ) -> Result<StageContext> {
        let mut ctx = StageContext::new(name)
            .with_attempt(attempt)
            .with_guard(guard);

        if state.rerun_requested(name) {
            if let Some(feedback) = state.last_feedback(name) {
                ctx = ctx.with_feedback(feedback);
            }
        }

        for dependency in self.dependencies(name)? {
            if let Some(output) = state.stage_output(dependency) {
                ctx = ctx.with_upstream(dependency, output.clone());
            }
        }

        Ok(ctx)
    }

    async fn abort(
        &self,
        state: &mut WorkflowState,
        events: &Emitter,
        in_flight: &mut InFlight,
        stage: String,
        error: HeddleError,
    ) -> HeddleError {
        for interrupted in in_flight.abort_all().await {
            if interrupted != stage {
                state.record_mut(&interrupted).mark_interrupted();
            }
        }

        let message = error.to_string();
        warn!(stage = %stage, error = %message, "run aborted");
        if !stage.is_empty() {
            state.record_mut(&stage).mark_failed(message.clone());
        }
        state.mark_aborted(format!("{}: {}", stage, message));
        events.stage_failed(&stage, message.clone());
        events.run_aborted(&stage, message);
        HeddleError::aborted_in(stage, error)
    }
}

/// One attempt: fan out, join, synthesize, then ask the validator.
async fn run_attempt(
    stage: Arc<dyn Stage>,
    ctx: Arc<StageContext>,
    validator: Arc<dyn Validator>,
    pool: UnitPool,
    fan_out: Option<usize>,
    tolerance: UnitTolerance,
    events: Emitter,
) -> Result<AttemptReport> {
    let run = fanout::execute(stage, Arc::clone(&ctx), pool, fan_out, tolerance, &events).await?;

    let validation = ValidationContext {
        stage: ctx.stage_name.clone(),
        attempt: ctx.attempt,
        upstream: ctx.upstream.clone(),
        unit_outputs: run.units.clone(),
    };
    let verdict = ctx
        .call("validator", validator.judge(&validation, &run.output))
        .await?;
    debug!(passed = verdict.passed, "verdict received");

    Ok(AttemptReport {
        output: run.output,
        units: run.units,
        verdict,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ReportSink, WorkflowEvent};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct Counting {
        name: String,
        calls: AtomicU32,
        feedback_seen: Mutex<Vec<Option<String>>>,
    }

    impl Counting {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl Stage for Counting {
        fn name(&self) -> &str {
            &self.name
        }

        async fn synthesize(&self, _units: &UnitOutputs, ctx: &StageContext) -> Result<Option<String>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.feedback_seen
                .lock()
                .unwrap()
                .push(ctx.feedback().map(str::to_string));
            Ok(Some(format!("{} v{}", self.name, n)))
        }
    }

    /// Rejects a stage a fixed number of times before approving it.
    #[derive(Debug)]
    struct RejectTimes {
        stage: String,
        times: u32,
    }

    #[async_trait]
    impl Validator for RejectTimes {
        async fn judge(&self, ctx: &ValidationContext, _candidate: &StageOutput) -> Result<Verdict> {
            if ctx.stage == self.stage && ctx.attempt <= self.times {
                Ok(Verdict::reject(format!("REJECTED: attempt {} too thin", ctx.attempt)))
            } else {
                Ok(Verdict::approve("APPROVED"))
            }
        }
    }

    #[derive(Debug)]
    struct Hangs;

    #[async_trait]
    impl Stage for Hangs {
        fn name(&self) -> &str {
            "hangs"
        }

        async fn synthesize(&self, _units: &UnitOutputs, ctx: &StageContext) -> Result<Option<String>> {
            ctx.call("generator", std::future::pending::<Result<Option<String>>>())
                .await
        }
    }

    #[derive(Debug, Default)]
    struct CountingSink {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ReportSink for CountingSink {
        async fn persist(&self, _state: &WorkflowState) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn approve_all() -> Arc<dyn Validator> {
        Arc::new(RejectTimes {
            stage: String::new(),
            times: 0,
        })
    }

    #[tokio::test]
    async fn test_run_empty_workflow() {
        let workflow = Workflow::builder().build().unwrap();
        let mut state = WorkflowState::with_run_id("run-1");
        workflow.run(&mut state).await.unwrap();
        assert!(state.ledger().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_stage_retries_with_feedback() {
        let stage = Arc::new(Counting::new("draft"));
        let workflow = Workflow::builder()
            .stage("draft", SharedStage(stage.clone()))
            .validator(Arc::new(RejectTimes {
                stage: "draft".to_string(),
                times: 1,
            }))
            .build()
            .unwrap();

        let mut state = WorkflowState::with_run_id("run-1");
        workflow.run(&mut state).await.unwrap();

        assert_eq!(state.attempts("draft"), 2);
        assert_eq!(state.status("draft"), StageStatus::Approved);
        assert_eq!(
            state.stage_output("draft"),
            Some(&StageOutput::Synthesized("draft v2".to_string()))
        );
        let seen = stage.feedback_seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![None, Some("REJECTED: attempt 1 too thin".to_string())]
        );
    }

    #[tokio::test]
    async fn test_finished_state_is_not_rerun() {
        let stage = Arc::new(Counting::new("a"));
        let sink = Arc::new(CountingSink::default());
        let workflow = Workflow::builder()
            .stage("a", SharedStage(stage.clone()))
            .validator(approve_all())
            .report_sink(sink.clone())
            .build()
            .unwrap();

        let mut state = WorkflowState::with_run_id("run-1");
        workflow.run(&mut state).await.unwrap();
        workflow.run(&mut state).await.unwrap();

        assert_eq!(stage.calls.load(Ordering::SeqCst), 1);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.attempts("a"), 1);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_run() {
        let workflow = Workflow::builder()
            .stage("hangs", Hangs)
            .validator(approve_all())
            .build()
            .unwrap();

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let mut state = WorkflowState::with_run_id("run-1");
        let err = workflow.run_until(&mut state, token).await.unwrap_err();

        assert_eq!(err.aborted_stage(), Some("hangs"));
        assert!(state.is_aborted());
        assert_eq!(state.status("hangs"), StageStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_deadline_is_a_timeout() {
        let workflow = Workflow::builder()
            .stage("hangs", Hangs)
            .validator(approve_all())
            .run_deadline(Duration::from_secs(30))
            .build()
            .unwrap();

        let mut state = WorkflowState::with_run_id("run-1");
        let err = workflow.run(&mut state).await.unwrap_err();

        match err {
            HeddleError::RunAborted { stage, source } => {
                assert_eq!(stage, "hangs");
                assert!(matches!(*source, HeddleError::Timeout { .. }));
            }
            other => panic!("expected RunAborted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_aborted_state_is_refused() {
        let workflow = Workflow::builder()
            .stage("a", Counting::new("a"))
            .validator(approve_all())
            .build()
            .unwrap();

        let mut state = WorkflowState::with_run_id("run-1");
        state.mark_aborted("a: boom".to_string());
        let err = workflow.run(&mut state).await.unwrap_err();
        assert!(matches!(err, HeddleError::AlreadyAborted { .. }));
        assert_eq!(state.attempts("a"), 0);
    }

    #[tokio::test]
    async fn test_resumed_stage_past_lower_ceiling_is_exhausted() {
        let draft = Arc::new(Counting::new("draft"));
        let summary = Arc::new(Counting::new("summary"));
        let workflow = Workflow::builder()
            .stage("draft", SharedStage(draft.clone()))
            .stage("summary", SharedStage(summary.clone()))
            .dependency("summary", "draft")
            .max_attempts(2)
            .validator(approve_all())
            .build()
            .unwrap();

        // rejected twice under a ceiling of 3
        let mut state = WorkflowState::with_run_id("run-1");
        state.increment_attempt("draft");
        state.increment_attempt("draft");
        state.set_feedback("draft", "REJECTED: attempt 2 too thin".to_string());
        state.set_rerun("draft", true);
        state.record_mut("draft").mark_retryable();

        workflow.run(&mut state).await.unwrap();

        assert_eq!(draft.calls.load(Ordering::SeqCst), 0);
        assert_eq!(state.status("draft"), StageStatus::RejectedExhausted);
        assert_eq!(state.attempts("draft"), 2);
        assert!(!state.rerun_requested("draft"));
        assert_eq!(state.exhausted_stages(), vec!["draft"]);

        assert_eq!(summary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.status("summary"), StageStatus::Approved);
    }

    #[tokio::test]
    async fn test_run_emits_lifecycle_events() {
        let workflow = Workflow::builder()
            .stage("a", Counting::new("a"))
            .validator(Arc::new(RejectTimes {
                stage: "a".to_string(),
                times: 1,
            }))
            .build()
            .unwrap();
        let mut events = workflow.subscribe();

        let mut state = WorkflowState::with_run_id("run-9");
        workflow.run(&mut state).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.iter().all(|e| e.run_id() == "run-9"));
        assert!(matches!(seen[0], WorkflowEvent::StageStarted { attempt: 1, .. }));
        assert!(matches!(seen[1], WorkflowEvent::StageRejected { attempt: 1, .. }));
        assert!(matches!(seen[2], WorkflowEvent::StageStarted { attempt: 2, .. }));
        assert!(matches!(seen[3], WorkflowEvent::StageApproved { attempt: 2, .. }));
        assert!(matches!(seen[4], WorkflowEvent::RunCompleted { .. }));
    }

    /// Lets a test keep a handle on a stage it registers.
    #[derive(Debug)]
    struct SharedStage(Arc<Counting>);

    #[async_trait]
    impl Stage for SharedStage {
        fn name(&self) -> &str {
            self.0.name()
        }

        async fn synthesize(&self, units: &UnitOutputs, ctx: &StageContext) -> Result<Option<String>> {
            self.0.synthesize(units, ctx).await
        }
    }
}
