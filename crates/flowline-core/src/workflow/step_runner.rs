//! Step runner: dispatch by step kind, wrapped in retry and timeout.
//!
//! Every step goes through the same state machine:
//! `Pending -> Running -> {Succeeded, Failed}` (`Skipped` is only reached by
//! steps in an unchosen branch and never passes through here). Each attempt
//! runs under a per-attempt timeout and races the run's cancellation token;
//! a failed attempt is retried with exponential backoff while the step's
//! retry policy and the error kind allow it.
//!
//! Leaf kinds (callable, agent, validation) are handled in this module. Flow
//! control (branch, loop, checkpoint, subworkflow) lives in `flow`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use flowline_types::checkpoint::LoopProgress;
use flowline_types::config::EngineConfig;
use flowline_types::event::RunEvent;
use flowline_types::run::{ErrorKind, ErrorRecord, StepResult, StepStatus};
use flowline_types::workflow::{StepKind, StepRecord, ValidationCheck, WorkflowDocument};
use futures_util::future::BoxFuture;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::expression::{EvalError, GrammarError, TemplateCache, evaluate, is_truthy};

use super::capability::{CapabilityError, HandlerMap};
use super::context::RunContext;
use super::definition::ValidationErrors;
use super::retry::RetryPolicy;

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Why a single attempt failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Grammar(#[from] GrammarError),

    #[error("{0}")]
    Input(ValidationErrors),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error("{0}")]
    Execution(String),

    #[error("attempt timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("run cancelled")]
    Cancelled,

    /// A nested step failed; the record already names it.
    #[error("{}", .0.message)]
    Nested(ErrorRecord),
}

impl StepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StepError::Eval(e) => e.kind(),
            StepError::Grammar(_) => ErrorKind::Grammar,
            StepError::Input(_) => ErrorKind::Input,
            StepError::Capability(_) | StepError::Execution(_) => ErrorKind::StepExecution,
            StepError::Timeout(_) => ErrorKind::Timeout,
            StepError::Cancelled => ErrorKind::Cancelled,
            StepError::Nested(record) => record.kind,
        }
    }

    /// Convert into a user-facing record naming the innermost failing step.
    pub fn into_record(self, path: &str) -> ErrorRecord {
        match self {
            StepError::Nested(record) => record.at_step(path),
            other => ErrorRecord::new(other.kind(), other.to_string()).at_step(path),
        }
    }
}

// ---------------------------------------------------------------------------
// ProgressSink
// ---------------------------------------------------------------------------

/// Receives durability requests from inside a running step.
///
/// Implemented by the run coordinator, which knows the top-level progress
/// a checkpoint must describe.
pub trait ProgressSink: Send + Sync {
    /// A top-level sequential loop finished iteration `next_iteration - 1`.
    fn loop_iteration<'a>(&'a self, progress: LoopProgress) -> BoxFuture<'a, ()>;

    /// An explicit checkpoint step asked for a barrier. Returns whether the
    /// checkpoint was written.
    fn barrier(&self) -> BoxFuture<'_, bool>;
}

/// Top-level loop bookkeeping passed into a step.
#[derive(Debug, Clone, Default)]
pub struct LoopTracking {
    /// Iterations already completed by an earlier, interrupted run.
    pub resume: Option<LoopProgress>,
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Executes step records for one run.
///
/// Cheap to clone; parallel loop iterations each get their own clone.
#[derive(Clone)]
pub struct StepRunner {
    pub(crate) run_id: Uuid,
    pub(crate) templates: Arc<TemplateCache>,
    pub(crate) handlers: Arc<HandlerMap>,
    pub(crate) events: EventBus,
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) cancel: CancellationToken,
    pub(crate) progress: Option<Arc<dyn ProgressSink>>,
    /// Subworkflow nesting depth (0 for the top-level document).
    pub(crate) depth: u32,
}

impl std::fmt::Debug for StepRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRunner")
            .field("run_id", &self.run_id)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

impl StepRunner {
    pub fn new(
        run_id: Uuid,
        templates: Arc<TemplateCache>,
        handlers: Arc<HandlerMap>,
        events: EventBus,
        config: Arc<EngineConfig>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run_id,
            templates,
            handlers,
            events,
            config,
            cancel,
            progress: None,
            depth: 0,
        }
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Run a step list in order, recording each output in `ctx`'s innermost
    /// layer. The first failure halts the list.
    pub fn run_list<'a>(
        &'a self,
        steps: &'a [StepRecord],
        ctx: &'a mut RunContext,
        prefix: &'a str,
    ) -> BoxFuture<'a, Result<(), ErrorRecord>> {
        Box::pin(async move {
            for step in steps {
                let path = child_path(prefix, &step.name);
                let result = self.run_step(step, ctx, &path, None).await;
                match result.error {
                    Some(error) => return Err(error),
                    None => ctx.set_output(step.name.clone(), result.output),
                }
            }
            Ok(())
        })
    }

    /// Run one step through its retry policy.
    ///
    /// The caller records `output` on success; `ctx` is only read.
    pub fn run_step<'a>(
        &'a self,
        step: &'a StepRecord,
        ctx: &'a RunContext,
        path: &'a str,
        tracking: Option<LoopTracking>,
    ) -> BoxFuture<'a, StepResult> {
        Box::pin(async move {
            let policy = RetryPolicy::from_config(step.retry.as_ref());
            let timeout = self.attempt_timeout(step);
            let started = Instant::now();
            let mut attempt = 0;

            loop {
                attempt += 1;
                if self.cancel.is_cancelled() {
                    return failed(StepError::Cancelled.into_record(path), started, attempt);
                }

                self.events.publish(RunEvent::StepStarted {
                    run_id: self.run_id,
                    name: step.name.clone(),
                    path: path.to_string(),
                    attempt,
                });
                tracing::debug!(run_id = %self.run_id, step = path, attempt, kind = step.kind.tag(), "step started");

                match self.attempt(step, ctx, path, timeout, tracking.as_ref()).await {
                    Ok(output) => {
                        let duration_ms = started.elapsed().as_millis() as u64;
                        self.events.publish(RunEvent::StepCompleted {
                            run_id: self.run_id,
                            name: step.name.clone(),
                            path: path.to_string(),
                            duration_ms,
                        });
                        tracing::debug!(run_id = %self.run_id, step = path, duration_ms, "step completed");
                        return StepResult {
                            status: StepStatus::Succeeded,
                            output,
                            duration_ms,
                            error: None,
                            attempts: attempt,
                        };
                    }
                    Err(StepError::Cancelled) => {
                        tracing::debug!(run_id = %self.run_id, step = path, "step cancelled");
                        return failed(StepError::Cancelled.into_record(path), started, attempt);
                    }
                    Err(err) => {
                        let record = err.into_record(path);
                        let will_retry = policy.should_retry(attempt, record.kind);
                        self.events.publish(RunEvent::StepFailed {
                            run_id: self.run_id,
                            name: step.name.clone(),
                            path: path.to_string(),
                            error: record.clone(),
                            will_retry,
                        });
                        if !will_retry {
                            tracing::debug!(run_id = %self.run_id, step = path, attempt, error = %record, "step failed");
                            return failed(record, started, attempt);
                        }

                        let delay = policy.backoff(attempt);
                        tracing::warn!(
                            run_id = %self.run_id,
                            step = path,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %record.message,
                            "step attempt failed, retrying"
                        );
                        tokio::select! {
                            _ = self.cancel.cancelled() => {
                                return failed(StepError::Cancelled.into_record(path), started, attempt);
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        })
    }

    /// Explicit `timeout_secs` applies to any kind; leaf kinds fall back to
    /// the engine default. Flow-control steps are otherwise bounded by the
    /// timeouts of the steps inside them.
    fn attempt_timeout(&self, step: &StepRecord) -> Option<Duration> {
        match (step.timeout_secs, &step.kind) {
            (Some(secs), _) => Some(Duration::from_secs(secs)),
            (None, StepKind::Callable { .. } | StepKind::Agent { .. } | StepKind::Validation { .. }) => {
                Some(Duration::from_secs(self.config.default_step_timeout_secs))
            }
            (None, _) => None,
        }
    }

    async fn attempt(
        &self,
        step: &StepRecord,
        ctx: &RunContext,
        path: &str,
        timeout: Option<Duration>,
        tracking: Option<&LoopTracking>,
    ) -> Result<Value, StepError> {
        let work = self.dispatch(step, ctx, path, tracking);
        let bounded = async {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, work).await {
                    Ok(result) => result,
                    Err(_elapsed) => Err(StepError::Timeout(limit)),
                },
                None => work.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StepError::Cancelled),
            result = bounded => result,
        }
    }

    /// One handler per kind, selected by a single match.
    async fn dispatch(
        &self,
        step: &StepRecord,
        ctx: &RunContext,
        path: &str,
        tracking: Option<&LoopTracking>,
    ) -> Result<Value, StepError> {
        match &step.kind {
            StepKind::Callable { callable, args } => {
                let args = self.templates.render_value(args, ctx)?;
                Ok(self.handlers.callable(callable)?.invoke(callable, args).await?)
            }
            StepKind::Agent { agent, task, args } => {
                let task = self.templates.get_or_compile(task)?.render(ctx)?;
                let args = agent_args(task, self.templates.render_value(args, ctx)?);
                Ok(self.handlers.agent(agent)?.invoke(agent, args).await?)
            }
            StepKind::Validation { checks } => self.validate(checks, ctx),
            StepKind::Branch { when, then, otherwise } => {
                self.branch(when, then, otherwise.as_deref(), ctx, path).await
            }
            StepKind::Loop { .. } => self.run_loop(step, ctx, path, tracking).await,
            StepKind::Checkpoint => Ok(self.checkpoint_barrier().await),
            StepKind::Subworkflow { workflow, inputs, .. } => {
                self.subworkflow(workflow.as_deref(), inputs, ctx, path).await
            }
        }
    }

    fn validate(&self, checks: &[ValidationCheck], ctx: &RunContext) -> Result<Value, StepError> {
        let mut results = Vec::with_capacity(checks.len());
        let mut failures = Vec::new();

        for check in checks {
            let node = self.templates.condition(&check.that)?;
            let passed = is_truthy(&evaluate(&node, ctx)?);
            if !passed {
                failures.push(match &check.message {
                    Some(message) => format!("'{}': {message}", check.name),
                    None => format!("'{}'", check.name),
                });
            }
            results.push(json!({ "name": check.name, "passed": passed }));
        }

        if failures.is_empty() {
            Ok(json!({ "passed": true, "checks": results }))
        } else {
            Err(StepError::Execution(format!(
                "validation failed: {}",
                failures.join(", ")
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `{"task": ..., ...args}`; non-object args are passed under `"args"`.
fn agent_args(task: String, args: Value) -> Value {
    let mut map = Map::new();
    map.insert("task".to_string(), Value::String(task));
    match args {
        Value::Object(extra) => {
            for (key, value) in extra {
                map.entry(key).or_insert(value);
            }
        }
        Value::Null => {}
        other => {
            map.insert("args".to_string(), other);
        }
    }
    Value::Object(map)
}

fn failed(error: ErrorRecord, started: Instant, attempts: u32) -> StepResult {
    StepResult {
        status: StepStatus::Failed,
        output: Value::Null,
        duration_ms: started.elapsed().as_millis() as u64,
        error: Some(error),
        attempts,
    }
}

/// `prefix/name`, or just `name` at top level.
pub(crate) fn child_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// Evaluate a document's `outputs` map against a finished context.
pub fn resolve_outputs(
    doc: &WorkflowDocument,
    templates: &TemplateCache,
    ctx: &RunContext,
) -> Result<Value, EvalError> {
    let mut outputs = Map::new();
    for (name, raw) in &doc.outputs {
        let value = templates.get_or_compile(raw)?.evaluate(ctx)?;
        outputs.insert(name.clone(), value);
    }
    Ok(Value::Object(outputs))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
