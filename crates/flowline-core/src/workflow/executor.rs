//! Run coordinator: drives a document's top-level steps with durable
//! checkpointing, lifecycle events and cancellation.
//!
//! # Execution flow
//!
//! 1. Validate inputs (or load and verify a checkpoint for resume).
//! 2. Build the `RunContext` and a `StepRunner` wired to a progress sink.
//! 3. Run top-level steps in document order; record each output.
//! 4. Checkpoint every `checkpoint_interval` completed steps, on explicit
//!    checkpoint steps, and after each iteration of a top-level sequential
//!    loop.
//! 5. Resolve the document's `outputs`, save the final state, publish the
//!    terminal event.
//!
//! Checkpoint storage failures are logged and counted; they never fail the
//! run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use flowline_types::checkpoint::{
    CHECKPOINT_FORMAT_VERSION, Checkpoint, ContextSnapshot, LoopProgress, StepMarker,
};
use flowline_types::config::EngineConfig;
use flowline_types::event::RunEvent;
use flowline_types::run::{ErrorKind, ErrorRecord, RunStatus};
use flowline_types::workflow::{StepKind, StepRecord};
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::checkpoint::CheckpointStore;

use super::capability::HandlerMap;
use super::checkpoint::{CheckpointError, CheckpointManager, step_marker, verify_resumable};
use super::context::RunContext;
use super::definition::{LoadedWorkflow, ValidationErrors, validate_inputs};
use super::step_runner::{LoopTracking, ProgressSink, StepRunner, resolve_outputs};

// ---------------------------------------------------------------------------
// WorkflowExecutor trait
// ---------------------------------------------------------------------------

/// Trait for workflow execution engines.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods,
/// consistent with the project's Rust 2024 edition approach.
pub trait WorkflowExecutor: Send + Sync {
    /// Run a validated document from the beginning.
    fn start(
        &self,
        loaded: &LoadedWorkflow,
        inputs: BTreeMap<String, Value>,
    ) -> impl std::future::Future<Output = Result<RunResult, ExecutorError>> + Send;

    /// Continue an interrupted run from its last checkpoint.
    fn resume(
        &self,
        run_id: Uuid,
        loaded: &LoadedWorkflow,
    ) -> impl std::future::Future<Output = Result<RunResult, ExecutorError>> + Send;

    /// Request cancellation of an active run.
    fn cancel(&self, run_id: Uuid) -> Result<(), ExecutorError>;
}

// ---------------------------------------------------------------------------
// RunResult / ExecutorError
// ---------------------------------------------------------------------------

/// Outcome of a run that got as far as executing steps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub status: RunStatus,
    /// Outputs of completed top-level steps.
    pub step_outputs: BTreeMap<String, Value>,
    /// The document's resolved `outputs`; empty unless the run completed.
    pub outputs: Value,
    /// Path of the innermost failing step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    /// Checkpoint writes that failed during the run.
    pub checkpoint_failures: u32,
    pub duration_ms: u64,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// Failures that prevent a run from starting or resuming.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("invalid run inputs:\n{0}")]
    Input(ValidationErrors),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("run {0} is already active")]
    AlreadyRunning(Uuid),

    #[error("run {0} is not active")]
    RunNotFound(Uuid),

    #[error("run task failed: {0}")]
    Join(String),
}

impl ExecutorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutorError::Input(_) => ErrorKind::Input,
            ExecutorError::Checkpoint(e) => e.kind(),
            ExecutorError::AlreadyRunning(_)
            | ExecutorError::RunNotFound(_)
            | ExecutorError::Join(_) => ErrorKind::StepExecution,
        }
    }
}

// ---------------------------------------------------------------------------
// RunHandle
// ---------------------------------------------------------------------------

/// A run executing on its own task.
#[derive(Debug)]
pub struct RunHandle {
    pub run_id: Uuid,
    /// Subscribed before the task started; sees every event of the run
    /// (and of any other run sharing the coordinator).
    pub events: broadcast::Receiver<RunEvent>,
    cancel: CancellationToken,
    join: JoinHandle<Result<RunResult, ExecutorError>>,
}

impl RunHandle {
    /// Wait for the run task to finish.
    pub async fn wait(self) -> Result<RunResult, ExecutorError> {
        let (_, _, done) = self.into_parts();
        done.await
    }

    /// Split into the event receiver, the cancel token and a future that
    /// resolves when the run task finishes, so events can be read while
    /// the run is awaited.
    pub fn into_parts(
        self,
    ) -> (
        broadcast::Receiver<RunEvent>,
        CancellationToken,
        impl Future<Output = Result<RunResult, ExecutorError>> + Send,
    ) {
        let join = self.join;
        let done = async move { join.await.map_err(|e| ExecutorError::Join(e.to_string()))? };
        (self.events, self.cancel, done)
    }
}

// ---------------------------------------------------------------------------
// RunCoordinator
// ---------------------------------------------------------------------------

/// Sequential top-level driver with durable checkpointing.
///
/// Generic over `S: CheckpointStore` for storage flexibility.
pub struct RunCoordinator<S: CheckpointStore> {
    checkpoint: Arc<CheckpointManager<S>>,
    handlers: Arc<HandlerMap>,
    events: EventBus,
    config: Arc<EngineConfig>,
    /// Cancellation tokens keyed by run_id.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
}

impl<S: CheckpointStore> std::fmt::Debug for RunCoordinator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunCoordinator")
            .field("active_runs", &self.cancellation_tokens.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: CheckpointStore + 'static> RunCoordinator<S> {
    pub fn new(store: S, handlers: HandlerMap, config: EngineConfig) -> Self {
        Self {
            checkpoint: Arc::new(CheckpointManager::new(store)),
            handlers: Arc::new(handlers),
            events: EventBus::new(config.event_capacity),
            config: Arc::new(config),
            cancellation_tokens: DashMap::new(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn checkpoints(&self) -> &CheckpointManager<S> {
        &self.checkpoint
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_active(&self, run_id: Uuid) -> bool {
        self.cancellation_tokens.contains_key(&run_id)
    }

    /// Start a run under a caller-chosen id.
    pub async fn start_with_id(
        &self,
        run_id: Uuid,
        loaded: &LoadedWorkflow,
        inputs: BTreeMap<String, Value>,
    ) -> Result<RunResult, ExecutorError> {
        let token = CancellationToken::new();
        self.register(run_id, token.clone())?;
        let result = self.start_registered(run_id, token, loaded, inputs).await;
        self.cancellation_tokens.remove(&run_id);
        result
    }

    /// Run `start` on a dedicated task.
    pub fn spawn(
        self: &Arc<Self>,
        loaded: LoadedWorkflow,
        inputs: BTreeMap<String, Value>,
        run_id: Option<Uuid>,
    ) -> Result<RunHandle, ExecutorError> {
        let run_id = run_id.unwrap_or_else(Uuid::now_v7);
        let token = CancellationToken::new();
        self.register(run_id, token.clone())?;
        let events = self.events.subscribe();

        let this = Arc::clone(self);
        let task_token = token.clone();
        let join = tokio::spawn(async move {
            let result = this
                .start_registered(run_id, task_token, &loaded, inputs)
                .await;
            this.cancellation_tokens.remove(&run_id);
            result
        });

        Ok(RunHandle {
            run_id,
            events,
            cancel: token,
            join,
        })
    }

    /// Run `resume` on a dedicated task.
    pub fn spawn_resume(
        self: &Arc<Self>,
        run_id: Uuid,
        loaded: LoadedWorkflow,
    ) -> Result<RunHandle, ExecutorError> {
        let token = CancellationToken::new();
        self.register(run_id, token.clone())?;
        let events = self.events.subscribe();

        let this = Arc::clone(self);
        let task_token = token.clone();
        let join = tokio::spawn(async move {
            let result = this.resume_registered(run_id, task_token, &loaded).await;
            this.cancellation_tokens.remove(&run_id);
            result
        });

        Ok(RunHandle {
            run_id,
            events,
            cancel: token,
            join,
        })
    }

    fn register(&self, run_id: Uuid, token: CancellationToken) -> Result<(), ExecutorError> {
        match self.cancellation_tokens.entry(run_id) {
            Entry::Occupied(_) => Err(ExecutorError::AlreadyRunning(run_id)),
            Entry::Vacant(slot) => {
                slot.insert(token);
                Ok(())
            }
        }
    }

    async fn start_registered(
        &self,
        run_id: Uuid,
        token: CancellationToken,
        loaded: &LoadedWorkflow,
        inputs: BTreeMap<String, Value>,
    ) -> Result<RunResult, ExecutorError> {
        let inputs = validate_inputs(&loaded.document, inputs).map_err(ExecutorError::Input)?;

        let mut ctx = RunContext::new(inputs);
        ctx.set_metadata("run_id", Value::String(run_id.to_string()));
        ctx.set_metadata("workflow", Value::String(loaded.name().to_string()));
        ctx.set_metadata("started_at", Value::String(Utc::now().to_rfc3339()));

        self.events.publish(RunEvent::RunStarted {
            run_id,
            workflow_name: loaded.name().to_string(),
            resumed: false,
        });
        tracing::info!(
            run_id = %run_id,
            workflow = loaded.name(),
            steps = loaded.document.steps.len(),
            "starting workflow run"
        );

        let plan = RunPlan {
            run_id,
            token,
            ctx,
            markers: Vec::new(),
            loop_progress: None,
        };
        Ok(self.drive(loaded, plan).await)
    }

    async fn resume_registered(
        &self,
        run_id: Uuid,
        token: CancellationToken,
        loaded: &LoadedWorkflow,
    ) -> Result<RunResult, ExecutorError> {
        let checkpoint = self.checkpoint.load(run_id).await?;
        let next = verify_resumable(&checkpoint, &loaded.document)?;

        self.events.publish(RunEvent::RunStarted {
            run_id,
            workflow_name: loaded.name().to_string(),
            resumed: true,
        });
        tracing::info!(
            run_id = %run_id,
            workflow = loaded.name(),
            next_step = loaded.document.steps.get(next).map(|s| s.name.as_str()).unwrap_or("<end>"),
            loop_progress = checkpoint.loop_progress.is_some(),
            "resuming workflow run"
        );

        let plan = RunPlan {
            run_id,
            token,
            ctx: RunContext::from_snapshot(checkpoint.context),
            markers: checkpoint.completed_step_path,
            loop_progress: checkpoint.loop_progress,
        };
        Ok(self.drive(loaded, plan).await)
    }

    /// Execute every top-level step not covered by `plan.markers`.
    async fn drive(&self, loaded: &LoadedWorkflow, plan: RunPlan) -> RunResult {
        let RunPlan {
            run_id,
            token,
            mut ctx,
            markers,
            mut loop_progress,
        } = plan;
        let doc = &loaded.document;
        let started = Instant::now();
        let start_index = markers.len();

        let progress = Arc::new(RunProgress {
            checkpoint: Arc::clone(&self.checkpoint),
            events: self.events.clone(),
            run_id,
            workflow_name: doc.name.clone(),
            interval: self.config.checkpoint_interval,
            state: Mutex::new(ProgressState {
                markers,
                context: ctx.snapshot(),
                loop_progress: loop_progress.clone(),
                saved: None,
                failures: 0,
            }),
        });

        let runner = StepRunner::new(
            run_id,
            Arc::clone(&loaded.templates),
            Arc::clone(&self.handlers),
            self.events.clone(),
            Arc::clone(&self.config),
            token.clone(),
        )
        .with_progress(Arc::clone(&progress) as Arc<dyn ProgressSink>);

        let mut failure: Option<ErrorRecord> = None;
        let mut cancelled = false;

        for step in doc.steps.iter().skip(start_index) {
            if token.is_cancelled() {
                cancelled = true;
                break;
            }

            let tracking = top_level_loop(step).then(|| LoopTracking {
                resume: loop_progress.take().filter(|p| p.step == step.name),
            });
            let result = runner.run_step(step, &ctx, &step.name, tracking).await;

            match result.error {
                Some(error) if error.kind == ErrorKind::Cancelled => {
                    cancelled = true;
                    break;
                }
                Some(error) => {
                    failure = Some(error);
                    break;
                }
                None => {
                    ctx.set_output(step.name.clone(), result.output);
                    progress.step_completed(step, ctx.snapshot()).await;
                }
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let step_outputs = ctx.step_outputs().clone();

        if cancelled {
            tracing::info!(run_id = %run_id, duration_ms, "workflow run cancelled");
            self.events.publish(RunEvent::RunCancelled { run_id });
            return RunResult {
                run_id,
                workflow_name: doc.name.clone(),
                status: RunStatus::Cancelled,
                step_outputs,
                outputs: Value::Object(Default::default()),
                failed_step: None,
                error: Some(ErrorRecord::new(ErrorKind::Cancelled, "run cancelled")),
                checkpoint_failures: progress.failures().await,
                duration_ms,
            };
        }

        let resolved = match failure {
            Some(error) => Err(error),
            None => resolve_outputs(doc, &loaded.templates, &ctx)
                .map_err(|e| ErrorRecord::new(e.kind(), e.to_string()).at_step("outputs")),
        };

        progress.finish().await;
        let checkpoint_failures = progress.failures().await;

        match resolved {
            Ok(outputs) => {
                tracing::info!(
                    run_id = %run_id,
                    workflow = doc.name.as_str(),
                    duration_ms,
                    checkpoint_failures,
                    "workflow run completed"
                );
                self.events.publish(RunEvent::RunCompleted {
                    run_id,
                    outputs: outputs.clone(),
                    duration_ms,
                });
                RunResult {
                    run_id,
                    workflow_name: doc.name.clone(),
                    status: RunStatus::Completed,
                    step_outputs,
                    outputs,
                    failed_step: None,
                    error: None,
                    checkpoint_failures,
                    duration_ms,
                }
            }
            Err(error) => {
                tracing::info!(
                    run_id = %run_id,
                    workflow = doc.name.as_str(),
                    duration_ms,
                    error = %error,
                    "workflow run failed"
                );
                self.events.publish(RunEvent::RunFailed {
                    run_id,
                    error: error.clone(),
                });
                RunResult {
                    run_id,
                    workflow_name: doc.name.clone(),
                    status: RunStatus::Failed,
                    step_outputs,
                    outputs: Value::Object(Default::default()),
                    failed_step: error.step.clone(),
                    error: Some(error),
                    checkpoint_failures,
                    duration_ms,
                }
            }
        }
    }
}

impl<S: CheckpointStore + 'static> WorkflowExecutor for RunCoordinator<S> {
    async fn start(
        &self,
        loaded: &LoadedWorkflow,
        inputs: BTreeMap<String, Value>,
    ) -> Result<RunResult, ExecutorError> {
        self.start_with_id(Uuid::now_v7(), loaded, inputs).await
    }

    async fn resume(&self, run_id: Uuid, loaded: &LoadedWorkflow) -> Result<RunResult, ExecutorError> {
        let token = CancellationToken::new();
        self.register(run_id, token.clone())?;
        let result = self.resume_registered(run_id, token, loaded).await;
        self.cancellation_tokens.remove(&run_id);
        result
    }

    fn cancel(&self, run_id: Uuid) -> Result<(), ExecutorError> {
        let token = self
            .cancellation_tokens
            .get(&run_id)
            .ok_or(ExecutorError::RunNotFound(run_id))?;
        tracing::info!(run_id = %run_id, "cancellation requested");
        token.cancel();
        Ok(())
    }
}

/// Only sequential loops at the top level checkpoint per iteration.
fn top_level_loop(step: &StepRecord) -> bool {
    matches!(step.kind, StepKind::Loop { parallel: false, .. })
}

struct RunPlan {
    run_id: Uuid,
    token: CancellationToken,
    ctx: RunContext,
    markers: Vec<StepMarker>,
    loop_progress: Option<LoopProgress>,
}

// ---------------------------------------------------------------------------
// Progress tracking
// ---------------------------------------------------------------------------

/// Top-level state a checkpoint must describe.
struct ProgressState {
    markers: Vec<StepMarker>,
    context: ContextSnapshot,
    loop_progress: Option<LoopProgress>,
    /// `(completed steps, loop iteration)` of the last successful save.
    saved: Option<(usize, Option<u32>)>,
    failures: u32,
}

impl ProgressState {
    fn position(&self) -> (usize, Option<u32>) {
        (
            self.markers.len(),
            self.loop_progress.as_ref().map(|p| p.next_iteration),
        )
    }
}

struct RunProgress<S: CheckpointStore> {
    checkpoint: Arc<CheckpointManager<S>>,
    events: EventBus,
    run_id: Uuid,
    workflow_name: String,
    interval: u32,
    state: Mutex<ProgressState>,
}

impl<S: CheckpointStore> RunProgress<S> {
    async fn step_completed(&self, step: &StepRecord, context: ContextSnapshot) {
        let due = {
            let mut state = self.state.lock().await;
            state.markers.push(step_marker(step));
            state.context = context;
            state.loop_progress = None;
            self.interval > 0 && state.markers.len() % self.interval as usize == 0
        };
        if due {
            self.write().await;
        }
    }

    /// Save the final state unless the last save already covers it.
    async fn finish(&self) {
        let current = {
            let state = self.state.lock().await;
            state.saved == Some(state.position())
        };
        if !current {
            self.write().await;
        }
    }

    async fn failures(&self) -> u32 {
        self.state.lock().await.failures
    }

    async fn write(&self) -> bool {
        let (checkpoint, position) = {
            let state = self.state.lock().await;
            let checkpoint = Checkpoint {
                format_version: CHECKPOINT_FORMAT_VERSION,
                run_id: self.run_id,
                workflow_name: self.workflow_name.clone(),
                completed_step_path: state.markers.clone(),
                loop_progress: state.loop_progress.clone(),
                context: state.context.clone(),
                created_at: Utc::now(),
            };
            (checkpoint, state.position())
        };

        match self.checkpoint.save(&checkpoint).await {
            Ok(()) => {
                self.state.lock().await.saved = Some(position);
                self.events.publish(RunEvent::CheckpointWritten {
                    run_id: self.run_id,
                    completed_steps: position.0,
                });
                true
            }
            Err(e) => {
                self.state.lock().await.failures += 1;
                tracing::warn!(run_id = %self.run_id, error = %e, "checkpoint write failed; run continues");
                false
            }
        }
    }
}

impl<S: CheckpointStore + 'static> ProgressSink for RunProgress<S> {
    fn loop_iteration<'a>(&'a self, progress: LoopProgress) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.interval == 0 {
                return;
            }
            self.state.lock().await.loop_progress = Some(progress);
            self.write().await;
        })
    }

    fn barrier(&self) -> BoxFuture<'_, bool> {
        Box::pin(self.write())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    use flowline_types::error::RepositoryError;
    use serde_json::json;

    use super::*;
    use crate::repository::MemoryCheckpointStore;
    use crate::workflow::capability::{CapabilityError, from_fn};
    use crate::workflow::definition::parse_workflow_yaml;

    fn inputs(value: Value) -> BTreeMap<String, Value> {
        value
            .as_object()
            .map(|m| m.clone().into_iter().collect())
            .unwrap_or_default()
    }

    fn echo_handlers() -> HandlerMap {
        HandlerMap::new().register_callable("echo", from_fn(|args| async move { Ok(args) }))
    }

    fn coordinator(handlers: HandlerMap) -> RunCoordinator<MemoryCheckpointStore> {
        RunCoordinator::new(MemoryCheckpointStore::new(), handlers, EngineConfig::default())
    }

    fn drain(rx: &mut broadcast::Receiver<RunEvent>) -> Vec<RunEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    /// A store whose writes always fail.
    struct BrokenStore;

    impl CheckpointStore for BrokenStore {
        async fn save(&self, _run_id: Uuid, _name: &str, _body: &str) -> Result<(), RepositoryError> {
            Err(RepositoryError::Io("disk full".to_string()))
        }

        async fn load(&self, _run_id: Uuid) -> Result<Option<String>, RepositoryError> {
            Ok(None)
        }
    }

    const GREET: &str = r#"
version: "1.0"
name: greet
inputs:
  name: { type: string, required: true }
steps:
  - name: greet
    kind: callable
    callable: echo
    args: "Hello, ${{ inputs.name }}"
outputs:
  greeting: "${{ steps.greet.output }}"
"#;

    #[tokio::test]
    async fn test_greet_scenario() {
        let loaded = parse_workflow_yaml(GREET).unwrap();
        let coordinator = coordinator(echo_handlers());
        let mut rx = coordinator.events().subscribe();

        let result = coordinator
            .start(&loaded, inputs(json!({"name": "Ada", "extra": 42})))
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.outputs["greeting"], json!("Hello, Ada"));
        assert_eq!(result.step_outputs["greet"], json!("Hello, Ada"));

        let events = drain(&mut rx);
        assert!(matches!(events.first(), Some(RunEvent::RunStarted { resumed: false, .. })));
        assert!(matches!(events.last(), Some(RunEvent::RunCompleted { .. })));
        assert!(!coordinator.is_active(result.run_id));

        let stored = coordinator.checkpoints().load(result.run_id).await.unwrap();
        assert_eq!(stored.context.inputs["extra"], json!(42));
    }

    #[tokio::test]
    async fn test_missing_required_input_is_fatal_before_run() {
        let loaded = parse_workflow_yaml(GREET).unwrap();
        let coordinator = coordinator(echo_handlers());
        let mut rx = coordinator.events().subscribe();

        let err = coordinator.start(&loaded, BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Input(_)));
        assert_eq!(err.kind(), ErrorKind::Input);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_false_branch_without_else_succeeds_empty() {
        let loaded = parse_workflow_yaml(
            r#"
version: "1.0"
name: branchy
inputs:
  flag: { type: boolean, required: true }
steps:
  - name: maybe
    kind: branch
    when: "${{ inputs.flag }}"
    then:
      - { name: inner, kind: callable, callable: echo, args: 1 }
"#,
        )
        .unwrap();
        let coordinator = coordinator(echo_handlers());

        let result = coordinator
            .start(&loaded, inputs(json!({"flag": false})))
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.step_outputs["maybe"], json!({}));
    }

    const FOUR_STEPS: &str = r#"
version: "1.0"
name: four
inputs:
  seed: { type: string, default: "s" }
steps:
  - { name: one, kind: callable, callable: track, args: "${{ inputs.seed }}1" }
  - { name: two, kind: callable, callable: track, args: "${{ steps.one.output }}2" }
  - { name: three, kind: callable, callable: flaky, args: "${{ steps.two.output }}3" }
  - { name: four, kind: callable, callable: track, args: "${{ steps.three.output }}4" }
outputs:
  last: "${{ steps.four.output }}"
"#;

    fn four_step_handlers(calls: Arc<AtomicU32>, crash: Arc<AtomicBool>) -> HandlerMap {
        let track_calls = Arc::clone(&calls);
        HandlerMap::new()
            .register_callable(
                "track",
                from_fn(move |args| {
                    track_calls.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(args) }
                }),
            )
            .register_callable(
                "flaky",
                from_fn(move |args| {
                    let crashing = crash.swap(false, Ordering::SeqCst);
                    async move {
                        if crashing {
                            Err(CapabilityError::Failed("process died".to_string()))
                        } else {
                            Ok(args)
                        }
                    }
                }),
            )
    }

    #[tokio::test]
    async fn test_resume_after_crash_matches_clean_run() {
        let loaded = parse_workflow_yaml(FOUR_STEPS).unwrap();

        let clean = coordinator(four_step_handlers(Arc::default(), Arc::default()))
            .start(&loaded, BTreeMap::new())
            .await
            .unwrap();
        assert!(clean.is_success());

        let calls = Arc::new(AtomicU32::new(0));
        let crash = Arc::new(AtomicBool::new(true));
        let coordinator = coordinator(four_step_handlers(Arc::clone(&calls), crash));

        let crashed = coordinator.start(&loaded, BTreeMap::new()).await.unwrap();
        assert_eq!(crashed.status, RunStatus::Failed);
        assert_eq!(crashed.failed_step.as_deref(), Some("three"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let mut rx = coordinator.events().subscribe();
        let resumed = coordinator.resume(crashed.run_id, &loaded).await.unwrap();
        assert!(resumed.is_success());
        // Only `four` ran again through `track`.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(resumed.step_outputs, clean.step_outputs);
        assert_eq!(resumed.outputs, clean.outputs);
        assert_eq!(resumed.outputs["last"], json!("s1234"));

        let started: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                RunEvent::StepStarted { path, .. } => Some(path),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec!["three", "four"]);
    }

    #[tokio::test]
    async fn test_resume_rejects_edited_document() {
        let loaded = parse_workflow_yaml(FOUR_STEPS).unwrap();
        let coordinator = coordinator(four_step_handlers(Arc::default(), Arc::new(AtomicBool::new(true))));
        let crashed = coordinator.start(&loaded, BTreeMap::new()).await.unwrap();

        let edited = parse_workflow_yaml(&FOUR_STEPS.replace("}1\"", "}one\"")).unwrap();
        let err = coordinator.resume(crashed.run_id, &edited).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CheckpointCorrupt);
        assert!(err.to_string().contains("start a fresh run"));
    }

    #[tokio::test]
    async fn test_resume_unknown_run() {
        let loaded = parse_workflow_yaml(GREET).unwrap();
        let err = coordinator(echo_handlers())
            .resume(Uuid::now_v7(), &loaded)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Checkpoint(CheckpointError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_loop_resumes_mid_iteration() {
        let loaded = parse_workflow_yaml(
            r#"
version: "1.0"
name: looped
inputs:
  items: { type: array, required: true }
steps:
  - name: each
    kind: loop
    over: "${{ inputs.items }}"
    max_iterations: 10
    steps:
      - { name: body, kind: callable, callable: work, args: "${{ item }}" }
"#,
        )
        .unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let crash = Arc::new(AtomicBool::new(true));
        let (c, k) = (Arc::clone(&calls), Arc::clone(&crash));
        let work = from_fn(move |args: Value| {
            c.fetch_add(1, Ordering::SeqCst);
            let fail = args == json!("c") && k.swap(false, Ordering::SeqCst);
            async move {
                if fail {
                    Err(CapabilityError::Failed("interrupted".to_string()))
                } else {
                    Ok(json!(format!("done {}", args.as_str().unwrap_or_default())))
                }
            }
        });
        let coordinator = coordinator(HandlerMap::new().register_callable("work", work));
        let run_inputs = inputs(json!({"items": ["a", "b", "c", "d"]}));

        let crashed = coordinator.start(&loaded, run_inputs).await.unwrap();
        assert_eq!(crashed.failed_step.as_deref(), Some("each[2]/body"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let stored = coordinator.checkpoints().load(crashed.run_id).await.unwrap();
        let progress = stored.loop_progress.unwrap();
        assert_eq!(progress.next_iteration, 2);

        let resumed = coordinator.resume(crashed.run_id, &loaded).await.unwrap();
        assert!(resumed.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(
            resumed.step_outputs["each"],
            json!([
                {"body": "done a"},
                {"body": "done b"},
                {"body": "done c"},
                {"body": "done d"}
            ])
        );
    }

    #[tokio::test]
    async fn test_checkpoint_interval_and_final_save() {
        let loaded = parse_workflow_yaml(
            r#"
version: "1.0"
name: three
steps:
  - { name: a, kind: callable, callable: echo, args: 1 }
  - { name: b, kind: callable, callable: echo, args: 2 }
  - { name: c, kind: callable, callable: echo, args: 3 }
"#,
        )
        .unwrap();

        let count_writes = |events: Vec<RunEvent>| {
            events
                .into_iter()
                .filter_map(|e| match e {
                    RunEvent::CheckpointWritten { completed_steps, .. } => Some(completed_steps),
                    _ => None,
                })
                .collect::<Vec<_>>()
        };

        let every = coordinator(echo_handlers());
        let mut rx = every.events().subscribe();
        every.start(&loaded, BTreeMap::new()).await.unwrap();
        assert_eq!(count_writes(drain(&mut rx)), vec![1, 2, 3]);

        let config = EngineConfig {
            checkpoint_interval: 2,
            ..EngineConfig::default()
        };
        let pairs = RunCoordinator::new(MemoryCheckpointStore::new(), echo_handlers(), config);
        let mut rx = pairs.events().subscribe();
        pairs.start(&loaded, BTreeMap::new()).await.unwrap();
        assert_eq!(count_writes(drain(&mut rx)), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_explicit_checkpoint_with_interval_disabled() {
        let loaded = parse_workflow_yaml(
            r#"
version: "1.0"
name: barrier
steps:
  - { name: a, kind: callable, callable: echo, args: 1 }
  - { name: save, kind: checkpoint }
  - { name: b, kind: callable, callable: echo, args: 2 }
"#,
        )
        .unwrap();
        let config = EngineConfig {
            checkpoint_interval: 0,
            ..EngineConfig::default()
        };
        let coordinator = RunCoordinator::new(MemoryCheckpointStore::new(), echo_handlers(), config);
        let mut rx = coordinator.events().subscribe();

        let result = coordinator.start(&loaded, BTreeMap::new()).await.unwrap();
        assert_eq!(result.step_outputs["save"], json!({"written": true}));

        let writes: Vec<usize> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                RunEvent::CheckpointWritten { completed_steps, .. } => Some(completed_steps),
                _ => None,
            })
            .collect();
        // The barrier describes the state before the checkpoint step; the
        // final save covers everything.
        assert_eq!(writes, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_checkpoint_io_failure_does_not_fail_run() {
        let loaded = parse_workflow_yaml(GREET).unwrap();
        let coordinator = RunCoordinator::new(BrokenStore, echo_handlers(), EngineConfig::default());

        let result = coordinator
            .start(&loaded, inputs(json!({"name": "Ada"})))
            .await
            .unwrap();
        assert!(result.is_success());
        assert!(result.checkpoint_failures >= 1);
    }

    #[tokio::test]
    async fn test_failure_names_step_and_publishes_run_failed() {
        let loaded = parse_workflow_yaml(
            r#"
version: "1.0"
name: failing
steps:
  - { name: ok, kind: callable, callable: echo, args: 1 }
  - { name: missing, kind: callable, callable: nobody }
  - { name: never, kind: callable, callable: echo, args: 2 }
"#,
        )
        .unwrap();
        let coordinator = coordinator(echo_handlers());
        let mut rx = coordinator.events().subscribe();

        let result = coordinator.start(&loaded, BTreeMap::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.failed_step.as_deref(), Some("missing"));
        assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::StepExecution);
        assert!(!result.step_outputs.contains_key("never"));

        let events = drain(&mut rx);
        assert!(matches!(events.last(), Some(RunEvent::RunFailed { .. })));
    }

    #[tokio::test]
    async fn test_cancel_spawned_run() {
        let loaded = parse_workflow_yaml(
            r#"
version: "1.0"
name: slow
steps:
  - { name: quick, kind: callable, callable: echo, args: 1 }
  - { name: hang, kind: callable, callable: hang }
  - { name: after, kind: callable, callable: echo, args: 2 }
"#,
        )
        .unwrap();
        let handlers = echo_handlers().register_callable(
            "hang",
            from_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Value::Null)
            }),
        );
        let coordinator = Arc::new(coordinator(handlers));
        let mut handle = coordinator.spawn(loaded, BTreeMap::new(), None).unwrap();
        let run_id = handle.run_id;

        loop {
            match handle.events.recv().await.unwrap() {
                RunEvent::StepStarted { name, .. } if name == "hang" => break,
                _ => {}
            }
        }
        assert!(coordinator.is_active(run_id));
        coordinator.cancel(run_id).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.status, RunStatus::Cancelled);
        assert!(!result.step_outputs.contains_key("hang"));
        assert!(!coordinator.is_active(run_id));

        let stored = coordinator.checkpoints().load(run_id).await.unwrap();
        assert_eq!(stored.completed_step_path.len(), 1);
        assert!(matches!(coordinator.cancel(run_id), Err(ExecutorError::RunNotFound(_))));
    }

    #[tokio::test]
    async fn test_into_parts_streams_events_while_waiting() {
        let loaded = parse_workflow_yaml(GREET).unwrap();
        let coordinator = Arc::new(coordinator(echo_handlers()));
        let handle = coordinator
            .spawn(loaded, inputs(json!({"name": "Ada"})), None)
            .unwrap();
        let run_id = handle.run_id;
        let (mut events, cancel, done) = handle.into_parts();

        let result = tokio::time::timeout(Duration::from_secs(5), done)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.run_id, run_id);
        assert_eq!(result.status, RunStatus::Completed);
        assert!(!cancel.is_cancelled());

        let seen = drain(&mut events);
        assert!(matches!(seen.first(), Some(RunEvent::RunStarted { .. })));
        assert!(matches!(seen.last(), Some(RunEvent::RunCompleted { .. })));
        assert!(seen.iter().all(|e| e.run_id() == run_id));
    }

    #[tokio::test]
    async fn test_duplicate_run_id_is_rejected() {
        let loaded = parse_workflow_yaml(GREET).unwrap();
        let coordinator = Arc::new(coordinator(echo_handlers()));
        let run_id = Uuid::now_v7();
        coordinator
            .register(run_id, CancellationToken::new())
            .unwrap();

        let err = coordinator
            .spawn(loaded, inputs(json!({"name": "Ada"})), Some(run_id))
            .unwrap_err();
        assert!(matches!(err, ExecutorError::AlreadyRunning(_)));
    }
}
