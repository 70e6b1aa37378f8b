//! Flow-control step handlers: branch, loop, checkpoint, subworkflow.
//!
//! These are the only places failure containment and scoping change.
//! Each handler works on its own clone of the run context (layers are
//! copy-on-write) and returns the step's output; nothing here writes to the
//! caller's context.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use flowline_types::checkpoint::LoopProgress;
use flowline_types::event::RunEvent;
use flowline_types::run::ErrorRecord;
use flowline_types::workflow::{StepKind, StepRecord, WorkflowDocument};
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::expression::{LoopFrame, evaluate, is_truthy};
use crate::expression::eval::type_name;

use super::context::RunContext;
use super::definition::validate_inputs;
use super::step_runner::{LoopTracking, StepError, StepRunner, child_path, resolve_outputs};

type Iteration = Result<(Value, bool), ErrorRecord>;

fn layer_to_value(layer: BTreeMap<String, Value>) -> Value {
    Value::Object(layer.into_iter().collect())
}

impl StepRunner {
    // -----------------------------------------------------------------------
    // Branch
    // -----------------------------------------------------------------------

    /// Run exactly one of `then`/`otherwise`. The output is the map of
    /// outputs produced by the chosen list.
    pub(crate) async fn branch(
        &self,
        when: &str,
        then: &[StepRecord],
        otherwise: Option<&[StepRecord]>,
        ctx: &RunContext,
        path: &str,
    ) -> Result<Value, StepError> {
        let condition = self.templates.condition(when)?;
        let chosen = is_truthy(&evaluate(&condition, ctx)?);
        let (selected, skipped) = if chosen {
            (then, otherwise.unwrap_or_default())
        } else {
            (otherwise.unwrap_or_default(), then)
        };

        tracing::debug!(run_id = %self.run_id, step = path, chosen, steps = selected.len(), "branch evaluated");

        for step in skipped {
            self.events.publish(RunEvent::StepSkipped {
                run_id: self.run_id,
                name: step.name.clone(),
                path: child_path(path, &step.name),
            });
        }

        let mut scope = ctx.clone();
        scope.push_layer();
        self.run_list(selected, &mut scope, path)
            .await
            .map_err(StepError::Nested)?;
        Ok(layer_to_value(scope.pop_layer()))
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    /// Iterate the loop body. The output is an array of per-iteration
    /// output maps in index order.
    pub(crate) async fn run_loop(
        &self,
        step: &StepRecord,
        ctx: &RunContext,
        path: &str,
        tracking: Option<&LoopTracking>,
    ) -> Result<Value, StepError> {
        let StepKind::Loop {
            over,
            max_iterations,
            break_when,
            parallel,
            max_concurrency,
            steps: body,
        } = &step.kind
        else {
            return Err(StepError::Execution(format!("step '{}' is not a loop", step.name)));
        };

        let items = match over {
            Some(raw) => {
                let node = self.templates.condition(raw)?;
                match evaluate(&node, ctx)? {
                    Value::Array(items) => Some(items),
                    other => {
                        return Err(StepError::Eval(crate::expression::EvalError::TypeMismatch {
                            raw: raw.clone(),
                            detail: format!("loop 'over' must be an array, got {}", type_name(&other)),
                        }));
                    }
                }
            }
            None => None,
        };
        let total = match &items {
            Some(items) => items.len().min(*max_iterations as usize),
            None => *max_iterations as usize,
        };
        let items = items.unwrap_or_default();

        if *parallel {
            let limit = max_concurrency.unwrap_or(self.config.max_parallelism).max(1) as usize;
            return self
                .run_parallel(body, break_when.as_deref(), ctx, path, items, total, limit)
                .await;
        }

        let (start, mut outputs) = match tracking.and_then(|t| t.resume.as_ref()) {
            Some(progress) if progress.step == step.name => {
                tracing::info!(
                    run_id = %self.run_id,
                    step = path,
                    next_iteration = progress.next_iteration,
                    "resuming loop"
                );
                (progress.next_iteration as usize, progress.outputs.clone())
            }
            _ => (0, Vec::new()),
        };

        for index in start..total {
            let item = items.get(index).cloned().unwrap_or(Value::Null);
            let (output, stop) = self
                .iteration(body, break_when.as_deref(), ctx, index, item, path)
                .await
                .map_err(StepError::Nested)?;
            outputs.push(output);

            if stop {
                tracing::debug!(run_id = %self.run_id, step = path, index, "loop break condition met");
                break;
            }
            if let (Some(_), Some(sink)) = (tracking, &self.progress) {
                sink.loop_iteration(LoopProgress {
                    step: step.name.clone(),
                    next_iteration: (index + 1) as u32,
                    outputs: outputs.clone(),
                })
                .await;
            }
        }

        Ok(Value::Array(outputs))
    }

    /// One pass over the body: push frame and layer, run, pop frame,
    /// evaluate `break_when`, pop layer. Returns the iteration's outputs and
    /// whether to stop.
    async fn iteration(
        &self,
        body: &[StepRecord],
        break_when: Option<&str>,
        ctx: &RunContext,
        index: usize,
        item: Value,
        path: &str,
    ) -> Iteration {
        let mut scope = ctx.clone();
        scope.push_frame(LoopFrame {
            item,
            index: index as u64,
        });
        scope.push_layer();

        let iteration_path = format!("{path}[{index}]");
        self.run_list(body, &mut scope, &iteration_path).await?;
        scope.pop_frame();

        let stop = match break_when {
            Some(raw) => {
                let node = self
                    .templates
                    .condition(raw)
                    .map_err(|e| StepError::from(e).into_record(path))?;
                let value = evaluate(&node, &scope).map_err(|e| StepError::from(e).into_record(path))?;
                is_truthy(&value)
            }
            None => false,
        };

        Ok((layer_to_value(scope.pop_layer()), stop))
    }

    /// Bounded fan-out. New launches stop after a failure, a satisfied
    /// `break_when`, or cancellation; everything already launched is awaited
    /// and joined in index order.
    #[allow(clippy::too_many_arguments)]
    async fn run_parallel(
        &self,
        body: &[StepRecord],
        break_when: Option<&str>,
        ctx: &RunContext,
        path: &str,
        items: Vec<Value>,
        total: usize,
        limit: usize,
    ) -> Result<Value, StepError> {
        let semaphore = Arc::new(Semaphore::new(limit));
        let halt = Arc::new(AtomicBool::new(false));
        let body: Arc<[StepRecord]> = Arc::from(body);
        let break_when: Option<Arc<str>> = break_when.map(Arc::from);
        let mut join_set = JoinSet::new();

        tracing::debug!(run_id = %self.run_id, step = path, total, limit, "parallel loop started");

        for index in 0..total {
            if halt.load(Ordering::SeqCst) {
                break;
            }
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => permit
                    .map_err(|e| StepError::Execution(format!("loop scheduler closed: {e}")))?,
            };
            // Another iteration may have failed or broken while we waited.
            if halt.load(Ordering::SeqCst) {
                break;
            }

            let runner = self.clone();
            let body = Arc::clone(&body);
            let break_when = break_when.clone();
            let scope = ctx.clone();
            let path = path.to_string();
            let halt = Arc::clone(&halt);
            let item = items.get(index).cloned().unwrap_or(Value::Null);

            join_set.spawn(async move {
                let _permit = permit;
                let result = runner
                    .iteration(&body, break_when.as_deref(), &scope, index, item, &path)
                    .await;
                if !matches!(result, Ok((_, false))) {
                    halt.store(true, Ordering::SeqCst);
                }
                (index, result)
            });
        }

        let mut results: BTreeMap<usize, Iteration> = BTreeMap::new();
        while let Some(joined) = join_set.join_next().await {
            let (index, result) =
                joined.map_err(|e| StepError::Execution(format!("loop iteration task failed: {e}")))?;
            results.insert(index, result);
        }

        if self.cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }

        let mut outputs = Vec::with_capacity(results.len());
        for (_, result) in results {
            let (output, _) = result.map_err(StepError::Nested)?;
            outputs.push(output);
        }
        Ok(Value::Array(outputs))
    }

    // -----------------------------------------------------------------------
    // Checkpoint
    // -----------------------------------------------------------------------

    /// Force a durability barrier. Storage failures are reported by the sink
    /// and never fail the step.
    pub(crate) async fn checkpoint_barrier(&self) -> Value {
        let written = match &self.progress {
            Some(sink) => sink.barrier().await,
            None => false,
        };
        json!({ "written": written })
    }

    // -----------------------------------------------------------------------
    // Subworkflow
    // -----------------------------------------------------------------------

    /// Run a nested document against a fresh context holding only the
    /// inputs passed to it. The output is the nested document's outputs.
    pub(crate) async fn subworkflow(
        &self,
        workflow: Option<&WorkflowDocument>,
        inputs: &BTreeMap<String, Value>,
        ctx: &RunContext,
        path: &str,
    ) -> Result<Value, StepError> {
        let doc = workflow.ok_or_else(|| {
            StepError::Execution("subworkflow document was not resolved".to_string())
        })?;

        let depth = self.depth + 1;
        if depth > self.config.max_subworkflow_depth {
            return Err(StepError::Execution(format!(
                "subworkflow depth {depth} exceeds maximum {}",
                self.config.max_subworkflow_depth
            )));
        }

        let mut passed = BTreeMap::new();
        for (name, value) in inputs {
            passed.insert(name.clone(), self.templates.render_value(value, ctx)?);
        }
        let passed = validate_inputs(doc, passed).map_err(StepError::Input)?;

        tracing::debug!(run_id = %self.run_id, step = path, workflow = doc.name.as_str(), depth, "subworkflow started");

        let child = StepRunner {
            depth,
            ..self.clone()
        };
        let mut scope = ctx.fork(passed);
        scope.set_metadata("parent_step", Value::String(path.to_string()));
        child
            .run_list(&doc.steps, &mut scope, path)
            .await
            .map_err(StepError::Nested)?;

        Ok(resolve_outputs(doc, &self.templates, &scope)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    use flowline_types::config::EngineConfig;
    use flowline_types::run::{ErrorKind, StepStatus};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::*;
    use crate::event::EventBus;
    use crate::workflow::capability::{CapabilityError, HandlerMap, from_fn};
    use crate::workflow::definition::{LoadedWorkflow, parse_workflow_yaml};

    fn handlers() -> HandlerMap {
        HandlerMap::new()
            .register_callable("echo", from_fn(|args| async move { Ok(args) }))
            .register_callable(
                "fail",
                from_fn(|args| async move { Err(CapabilityError::Failed(format!("failed on {args}"))) }),
            )
            .register_callable(
                "nap",
                from_fn(|args| async move {
                    let ms = args["ms"].as_u64().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(args["value"].clone())
                }),
            )
    }

    fn runner_for(loaded: &LoadedWorkflow, handlers: HandlerMap) -> StepRunner {
        StepRunner::new(
            Uuid::now_v7(),
            Arc::clone(&loaded.templates),
            Arc::new(handlers),
            EventBus::new(1024),
            Arc::new(EngineConfig::default()),
            CancellationToken::new(),
        )
    }

    fn ctx_with(inputs: Value) -> RunContext {
        let map = inputs
            .as_object()
            .map(|m| m.clone().into_iter().collect())
            .unwrap_or_default();
        RunContext::new(map)
    }

    fn count_started(events: &[RunEvent]) -> HashMap<String, u32> {
        let mut counts = HashMap::new();
        for event in events {
            if let RunEvent::StepStarted { path, .. } = event {
                *counts.entry(path.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<RunEvent>) -> Vec<RunEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_false_branch_without_else_runs_nothing() {
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
      - { name: inner, kind: callable, callable: echo, args: "ran" }
"#,
        )
        .unwrap();
        let r = runner_for(&loaded, handlers());
        let mut rx = r.events.subscribe();
        let step = &loaded.document.steps[0];

        let result = r
            .run_step(step, &ctx_with(json!({"flag": false})), "maybe", None)
            .await;
        assert_eq!(result.status, StepStatus::Succeeded);
        assert_eq!(result.output, json!({}));

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            RunEvent::StepSkipped { path, .. } if path == "maybe/inner"
        )));
        assert!(!count_started(&events).contains_key("maybe/inner"));

        let result = r
            .run_step(step, &ctx_with(json!({"flag": true})), "maybe", None)
            .await;
        assert_eq!(result.output, json!({"inner": "ran"}));
    }

    #[tokio::test]
    async fn test_else_branch_sees_outer_outputs() {
        let loaded = parse_workflow_yaml(
            r#"
version: "1.0"
name: branchy
steps:
  - { name: before, kind: callable, callable: echo, args: "outer" }
  - name: maybe
    kind: branch
    when: "false"
    then:
      - { name: a, kind: callable, callable: echo, args: 1 }
    else:
      - { name: b, kind: callable, callable: echo, args: "${{ steps.before.output }}" }
      - { name: c, kind: callable, callable: echo, args: "${{ steps.b.output }}!" }
"#,
        )
        .unwrap();
        let r = runner_for(&loaded, handlers());
        let mut ctx = ctx_with(json!({}));
        ctx.set_output("before", json!("outer"));

        let result = r.run_step(&loaded.document.steps[1], &ctx, "maybe", None).await;
        assert_eq!(result.output, json!({"b": "outer", "c": "outer!"}));
    }

    #[tokio::test]
    async fn test_loop_runs_once_per_element() {
        let loaded = parse_workflow_yaml(
            r#"
version: "1.0"
name: loops
inputs:
  items: { type: array, required: true }
steps:
  - name: each
    kind: loop
    over: "${{ inputs.items }}"
    max_iterations: 10
    steps:
      - { name: body, kind: callable, callable: echo, args: { value: "${{ item }}", at: "${{ index }}" } }
"#,
        )
        .unwrap();
        let r = runner_for(&loaded, handlers());
        let mut rx = r.events.subscribe();
        let ctx = ctx_with(json!({"items": ["a", "b", "c", "d", "e"]}));

        let result = r.run_step(&loaded.document.steps[0], &ctx, "each", None).await;
        let outputs = result.output.as_array().unwrap().clone();
        assert_eq!(outputs.len(), 5);
        assert_eq!(outputs[3], json!({"body": {"value": "d", "at": 3}}));

        let starts = count_started(&drain(&mut rx));
        assert_eq!((0..5).filter(|i| starts.contains_key(&format!("each[{i}]/body"))).count(), 5);
    }

    #[tokio::test]
    async fn test_loop_break_after_second_iteration() {
        let loaded = parse_workflow_yaml(
            r#"
version: "1.0"
name: loops
inputs:
  items: { type: array, required: true }
steps:
  - name: until
    kind: loop
    over: "${{ inputs.items }}"
    max_iterations: 10
    break_when: "${{ steps.body.output.stop }}"
    steps:
      - name: body
        kind: callable
        callable: echo
        args: { stop: "${{ item.last }}" }
"#,
        )
        .unwrap();
        let r = runner_for(&loaded, handlers());
        let items = json!([{"last": false}, {"last": true}, {"last": false}, {"last": false}, {"last": false}]);
        let ctx = ctx_with(json!({ "items": items }));

        let result = r.run_step(&loaded.document.steps[0], &ctx, "until", None).await;
        assert_eq!(result.output.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_count_loop_and_max_iterations_cap() {
        let loaded = parse_workflow_yaml(
            r#"
version: "1.0"
name: counted
inputs:
  items: { type: array, default: [1, 2, 3, 4, 5, 6] }
steps:
  - name: thrice
    kind: loop
    max_iterations: 3
    steps:
      - { name: body, kind: callable, callable: echo, args: "${{ index }}" }
  - name: capped
    kind: loop
    over: "inputs.items"
    max_iterations: 2
    steps:
      - { name: body, kind: callable, callable: echo, args: "${{ item }}" }
"#,
        )
        .unwrap();
        let r = runner_for(&loaded, handlers());
        let ctx = ctx_with(json!({"items": [1, 2, 3, 4, 5, 6]}));

        let result = r.run_step(&loaded.document.steps[0], &ctx, "thrice", None).await;
        assert_eq!(result.output, json!([{"body": 0}, {"body": 1}, {"body": 2}]));

        let result = r.run_step(&loaded.document.steps[1], &ctx, "capped", None).await;
        assert_eq!(result.output, json!([{"body": 1}, {"body": 2}]));
    }

    #[tokio::test]
    async fn test_loop_over_non_array_is_type_mismatch() {
        let loaded = parse_workflow_yaml(
            r#"
version: "1.0"
name: bad
inputs:
  items: { type: any, required: true }
steps:
  - name: each
    kind: loop
    over: "inputs.items"
    max_iterations: 2
    steps:
      - { name: body, kind: callable, callable: echo }
"#,
        )
        .unwrap();
        let r = runner_for(&loaded, handlers());
        let result = r
            .run_step(&loaded.document.steps[0], &ctx_with(json!({"items": "abc"})), "each", None)
            .await;
        assert_eq!(result.error.unwrap().kind, ErrorKind::TypeMismatch);
    }

    #[tokio::test]
    async fn test_body_failure_halts_loop_and_names_inner_step() {
        let loaded = parse_workflow_yaml(
            r#"
version: "1.0"
name: failing
steps:
  - name: each
    kind: loop
    max_iterations: 5
    steps:
      - { name: ok, kind: callable, callable: echo, args: "${{ index }}" }
      - name: gate
        kind: branch
        when: "index"
        then:
          - { name: boom, kind: callable, callable: fail, args: "${{ index }}" }
"#,
        )
        .unwrap();
        let r = runner_for(&loaded, handlers());
        let mut rx = r.events.subscribe();

        let result = r
            .run_step(&loaded.document.steps[0], &ctx_with(json!({})), "each", None)
            .await;
        let error = result.error.unwrap();
        assert_eq!(error.kind, ErrorKind::StepExecution);
        assert_eq!(error.step.as_deref(), Some("each[1]/gate/boom"));

        let starts = count_started(&drain(&mut rx));
        assert!(!starts.contains_key("each[2]/ok"));
    }

    #[tokio::test]
    async fn test_parallel_loop_joins_in_index_order() {
        let loaded = parse_workflow_yaml(
            r#"
version: "1.0"
name: fan
inputs:
  items: { type: array, required: true }
steps:
  - name: each
    kind: loop
    over: "inputs.items"
    max_iterations: 10
    parallel: true
    max_concurrency: 3
    steps:
      - { name: work, kind: callable, callable: nap, args: { ms: "${{ item }}", value: "${{ index }}" } }
"#,
        )
        .unwrap();
        let r = runner_for(&loaded, handlers());
        // Later iterations finish first.
        let ctx = ctx_with(json!({"items": [60, 40, 20, 0, 10]}));

        let result = r.run_step(&loaded.document.steps[0], &ctx, "each", None).await;
        assert_eq!(result.status, StepStatus::Succeeded);
        assert_eq!(
            result.output,
            json!([{"work": 0}, {"work": 1}, {"work": 2}, {"work": 3}, {"work": 4}])
        );
    }

    #[tokio::test]
    async fn test_parallel_loop_respects_concurrency_limit() {
        let active = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
        let tracked = from_fn(move |_| {
            let (a, p) = (Arc::clone(&a), Arc::clone(&p));
            async move {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                a.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        });
        let loaded = parse_workflow_yaml(
            r#"
version: "1.0"
name: fan
steps:
  - name: each
    kind: loop
    max_iterations: 8
    parallel: true
    max_concurrency: 2
    steps:
      - { name: work, kind: callable, callable: tracked }
"#,
        )
        .unwrap();
        let r = runner_for(&loaded, HandlerMap::new().register_callable("tracked", tracked));

        let result = r
            .run_step(&loaded.document.steps[0], &ctx_with(json!({})), "each", None)
            .await;
        assert_eq!(result.output.as_array().unwrap().len(), 8);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_parallel_failure_reports_lowest_index() {
        let loaded = parse_workflow_yaml(
            r#"
version: "1.0"
name: fan
inputs:
  items: { type: array, required: true }
steps:
  - name: each
    kind: loop
    over: "inputs.items"
    max_iterations: 10
    parallel: true
    max_concurrency: 4
    steps:
      - name: pick
        kind: branch
        when: "item.bad"
        then:
          - { name: boom, kind: callable, callable: fail, args: "${{ index }}" }
"#,
        )
        .unwrap();
        let r = runner_for(&loaded, handlers());
        let ctx = ctx_with(json!({"items": [{"bad": false}, {"bad": true}, {"bad": true}, {"bad": false}]}));

        let result = r.run_step(&loaded.document.steps[0], &ctx, "each", None).await;
        let error = result.error.unwrap();
        assert_eq!(error.step.as_deref(), Some("each[1]/pick/boom"));
    }

    #[tokio::test]
    async fn test_parallel_break_keeps_launched_iterations() {
        let loaded = parse_workflow_yaml(
            r#"
version: "1.0"
name: fan
inputs:
  items: { type: array, required: true }
steps:
  - name: each
    kind: loop
    over: "inputs.items"
    max_iterations: 10
    parallel: true
    max_concurrency: 1
    break_when: "${{ steps.body.output.stop }}"
    steps:
      - name: body
        kind: callable
        callable: echo
        args: { stop: "${{ item.last }}", at: "${{ index }}" }
"#,
        )
        .unwrap();
        let r = runner_for(&loaded, handlers());
        let mut rx = r.events.subscribe();
        let items = json!([{"last": false}, {"last": true}, {"last": false}, {"last": false}]);
        let ctx = ctx_with(json!({ "items": items }));

        let result = r.run_step(&loaded.document.steps[0], &ctx, "each", None).await;
        assert_eq!(result.status, StepStatus::Succeeded);
        assert_eq!(
            result.output,
            json!([
                {"body": {"stop": false, "at": 0}},
                {"body": {"stop": true, "at": 1}}
            ])
        );

        let starts = count_started(&drain(&mut rx));
        assert!(!starts.contains_key("each[2]/body"));
    }

    #[tokio::test]
    async fn test_cancel_during_parallel_fan_out() {
        let loaded = parse_workflow_yaml(
            r#"
version: "1.0"
name: fan
steps:
  - name: each
    kind: loop
    max_iterations: 4
    parallel: true
    max_concurrency: 2
    steps:
      - { name: work, kind: callable, callable: nap, args: { ms: 5000, value: "${{ index }}" } }
"#,
        )
        .unwrap();
        let r = runner_for(&loaded, handlers());
        let mut rx = r.events.subscribe();
        let token = r.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let result = r
            .run_step(&loaded.document.steps[0], &ctx_with(json!({})), "each", None)
            .await;
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.error.unwrap().kind, ErrorKind::Cancelled);

        let events = drain(&mut rx);
        assert!(count_started(&events).contains_key("each[0]/work"));
        assert!(!events.iter().any(|e| matches!(e, RunEvent::StepCompleted { .. })));
    }

    #[tokio::test]
    async fn test_inner_break_when_reads_outer_item() {
        let loaded = parse_workflow_yaml(
            r#"
version: "1.0"
name: nested
inputs:
  rows: { type: array, required: true }
steps:
  - name: outer
    kind: loop
    over: "${{ inputs.rows }}"
    max_iterations: 10
    steps:
      - name: inner
        kind: loop
        max_iterations: 3
        break_when: "${{ item.stop }}"
        steps:
          - { name: body, kind: callable, callable: echo, args: "${{ index }}" }
"#,
        )
        .unwrap();
        let r = runner_for(&loaded, handlers());
        let ctx = ctx_with(json!({"rows": [{"stop": true}, {"stop": false}]}));

        let result = r.run_step(&loaded.document.steps[0], &ctx, "outer", None).await;
        assert_eq!(result.status, StepStatus::Succeeded);
        assert_eq!(
            result.output,
            json!([
                {"inner": [{"body": 0}]},
                {"inner": [{"body": 0}, {"body": 1}, {"body": 2}]}
            ])
        );
    }

    #[tokio::test]
    async fn test_subworkflow_isolated_context_and_outputs() {
        let loaded = parse_workflow_yaml(
            r#"
version: "1.0"
name: parent
inputs:
  name: { type: string, required: true }
steps:
  - { name: hidden, kind: callable, callable: echo, args: "parent-only" }
  - name: nested
    kind: subworkflow
    inputs: { who: "${{ inputs.name }}" }
    workflow:
      version: "1.0"
      name: child
      inputs:
        who: { type: string, required: true }
        greeting: { type: string, default: "Hi" }
      steps:
        - { name: hidden, kind: callable, callable: echo, args: "${{ inputs.greeting }} ${{ inputs.who }}" }
      outputs:
        said: "${{ steps.hidden.output }}"
"#,
        )
        .unwrap();
        let r = runner_for(&loaded, handlers());
        let mut ctx = ctx_with(json!({"name": "Ada"}));
        ctx.set_output("hidden", json!("parent-only"));

        let result = r.run_step(&loaded.document.steps[1], &ctx, "nested", None).await;
        assert_eq!(result.output, json!({"said": "Hi Ada"}));
    }

    #[tokio::test]
    async fn test_subworkflow_depth_limit() {
        let loaded = parse_workflow_yaml(
            r#"
version: "1.0"
name: parent
steps:
  - name: nested
    kind: subworkflow
    workflow:
      version: "1.0"
      name: child
      steps:
        - { name: leaf, kind: callable, callable: echo }
"#,
        )
        .unwrap();
        let mut r = runner_for(&loaded, handlers());
        r.depth = EngineConfig::default().max_subworkflow_depth;

        let result = r
            .run_step(&loaded.document.steps[0], &ctx_with(json!({})), "nested", None)
            .await;
        let error = result.error.unwrap();
        assert_eq!(error.kind, ErrorKind::StepExecution);
        assert!(error.message.contains("exceeds maximum"));
    }

    #[tokio::test]
    async fn test_checkpoint_without_sink_reports_not_written() {
        let loaded = parse_workflow_yaml(
            "version: \"1.0\"\nname: cp\nsteps:\n  - { name: save, kind: checkpoint }\n",
        )
        .unwrap();
        let r = runner_for(&loaded, handlers());
        let result = r
            .run_step(&loaded.document.steps[0], &ctx_with(json!({})), "save", None)
            .await;
        assert_eq!(result.output, json!({"written": false}));
    }
}
