//! `flowline run` and `flowline resume`.
//!
//! Both spawn the run on the coordinator, stream its lifecycle events while
//! waiting, and cancel it on Ctrl-C. The run keeps its checkpoint after a
//! failure or cancellation so it can be resumed.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use flowline_core::expression::stringify;
use flowline_core::workflow::{LoadedWorkflow, RunHandle, RunResult, load_workflow_file};
use flowline_types::event::RunEvent;
use flowline_types::run::RunStatus;
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::Output;
use crate::state::AppState;

/// Merge `--inputs-json` with `--input` pairs; pairs win on conflicts.
pub fn collect_inputs(
    pairs: Vec<(String, Value)>,
    inputs_json: Option<&str>,
) -> Result<BTreeMap<String, Value>> {
    let mut inputs = match inputs_json {
        Some(raw) => match serde_json::from_str::<Value>(raw).context("invalid --inputs-json")? {
            Value::Object(map) => map.into_iter().collect(),
            other => bail!(
                "--inputs-json must be a JSON object, got {}",
                flowline_core::expression::eval::type_name(&other)
            ),
        },
        None => BTreeMap::new(),
    };
    inputs.extend(pairs);
    Ok(inputs)
}

// ---------------------------------------------------------------------------
// Run / Resume
// ---------------------------------------------------------------------------

pub async fn handle_run(
    state: &AppState,
    file: &Path,
    inputs: BTreeMap<String, Value>,
    run_id: Option<Uuid>,
    out: Output,
) -> Result<()> {
    let loaded = load(file)?;
    if !out.json && !out.quiet {
        println!();
        println!(
            "  {} Running workflow '{}'",
            style("*").green().bold(),
            style(loaded.name()).cyan()
        );
    }

    let handle = state
        .coordinator
        .spawn(loaded, inputs, run_id)
        .context("failed to start run")?;
    let result = follow(handle, out).await?;
    report(&result, file, out)
}

pub async fn handle_resume(state: &AppState, run_id: Uuid, file: &Path, out: Output) -> Result<()> {
    let loaded = load(file)?;
    if !out.json && !out.quiet {
        println!();
        println!(
            "  {} Resuming run {} of '{}'",
            style("*").green().bold(),
            style(run_id).cyan(),
            style(loaded.name()).cyan()
        );
    }

    let handle = state
        .coordinator
        .spawn_resume(run_id, loaded)
        .context("failed to resume run")?;
    let result = follow(handle, out).await?;
    report(&result, file, out)
}

fn load(file: &Path) -> Result<LoadedWorkflow> {
    load_workflow_file(file).with_context(|| format!("failed to load workflow {}", file.display()))
}

/// Render events until the run task finishes; the first Ctrl-C cancels.
async fn follow(handle: RunHandle, out: Output) -> Result<RunResult> {
    let run_id = handle.run_id;
    let (mut events, cancel, wait) = handle.into_parts();
    tokio::pin!(wait);
    let mut interrupted = false;
    let mut events_open = true;

    let result = loop {
        tokio::select! {
            biased;

            event = events.recv(), if events_open => match event {
                Ok(event) if event.run_id() == run_id => render_event(&event, out)?,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(run_id = %run_id, missed, "event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => events_open = false,
            },

            result = &mut wait => {
                while let Ok(event) = events.try_recv() {
                    if event.run_id() == run_id {
                        render_event(&event, out)?;
                    }
                }
                break result;
            }

            signal = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                if signal.is_ok() {
                    if !out.json {
                        eprintln!("  {} cancelling run {run_id}...", style("!").yellow().bold());
                    }
                    cancel.cancel();
                }
            }
        }
    };

    Ok(result?)
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn render_event(event: &RunEvent, out: Output) -> Result<()> {
    if out.json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    if out.quiet {
        return Ok(());
    }

    match event {
        RunEvent::RunStarted { run_id, resumed, .. } => {
            let verb = if *resumed { "resumed" } else { "started" };
            println!("  Run {verb}: {}", style(run_id).dim());
            println!();
        }
        RunEvent::StepStarted { path, attempt, .. } => {
            if *attempt > 1 {
                println!("  {} {path} (attempt {attempt})", style("↻").yellow());
            } else {
                println!("  {} {path}", style("▸").cyan());
            }
        }
        RunEvent::StepCompleted { path, duration_ms, .. } => {
            println!(
                "  {} {path} {}",
                style("✓").green(),
                style(format!("{duration_ms}ms")).dim()
            );
        }
        RunEvent::StepFailed {
            path,
            error,
            will_retry,
            ..
        } => {
            let suffix = if *will_retry { ", retrying" } else { "" };
            println!(
                "  {} {path}: {} ({}{suffix})",
                style("✗").red(),
                error.message,
                error.kind
            );
        }
        RunEvent::StepSkipped { path, .. } => {
            println!("  {} {path} {}", style("-").dim(), style("skipped").dim());
        }
        RunEvent::CheckpointWritten { completed_steps, .. } => {
            tracing::debug!(completed_steps, "checkpoint written");
        }
        RunEvent::RunCompleted { .. } | RunEvent::RunFailed { .. } | RunEvent::RunCancelled { .. } => {}
    }
    Ok(())
}

/// Print the final result; failed and cancelled runs become errors.
fn report(result: &RunResult, file: &Path, out: Output) -> Result<()> {
    if out.json {
        println!("{}", serde_json::to_string(result)?);
    } else if !out.quiet {
        print_result(result);
    }

    match result.status {
        RunStatus::Completed => Ok(()),
        RunStatus::Cancelled => {
            if !out.json {
                eprintln!(
                    "  Resume with: {}",
                    style(format!("flowline resume {} {}", result.run_id, file.display())).dim()
                );
            }
            bail!("run {} was cancelled", result.run_id)
        }
        _ => {
            let reason = result
                .error
                .as_ref()
                .map(|e| format!("{}: {}", e.kind, e.message))
                .unwrap_or_else(|| "unknown error".to_string());
            let step = result.failed_step.as_deref().unwrap_or("?");
            bail!("run {} failed at step '{step}': {reason}", result.run_id)
        }
    }
}

fn print_result(result: &RunResult) {
    println!();
    let status = match result.status {
        RunStatus::Completed => style(result.status.to_string()).green().bold(),
        RunStatus::Cancelled => style(result.status.to_string()).yellow().bold(),
        _ => style(result.status.to_string()).red().bold(),
    };
    println!(
        "  Run {} {} in {}ms",
        style(result.run_id).dim(),
        status,
        result.duration_ms
    );
    if result.checkpoint_failures > 0 {
        println!(
            "  {} {} checkpoint write(s) failed",
            style("!").yellow().bold(),
            result.checkpoint_failures
        );
    }

    if !result.step_outputs.is_empty() {
        println!();
        println!("{}", value_table("Step", &result.step_outputs));
    }

    if let Value::Object(outputs) = &result.outputs {
        if !outputs.is_empty() {
            let outputs: BTreeMap<String, Value> =
                outputs.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            println!();
            println!("{}", value_table("Output", &outputs));
        }
    }
    println!();
}

pub(crate) fn value_table(label: &str, values: &BTreeMap<String, Value>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![Cell::new(label).fg(Color::Cyan), Cell::new("Value")]);

    for (name, value) in values {
        table.add_row(vec![Cell::new(name), Cell::new(truncate(&stringify(value), 80))]);
    }
    table
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max.saturating_sub(1)).collect();
    cut.push('…');
    cut
}
