//! `flowline inspect`: show the stored checkpoint for a run.

use anyhow::{Context, Result};
use console::style;
use flowline_types::checkpoint::Checkpoint;
use uuid::Uuid;

use super::Output;
use super::run::value_table;
use crate::state::AppState;

pub async fn handle_inspect(state: &AppState, run_id: Uuid, out: Output) -> Result<()> {
    let checkpoint = state
        .coordinator
        .checkpoints()
        .load(run_id)
        .await
        .with_context(|| format!("failed to load checkpoint for run {run_id}"))?;

    if out.json {
        println!("{}", serde_json::to_string_pretty(&checkpoint)?);
        return Ok(());
    }
    if out.quiet {
        return Ok(());
    }

    print_checkpoint(state, &checkpoint);
    Ok(())
}

fn print_checkpoint(state: &AppState, checkpoint: &Checkpoint) {
    println!();
    println!(
        "  {} Run {}",
        style("Checkpoint:").bold(),
        style(checkpoint.run_id).cyan()
    );
    println!("  Workflow: {}", style(&checkpoint.workflow_name).cyan());
    println!(
        "  Written: {}",
        checkpoint.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    println!(
        "  Store: {:?} ({})",
        state.config.storage.backend,
        state.data_dir.display()
    );

    let completed: Vec<&str> = checkpoint.completed_names().collect();
    if completed.is_empty() {
        println!("  Completed steps: none");
    } else {
        println!("  Completed steps: {}", completed.join(" → "));
    }

    if let Some(progress) = &checkpoint.loop_progress {
        println!(
            "  Loop '{}': {} iteration(s) done",
            style(&progress.step).cyan(),
            progress.next_iteration
        );
    }

    if !checkpoint.context.inputs.is_empty() {
        println!();
        println!("{}", value_table("Input", &checkpoint.context.inputs));
    }
    if !checkpoint.context.step_outputs.is_empty() {
        println!();
        println!("{}", value_table("Step", &checkpoint.context.step_outputs));
    }
    println!();
}
