//! `flowline validate`: load a document and list every defect found.

use std::path::Path;

use anyhow::{Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use flowline_core::workflow::{WorkflowError, load_workflow_file};

use super::Output;

pub fn handle_validate(file: &Path, out: Output) -> Result<()> {
    let issues = match load_workflow_file(file) {
        Ok(loaded) => {
            let doc = &loaded.document;
            if out.json {
                let report = serde_json::json!({
                    "valid": true,
                    "name": doc.name,
                    "version": doc.version,
                    "inputs": doc.inputs.len(),
                    "steps": doc.steps.len(),
                    "outputs": doc.outputs.len(),
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if !out.quiet {
                println!();
                println!(
                    "  {} '{}' is valid",
                    style("✓").green().bold(),
                    style(&doc.name).cyan()
                );
                println!("  Version: {}", doc.version);
                println!("  Inputs: {}", doc.inputs.len());
                println!("  Steps: {}", doc.steps.len());
                println!("  Outputs: {}", doc.outputs.len());
                println!();
            }
            return Ok(());
        }
        Err(WorkflowError::Validation(errors)) => errors.issues,
        Err(other) => bail!("failed to load workflow {}: {other}", file.display()),
    };

    if out.json {
        let report = serde_json::json!({
            "valid": false,
            "issues": issues
                .iter()
                .map(|i| serde_json::json!({ "path": i.path, "message": i.message }))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![Cell::new("Path").fg(Color::Cyan), Cell::new("Problem")]);
        for issue in &issues {
            table.add_row(vec![
                Cell::new(&issue.path),
                Cell::new(&issue.message).fg(Color::Red),
            ]);
        }
        println!();
        println!("{table}");
        println!();
    }

    bail!("{} has {} validation error(s)", file.display(), issues.len())
}
