//! flowline CLI entry point.
//!
//! Binary name: `flowline`
//!
//! Parses CLI arguments, initializes tracing, storage and capabilities, then
//! dispatches to the appropriate command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;
use flowline_observe::{TracingOptions, default_directive, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = TracingOptions {
        enable_otel: cli.otel,
        json: cli.json,
        default_directive: default_directive(cli.verbose, cli.quiet).to_string(),
    };
    if let Err(e) = init_tracing(&options) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let out = cli.output();

    match cli.command {
        // Neither needs storage or capabilities.
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(shell, &mut cmd, "flowline", &mut std::io::stdout());
            Ok(())
        }
        Commands::Validate { file } => cli::validate::handle_validate(&file, out),

        Commands::Run {
            file,
            input,
            inputs_json,
            run_id,
        } => {
            let state = AppState::init(cli.data_dir.as_deref(), cli.storage.map(Into::into)).await?;
            let inputs = cli::run::collect_inputs(input, inputs_json.as_deref())?;
            cli::run::handle_run(&state, &file, inputs, run_id, out).await
        }
        Commands::Resume { run_id, file } => {
            let state = AppState::init(cli.data_dir.as_deref(), cli.storage.map(Into::into)).await?;
            cli::run::handle_resume(&state, run_id, &file, out).await
        }
        Commands::Inspect { run_id } => {
            let state = AppState::init(cli.data_dir.as_deref(), cli.storage.map(Into::into)).await?;
            cli::inspect::handle_inspect(&state, run_id, out).await
        }
    }
}
