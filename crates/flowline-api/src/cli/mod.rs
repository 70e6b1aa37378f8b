//! CLI command definitions for the `flowline` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod inspect;
pub mod run;
pub mod validate;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use flowline_types::config::StorageBackend;
use serde_json::Value;
use uuid::Uuid;

/// Run, resume and inspect declarative workflows.
#[derive(Parser)]
#[command(name = "flowline", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, short, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Data directory for config and checkpoints.
    #[arg(long, global = true, env = "FLOWLINE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Checkpoint storage backend, overriding config.toml.
    #[arg(long, global = true, value_enum, env = "FLOWLINE_STORAGE")]
    pub storage: Option<StorageArg>,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn output(&self) -> Output {
        Output {
            json: self.json,
            quiet: self.quiet,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a workflow file from the beginning.
    Run {
        /// Path to the workflow YAML file.
        file: PathBuf,

        /// Run input as key=value (value parsed as JSON, else taken as a string).
        #[arg(long = "input", short = 'i', value_parser = parse_input_pair)]
        input: Vec<(String, Value)>,

        /// Run inputs as a JSON object; `--input` entries override its keys.
        #[arg(long)]
        inputs_json: Option<String>,

        /// Use this run id instead of a generated one.
        #[arg(long)]
        run_id: Option<Uuid>,
    },

    /// Resume an interrupted run from its last checkpoint.
    Resume {
        /// Run UUID.
        run_id: Uuid,

        /// Path to the (unchanged) workflow YAML file.
        file: PathBuf,
    },

    /// Validate a workflow file and list every issue.
    Validate {
        /// Path to the workflow YAML file.
        file: PathBuf,
    },

    /// Show the stored checkpoint for a run.
    Inspect {
        /// Run UUID.
        run_id: Uuid,
    },

    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageArg {
    File,
    Sqlite,
}

impl From<StorageArg> for StorageBackend {
    fn from(arg: StorageArg) -> Self {
        match arg {
            StorageArg::File => StorageBackend::File,
            StorageArg::Sqlite => StorageBackend::Sqlite,
        }
    }
}

/// How command handlers print.
#[derive(Debug, Clone, Copy, Default)]
pub struct Output {
    pub json: bool,
    pub quiet: bool,
}

/// Parse `key=value`. The value is JSON if it parses as JSON, otherwise the
/// raw text as a string.
pub fn parse_input_pair(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing input name in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}
