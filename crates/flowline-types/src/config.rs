//! Configuration types for flowline.
//!
//! `FlowlineConfig` represents the `config.toml` in the data directory.
//! Every field has a default so an empty or missing file is valid.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowlineConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub capabilities: CapabilityConfig,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Tuning for the run coordinator and step executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Save a checkpoint after every N completed top-level steps; 0 disables
    /// interval checkpoints (explicit checkpoint steps still write).
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u32,

    /// Per-attempt timeout for steps that do not declare one.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,

    /// Concurrency bound for parallel loops without `max_concurrency`.
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: u32,

    /// Lifecycle event channel capacity.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    #[serde(default = "default_max_subworkflow_depth")]
    pub max_subworkflow_depth: u32,
}

fn default_checkpoint_interval() -> u32 {
    1
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_max_parallelism() -> u32 {
    4
}

fn default_event_capacity() -> usize {
    1024
}

fn default_max_subworkflow_depth() -> u32 {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: default_checkpoint_interval(),
            default_step_timeout_secs: default_step_timeout_secs(),
            max_parallelism: default_max_parallelism(),
            event_capacity: default_event_capacity(),
            max_subworkflow_depth: default_max_subworkflow_depth(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Where checkpoints are persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    File,
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Directory for file checkpoints (default `{data_dir}/checkpoints`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_dir: Option<PathBuf>,
    /// SQLite URL (default `sqlite://{data_dir}/flowline.db`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Remote endpoints for agent and callable steps. When unset, only the
/// builtin callables are available.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callable_endpoint: Option<String>,
    /// Request timeout for remote capabilities.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            agent_endpoint: None,
            callable_endpoint: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}
