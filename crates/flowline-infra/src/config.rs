//! Configuration loader for flowline.
//!
//! Reads `config.toml` from the data directory (`~/.flowline/` by default)
//! and deserializes it into [`FlowlineConfig`]. Falls back to defaults when
//! the file is missing or malformed.

use std::path::{Path, PathBuf};

use flowline_types::config::{FlowlineConfig, StorageConfig};

/// Environment variable that overrides the data directory.
pub const DATA_DIR_ENV: &str = "FLOWLINE_DATA_DIR";

/// Resolve the data directory.
///
/// Priority: explicit path (CLI flag), `FLOWLINE_DATA_DIR`, `~/.flowline`.
pub fn resolve_data_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match std::env::var(DATA_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::home_dir()
            .map(|home| home.join(".flowline"))
            .unwrap_or_else(|| PathBuf::from(".flowline")),
    }
}

/// Load configuration from `{data_dir}/config.toml`.
///
/// - Missing file: [`FlowlineConfig::default()`].
/// - Unreadable or unparsable file: logs a warning and returns the default.
pub async fn load_config(data_dir: &Path) -> FlowlineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return FlowlineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return FlowlineConfig::default();
        }
    };

    match toml::from_str::<FlowlineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            FlowlineConfig::default()
        }
    }
}

/// Directory for file checkpoints.
pub fn checkpoint_dir(storage: &StorageConfig, data_dir: &Path) -> PathBuf {
    storage
        .checkpoint_dir
        .clone()
        .unwrap_or_else(|| data_dir.join("checkpoints"))
}

/// SQLite URL for the checkpoint database.
pub fn database_url(storage: &StorageConfig, data_dir: &Path) -> String {
    storage
        .database_url
        .clone()
        .unwrap_or_else(|| format!("sqlite://{}?mode=rwc", data_dir.join("flowline.db").display()))
}
