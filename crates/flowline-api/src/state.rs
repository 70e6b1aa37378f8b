//! Application state wiring storage, capabilities and the coordinator.
//!
//! The coordinator is generic over its checkpoint store; `AppState` pins it
//! to the backend chosen by config or `--storage`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use flowline_core::workflow::RunCoordinator;
use flowline_infra::capability::handler_map;
use flowline_infra::checkpoint::CheckpointBackend;
use flowline_infra::config::{load_config, resolve_data_dir};
use flowline_types::config::{FlowlineConfig, StorageBackend};

pub type ConcreteCoordinator = RunCoordinator<CheckpointBackend>;

pub struct AppState {
    pub data_dir: PathBuf,
    pub config: FlowlineConfig,
    pub coordinator: Arc<ConcreteCoordinator>,
}

impl AppState {
    /// Resolve the data directory, load config, open the checkpoint store and
    /// build the capability handlers.
    pub async fn init(data_dir: Option<&Path>, storage: Option<StorageBackend>) -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir(data_dir);
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let mut config = load_config(&data_dir).await;
        if let Some(backend) = storage {
            config.storage.backend = backend;
        }

        let store = CheckpointBackend::open(&config.storage, &data_dir)
            .await
            .context("failed to open checkpoint store")?;
        let handlers =
            handler_map(&config.capabilities).context("failed to configure capabilities")?;

        tracing::debug!(
            data_dir = %data_dir.display(),
            backend = ?store.backend(),
            "application state initialized"
        );

        let coordinator = Arc::new(RunCoordinator::new(store, handlers, config.engine.clone()));
        Ok(Self {
            data_dir,
            config,
            coordinator,
        })
    }
}
