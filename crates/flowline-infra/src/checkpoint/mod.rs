//! Checkpoint store implementations and backend selection.

pub mod file;

use std::path::Path;

use flowline_core::repository::CheckpointStore;
use flowline_types::config::{StorageBackend, StorageConfig};
use flowline_types::error::RepositoryError;
use uuid::Uuid;

pub use file::FileCheckpointStore;

use crate::config::{checkpoint_dir, database_url};
use crate::sqlite::checkpoint::SqliteCheckpointStore;
use crate::sqlite::pool::DatabasePool;

/// The store selected by `[storage] backend`.
pub enum CheckpointBackend {
    File(FileCheckpointStore),
    Sqlite(SqliteCheckpointStore),
}

impl CheckpointBackend {
    /// Open the configured backend under `data_dir`.
    pub async fn open(storage: &StorageConfig, data_dir: &Path) -> Result<Self, RepositoryError> {
        match storage.backend {
            StorageBackend::File => {
                let dir = checkpoint_dir(storage, data_dir);
                tracing::debug!(dir = %dir.display(), "using file checkpoint store");
                Ok(Self::File(FileCheckpointStore::new(dir)))
            }
            StorageBackend::Sqlite => {
                tokio::fs::create_dir_all(data_dir)
                    .await
                    .map_err(|e| RepositoryError::Io(e.to_string()))?;
                let url = database_url(storage, data_dir);
                tracing::debug!(url = url.as_str(), "using sqlite checkpoint store");
                let pool = DatabasePool::new(&url)
                    .await
                    .map_err(|e| RepositoryError::Connection(e.to_string()))?;
                Ok(Self::Sqlite(SqliteCheckpointStore::new(pool)))
            }
        }
    }

    pub fn backend(&self) -> StorageBackend {
        match self {
            Self::File(_) => StorageBackend::File,
            Self::Sqlite(_) => StorageBackend::Sqlite,
        }
    }
}

impl CheckpointStore for CheckpointBackend {
    async fn save(&self, run_id: Uuid, workflow_name: &str, body: &str) -> Result<(), RepositoryError> {
        match self {
            Self::File(store) => store.save(run_id, workflow_name, body).await,
            Self::Sqlite(store) => store.save(run_id, workflow_name, body).await,
        }
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<String>, RepositoryError> {
        match self {
            Self::File(store) => store.load(run_id).await,
            Self::Sqlite(store) => store.load(run_id).await,
        }
    }
}
