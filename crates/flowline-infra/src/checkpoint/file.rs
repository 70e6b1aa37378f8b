//! Filesystem checkpoint store.
//!
//! One JSON file per run at `{dir}/{run_id}.checkpoint.json`. Writes go to
//! a sibling temp file and are renamed into place, so a crash mid-write
//! leaves the previous checkpoint intact.

use std::path::PathBuf;

use flowline_core::repository::CheckpointStore;
use flowline_types::error::RepositoryError;
use uuid::Uuid;

const SUFFIX: &str = ".checkpoint.json";

#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{run_id}{SUFFIX}"))
    }
}

fn io_error(e: std::io::Error) -> RepositoryError {
    RepositoryError::Io(e.to_string())
}

impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, run_id: Uuid, _workflow_name: &str, body: &str) -> Result<(), RepositoryError> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(io_error)?;

        let path = self.path_for(run_id);
        let tmp = self.dir.join(format!("{run_id}{SUFFIX}.tmp"));
        tokio::fs::write(&tmp, body).await.map_err(io_error)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_error)?;

        tracing::debug!(run_id = %run_id, path = %path.display(), bytes = body.len(), "checkpoint file written");
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<String>, RepositoryError> {
        match tokio::fs::read_to_string(self.path_for(run_id)).await {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(e)),
        }
    }
}
