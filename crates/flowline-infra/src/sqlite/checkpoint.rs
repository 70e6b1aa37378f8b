//! SQLite checkpoint store.
//!
//! One row per run in `checkpoints`; saves upsert on `run_id`.

use chrono::Utc;
use flowline_core::repository::CheckpointStore;
use flowline_types::error::RepositoryError;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

#[derive(Debug, Clone)]
pub struct SqliteCheckpointStore {
    pool: DatabasePool,
}

impl SqliteCheckpointStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, run_id: Uuid, workflow_name: &str, body: &str) -> Result<(), RepositoryError> {
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"INSERT INTO checkpoints (run_id, workflow_name, body, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(run_id) DO UPDATE SET
                 workflow_name = excluded.workflow_name,
                 body = excluded.body,
                 updated_at = excluded.updated_at"#,
        )
        .bind(run_id.to_string())
        .bind(workflow_name)
        .bind(body)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        tracing::debug!(run_id = %run_id, workflow = workflow_name, "checkpoint row written");
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<String>, RepositoryError> {
        let row = sqlx::query("SELECT body FROM checkpoints WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        row.map(|row| row.try_get::<String, _>("body"))
            .transpose()
            .map_err(|e| RepositoryError::Query(e.to_string()))
    }
}
