use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Executor, FromRow, Sqlite, SqlitePool, types::Json};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Artifact not found")]
    NotFound,
    #[error("Task {task_id} already has an artifact from agent '{agent_type}'")]
    Duplicate { task_id: Uuid, agent_type: String },
}

/// Immutable output of one workflow step.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Artifact {
    pub id: Uuid,
    pub task_id: Uuid,
    pub agent_type: String,
    pub step_index: i64,
    pub artifact_type: String,
    #[sqlx(json)]
    pub data: Value,
    pub immutable: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, TS)]
#[ts(export)]
pub struct CreateArtifact {
    pub task_id: Uuid,
    pub agent_type: String,
    pub step_index: i64,
    pub artifact_type: String,
    pub data: Value,
}

impl Artifact {
    /// Inserts an artifact. A second artifact for the same `(task_id,
    /// agent_type)` or the same step is reported as `Duplicate`.
    pub async fn create<'e, E>(executor: E, data: &CreateArtifact) -> Result<Self, ArtifactError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query_as::<_, Artifact>(
            r#"
            INSERT INTO artifacts (id, task_id, agent_type, step_index, artifact_type, data, immutable)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(data.task_id)
        .bind(&data.agent_type)
        .bind(data.step_index)
        .bind(&data.artifact_type)
        .bind(Json(&data.data))
        .fetch_one(executor)
        .await;

        match result {
            Ok(artifact) => Ok(artifact),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(ArtifactError::Duplicate {
                    task_id: data.task_id,
                    agent_type: data.agent_type.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, ArtifactError> {
        let artifact = sqlx::query_as::<_, Artifact>("SELECT * FROM artifacts WHERE id = ?1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(artifact)
    }

    /// All artifacts of a task in step order.
    pub async fn find_by_task_id(
        pool: &SqlitePool,
        task_id: Uuid,
    ) -> Result<Vec<Self>, ArtifactError> {
        let artifacts = sqlx::query_as::<_, Artifact>(
            "SELECT * FROM artifacts WHERE task_id = ?1 ORDER BY step_index ASC",
        )
        .bind(task_id)
        .fetch_all(pool)
        .await?;
        Ok(artifacts)
    }

    pub async fn find_latest_by_task_id(
        pool: &SqlitePool,
        task_id: Uuid,
    ) -> Result<Option<Self>, ArtifactError> {
        let artifact = sqlx::query_as::<_, Artifact>(
            "SELECT * FROM artifacts WHERE task_id = ?1 ORDER BY step_index DESC LIMIT 1",
        )
        .bind(task_id)
        .fetch_optional(pool)
        .await?;
        Ok(artifact)
    }

    pub async fn count_by_task_id(pool: &SqlitePool, task_id: Uuid) -> Result<i64, ArtifactError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM artifacts WHERE task_id = ?1")
            .bind(task_id)
            .fetch_one(pool)
            .await?;
        Ok(count)
    }
}
