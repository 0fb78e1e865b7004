use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool, Type, types::Json};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ProgressEventError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS)]
#[sqlx(type_name = "progress_event_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum ProgressEventType {
    Status,
    Progress,
    Message,
    Completed,
    Failed,
}

impl ProgressEventType {
    /// `completed` and `failed` close a task's event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEventType::Completed | ProgressEventType::Failed)
    }
}

impl std::fmt::Display for ProgressEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressEventType::Status => write!(f, "status"),
            ProgressEventType::Progress => write!(f, "progress"),
            ProgressEventType::Message => write!(f, "message"),
            ProgressEventType::Completed => write!(f, "completed"),
            ProgressEventType::Failed => write!(f, "failed"),
        }
    }
}

/// Audit-log row for one event published on a task's progress channel.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ProgressEvent {
    pub id: Uuid,
    pub task_id: Uuid,
    pub seq: i64,
    pub event_type: ProgressEventType,
    #[sqlx(json)]
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateProgressEvent {
    pub task_id: Uuid,
    pub seq: i64,
    pub event_type: ProgressEventType,
    pub payload: Value,
}

impl ProgressEvent {
    pub async fn create(
        pool: &SqlitePool,
        data: &CreateProgressEvent,
    ) -> Result<Self, ProgressEventError> {
        let event = sqlx::query_as::<_, ProgressEvent>(
            r#"
            INSERT INTO progress_events (id, task_id, seq, event_type, payload)
            VALUES (?1, ?2, ?3, ?4, ?5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(data.task_id)
        .bind(data.seq)
        .bind(data.event_type)
        .bind(Json(&data.payload))
        .fetch_one(pool)
        .await?;
        Ok(event)
    }

    /// Events with `seq > after_seq`, oldest first.
    pub async fn find_after_seq(
        pool: &SqlitePool,
        task_id: Uuid,
        after_seq: i64,
    ) -> Result<Vec<Self>, ProgressEventError> {
        let events = sqlx::query_as::<_, ProgressEvent>(
            r#"
            SELECT * FROM progress_events
            WHERE task_id = ?1 AND seq > ?2
            ORDER BY seq ASC
            "#,
        )
        .bind(task_id)
        .bind(after_seq)
        .fetch_all(pool)
        .await?;
        Ok(events)
    }

    pub async fn find_last(
        pool: &SqlitePool,
        task_id: Uuid,
    ) -> Result<Option<Self>, ProgressEventError> {
        let event = sqlx::query_as::<_, ProgressEvent>(
            "SELECT * FROM progress_events WHERE task_id = ?1 ORDER BY seq DESC LIMIT 1",
        )
        .bind(task_id)
        .fetch_optional(pool)
        .await?;
        Ok(event)
    }

    pub async fn find_last_terminal(
        pool: &SqlitePool,
        task_id: Uuid,
    ) -> Result<Option<Self>, ProgressEventError> {
        let event = sqlx::query_as::<_, ProgressEvent>(
            r#"
            SELECT * FROM progress_events
            WHERE task_id = ?1 AND event_type IN ('completed', 'failed')
            ORDER BY seq DESC
            LIMIT 1
            "#,
        )
        .bind(task_id)
        .fetch_optional(pool)
        .await?;
        Ok(event)
    }
}
