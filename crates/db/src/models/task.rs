use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Executor, FromRow, Sqlite, SqlitePool, Type, types::Json};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Task not found")]
    NotFound,
    #[error("Invalid task state transition: {0}")]
    InvalidTransition(String),
}

#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
#[sqlx(type_name = "task_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(TaskError::InvalidTransition(format!(
                "unknown task status '{other}'"
            ))),
        }
    }
}

/// Classification of a task failure.
#[derive(Debug, Clone, Copy, Type, Serialize, Deserialize, PartialEq, Eq, TS)]
#[sqlx(type_name = "task_error_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum TaskErrorKind {
    SchemaViolation,
    AgentProcessingError,
    DuplicateArtifact,
    ProcessRestart,
    HandoffError,
}

impl std::fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskErrorKind::SchemaViolation => write!(f, "schema_violation"),
            TaskErrorKind::AgentProcessingError => write!(f, "agent_processing_error"),
            TaskErrorKind::DuplicateArtifact => write!(f, "duplicate_artifact"),
            TaskErrorKind::ProcessRestart => write!(f, "process_restart"),
            TaskErrorKind::HandoffError => write!(f, "handoff_error"),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Task {
    pub id: Uuid,
    pub workflow_type: String,
    /// Ordered agent type names, fixed when the task is created.
    #[sqlx(json)]
    pub workflow_agents: Vec<String>,
    pub status: TaskStatus,
    pub current_agent: Option<String>,
    pub current_step_index: i64,
    pub total_steps: i64,
    pub progress_percent: i64,
    #[sqlx(json)]
    pub context: Value,
    pub error_kind: Option<TaskErrorKind>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, TS)]
#[ts(export)]
pub struct CreateTask {
    pub workflow_type: String,
    pub workflow_agents: Vec<String>,
    pub context: Value,
}

impl Task {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Agent name at `step`, if the workflow has that many steps.
    pub fn agent_at(&self, step: i64) -> Option<&str> {
        usize::try_from(step)
            .ok()
            .and_then(|i| self.workflow_agents.get(i))
            .map(String::as_str)
    }

    pub async fn create(pool: &SqlitePool, data: &CreateTask) -> Result<Self, TaskError> {
        if data.workflow_agents.is_empty() {
            return Err(TaskError::InvalidTransition(
                "a task needs at least one workflow step".to_string(),
            ));
        }

        let task = sqlx::query_as::<_, Task>(
            r#"
            INSERT INTO tasks (id, workflow_type, workflow_agents, status, current_step_index,
                               total_steps, progress_percent, context)
            VALUES (?1, ?2, ?3, 'pending', 0, ?4, 0, ?5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&data.workflow_type)
        .bind(Json(&data.workflow_agents))
        .bind(data.workflow_agents.len() as i64)
        .bind(Json(&data.context))
        .fetch_one(pool)
        .await?;

        Ok(task)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, TaskError> {
        let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?1")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(task)
    }

    pub async fn find_by_status(
        pool: &SqlitePool,
        status: TaskStatus,
    ) -> Result<Vec<Self>, TaskError> {
        let tasks = sqlx::query_as::<_, Task>(
            "SELECT * FROM tasks WHERE status = ?1 ORDER BY created_at ASC",
        )
        .bind(status)
        .fetch_all(pool)
        .await?;
        Ok(tasks)
    }

    pub async fn find_recent(
        pool: &SqlitePool,
        status: Option<TaskStatus>,
        limit: i64,
    ) -> Result<Vec<Self>, TaskError> {
        let tasks = sqlx::query_as::<_, Task>(
            r#"
            SELECT * FROM tasks
            WHERE ?1 IS NULL OR status = ?1
            ORDER BY created_at DESC
            LIMIT ?2
            "#,
        )
        .bind(status)
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(tasks)
    }

    /// `pending -> running`. Returns `None` when the task is not pending.
    pub async fn mark_running(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, TaskError> {
        let task = sqlx::query_as::<_, Task>(
            r#"
            UPDATE tasks
            SET status = 'running',
                started_at = datetime('now', 'subsec'),
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(task)
    }

    /// Records which agent is executing `step`. Guarded on the task still
    /// being at that step.
    pub async fn set_current_agent(
        pool: &SqlitePool,
        id: Uuid,
        step: i64,
        agent: &str,
    ) -> Result<Option<Self>, TaskError> {
        let task = sqlx::query_as::<_, Task>(
            r#"
            UPDATE tasks
            SET current_agent = ?3,
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status = 'running' AND current_step_index = ?2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(step)
        .bind(agent)
        .fetch_optional(pool)
        .await?;
        Ok(task)
    }

    /// Moves a running task from `step` to `step + 1` and recomputes the
    /// progress percentage. `None` means another writer moved the task first.
    pub async fn advance_step<'e, E>(
        executor: E,
        id: Uuid,
        step: i64,
        next_agent: Option<&str>,
    ) -> Result<Option<Self>, TaskError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let task = sqlx::query_as::<_, Task>(
            r#"
            UPDATE tasks
            SET current_step_index = ?2 + 1,
                progress_percent = ((?2 + 1) * 100) / total_steps,
                current_agent = COALESCE(?3, current_agent),
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1
              AND status = 'running'
              AND current_step_index = ?2
              AND ?2 < total_steps
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(step)
        .bind(next_agent)
        .fetch_optional(executor)
        .await?;
        Ok(task)
    }

    /// `running -> completed`, only once every step has been committed.
    pub async fn mark_completed(pool: &SqlitePool, id: Uuid) -> Result<Option<Self>, TaskError> {
        let task = sqlx::query_as::<_, Task>(
            r#"
            UPDATE tasks
            SET status = 'completed',
                progress_percent = 100,
                completed_at = datetime('now', 'subsec'),
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status = 'running' AND current_step_index = total_steps
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;
        Ok(task)
    }

    /// `pending|running -> failed`. Terminal tasks are left untouched.
    pub async fn mark_failed(
        pool: &SqlitePool,
        id: Uuid,
        kind: TaskErrorKind,
        message: &str,
    ) -> Result<Option<Self>, TaskError> {
        if message.trim().is_empty() {
            return Err(TaskError::InvalidTransition(
                "a failed task requires an error message".to_string(),
            ));
        }

        let task = sqlx::query_as::<_, Task>(
            r#"
            UPDATE tasks
            SET status = 'failed',
                error_kind = ?2,
                error_message = ?3,
                completed_at = datetime('now', 'subsec'),
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status IN ('pending', 'running')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(kind)
        .bind(message)
        .fetch_optional(pool)
        .await?;
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_utils::{insert_task, setup_test_pool};

    #[tokio::test]
    async fn create_starts_pending_at_step_zero() {
        let pool = setup_test_pool().await;
        let task = insert_task(&pool, &["import", "validation"]).await;

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.current_step_index, 0);
        assert_eq!(task.total_steps, 2);
        assert_eq!(task.progress_percent, 0);
        assert_eq!(task.workflow_agents, vec!["import", "validation"]);
        assert_eq!(task.context["file_content"], "<DL></DL>");
        assert!(task.started_at.is_none());
    }

    #[tokio::test]
    async fn create_rejects_empty_workflow() {
        let pool = setup_test_pool().await;
        let result = Task::create(
            &pool,
            &CreateTask {
                workflow_type: "empty".to_string(),
                workflow_agents: vec![],
                context: serde_json::json!({}),
            },
        )
        .await;
        assert!(matches!(result, Err(TaskError::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn mark_running_only_from_pending() {
        let pool = setup_test_pool().await;
        let task = insert_task(&pool, &["import"]).await;

        let running = Task::mark_running(&pool, task.id)
            .await
            .expect("query")
            .expect("pending task should start");
        assert_eq!(running.status, TaskStatus::Running);
        assert!(running.started_at.is_some());

        let again = Task::mark_running(&pool, task.id).await.expect("query");
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn advance_step_is_guarded_on_expected_index() {
        let pool = setup_test_pool().await;
        let task = insert_task(&pool, &["import", "validation", "enrichment"]).await;
        Task::mark_running(&pool, task.id).await.expect("query");

        let advanced = Task::advance_step(&pool, task.id, 0, Some("validation"))
            .await
            .expect("query")
            .expect("step 0 should advance");
        assert_eq!(advanced.current_step_index, 1);
        assert_eq!(advanced.progress_percent, 33);
        assert_eq!(advanced.current_agent.as_deref(), Some("validation"));

        // A second writer still believing the task is at step 0 loses.
        let stale = Task::advance_step(&pool, task.id, 0, Some("validation"))
            .await
            .expect("query");
        assert!(stale.is_none());
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_completion_requires_all_steps() {
        let pool = setup_test_pool().await;
        let task = insert_task(&pool, &["import", "validation"]).await;
        Task::mark_running(&pool, task.id).await.expect("query");

        let early = Task::mark_completed(&pool, task.id).await.expect("query");
        assert!(early.is_none(), "cannot complete before the last step");

        let mut last_percent = 0;
        for step in 0..2 {
            let t = Task::advance_step(&pool, task.id, step, None)
                .await
                .expect("query")
                .expect("advance");
            assert!(t.progress_percent >= last_percent);
            last_percent = t.progress_percent;
        }
        assert_eq!(last_percent, 100);

        let overflow = Task::advance_step(&pool, task.id, 2, None).await.expect("query");
        assert!(overflow.is_none());

        let done = Task::mark_completed(&pool, task.id)
            .await
            .expect("query")
            .expect("complete");
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn terminal_tasks_are_immutable() {
        let pool = setup_test_pool().await;
        let task = insert_task(&pool, &["import"]).await;
        Task::mark_running(&pool, task.id).await.expect("query");

        let failed = Task::mark_failed(
            &pool,
            task.id,
            TaskErrorKind::AgentProcessingError,
            "parser exploded",
        )
        .await
        .expect("query")
        .expect("fail");
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error_kind, Some(TaskErrorKind::AgentProcessingError));

        assert!(
            Task::mark_failed(&pool, task.id, TaskErrorKind::ProcessRestart, "again")
                .await
                .expect("query")
                .is_none()
        );
        assert!(Task::mark_running(&pool, task.id).await.expect("query").is_none());
        assert!(
            Task::advance_step(&pool, task.id, 0, None)
                .await
                .expect("query")
                .is_none()
        );

        let reloaded = Task::find_by_id(&pool, task.id)
            .await
            .expect("query")
            .expect("exists");
        assert_eq!(reloaded.error_message.as_deref(), Some("parser exploded"));
    }

    #[tokio::test]
    async fn mark_failed_requires_message() {
        let pool = setup_test_pool().await;
        let task = insert_task(&pool, &["import"]).await;
        let result = Task::mark_failed(&pool, task.id, TaskErrorKind::SchemaViolation, "  ").await;
        assert!(matches!(result, Err(TaskError::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn find_by_status_and_recent() {
        let pool = setup_test_pool().await;
        let a = insert_task(&pool, &["import"]).await;
        let _b = insert_task(&pool, &["import"]).await;
        Task::mark_running(&pool, a.id).await.expect("query");

        let running = Task::find_by_status(&pool, TaskStatus::Running)
            .await
            .expect("query");
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, a.id);

        let all = Task::find_recent(&pool, None, 10).await.expect("query");
        assert_eq!(all.len(), 2);
        let pending = Task::find_recent(&pool, Some(TaskStatus::Pending), 10)
            .await
            .expect("query");
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn agent_at_indexes_workflow() {
        let task = Task {
            id: Uuid::new_v4(),
            workflow_type: "w".into(),
            workflow_agents: vec!["import".into(), "validation".into()],
            status: TaskStatus::Pending,
            current_agent: None,
            current_step_index: 0,
            total_steps: 2,
            progress_percent: 0,
            context: serde_json::json!({}),
            error_kind: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            updated_at: Utc::now(),
        };
        assert_eq!(task.agent_at(1), Some("validation"));
        assert_eq!(task.agent_at(2), None);
        assert_eq!(task.agent_at(-1), None);
    }
}
