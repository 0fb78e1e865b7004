use db::{
    DBService,
    models::{
        artifact::{Artifact, ArtifactError, CreateArtifact},
        task::{Task, TaskError},
    },
};
use thiserror::Error;
use uuid::Uuid;

use crate::services::agents::ArtifactDraft;

#[derive(Debug, Error)]
pub enum ArtifactStoreError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Task {0} was moved by another writer")]
    StaleTask(Uuid),
}

impl ArtifactStoreError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, ArtifactStoreError::Artifact(ArtifactError::Duplicate { .. }))
    }
}

/// Result of committing one workflow step.
#[derive(Debug, Clone)]
pub struct CommittedStep {
    pub task: Task,
    pub artifact: Artifact,
}

/// Append-only storage for agent outputs. Artifacts are never updated or
/// deleted once written.
#[derive(Clone)]
pub struct ArtifactStore {
    db: DBService,
}

impl ArtifactStore {
    pub fn new(db: DBService) -> Self {
        Self { db }
    }

    pub async fn save(&self, data: &CreateArtifact) -> Result<Artifact, ArtifactStoreError> {
        Ok(Artifact::create(&self.db.pool, data).await?)
    }

    /// Artifacts of a task ordered by step.
    pub async fn list_by_task(&self, task_id: Uuid) -> Result<Vec<Artifact>, ArtifactStoreError> {
        Ok(Artifact::find_by_task_id(&self.db.pool, task_id).await?)
    }

    pub async fn get_latest(&self, task_id: Uuid) -> Result<Option<Artifact>, ArtifactStoreError> {
        Ok(Artifact::find_latest_by_task_id(&self.db.pool, task_id).await?)
    }

    pub async fn count(&self, task_id: Uuid) -> Result<i64, ArtifactStoreError> {
        Ok(Artifact::count_by_task_id(&self.db.pool, task_id).await?)
    }

    /// Advances `task` past its current step and stores that step's artifact
    /// in one transaction. Either both are written or neither is.
    pub async fn commit_step(
        &self,
        task: &Task,
        agent_type: &str,
        draft: ArtifactDraft,
    ) -> Result<CommittedStep, ArtifactStoreError> {
        let step = task.current_step_index;
        let next_agent = task.agent_at(step + 1).map(str::to_string);

        let mut tx = self.db.pool.begin().await?;

        let Some(advanced) =
            Task::advance_step(&mut *tx, task.id, step, next_agent.as_deref()).await?
        else {
            tx.rollback().await?;
            return Err(ArtifactStoreError::StaleTask(task.id));
        };

        let artifact = match Artifact::create(
            &mut *tx,
            &CreateArtifact {
                task_id: task.id,
                agent_type: agent_type.to_string(),
                step_index: step,
                artifact_type: draft.artifact_type,
                data: draft.data,
            },
        )
        .await
        {
            Ok(artifact) => artifact,
            Err(e) => {
                tx.rollback().await?;
                return Err(e.into());
            }
        };

        tx.commit().await?;

        Ok(CommittedStep {
            task: advanced,
            artifact,
        })
    }
}
