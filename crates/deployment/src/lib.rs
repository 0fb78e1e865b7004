use std::sync::Arc;

use anyhow::Error as AnyhowError;
use async_trait::async_trait;
use db::DBService;
use services::services::{
    agent_registry::{AgentRegistry, RegistryError},
    config::{Config, ConfigError},
    progress::ProgressBroadcaster,
    task_manager::{RecoveryReport, TaskManager, TaskManagerError},
    workflows::{WorkflowCatalog, WorkflowError},
};
use sqlx::Error as SqlxError;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sqlx(#[from] SqlxError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error(transparent)]
    TaskManager(#[from] TaskManagerError),
    #[error(transparent)]
    Other(#[from] AnyhowError),
}

#[async_trait]
pub trait Deployment: Clone + Send + Sync + 'static {
    async fn new() -> Result<Self, DeploymentError>;

    fn config(&self) -> &Arc<RwLock<Config>>;

    fn db(&self) -> &DBService;

    fn task_manager(&self) -> &TaskManager;

    fn registry(&self) -> &Arc<AgentRegistry> {
        self.task_manager().registry()
    }

    fn workflows(&self) -> &Arc<WorkflowCatalog> {
        self.task_manager().workflows()
    }

    fn progress(&self) -> &Arc<ProgressBroadcaster> {
        self.task_manager().progress()
    }

    /// Deals with tasks a previous process left unfinished. Call at startup.
    async fn recover_incomplete_tasks(&self) -> Result<RecoveryReport, DeploymentError> {
        let report = self.task_manager().recover_incomplete_tasks().await?;
        Ok(report)
    }
}
