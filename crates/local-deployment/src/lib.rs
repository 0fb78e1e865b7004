use std::sync::Arc;

use async_trait::async_trait;
use db::DBService;
use deployment::{Deployment, DeploymentError};
use services::services::{
    agent_registry::AgentRegistry,
    bookmark_sink::{BookmarkSink, SqliteBookmarkSink},
    config::{Config, load_config_from_file, save_config_to_file},
    progress::ProgressBroadcaster,
    task_manager::{TaskManager, TaskManagerSettings},
    workflows::WorkflowCatalog,
};
use tokio::sync::RwLock;
use utils::assets::{config_path, ensure_asset_dir};

#[derive(Clone)]
pub struct LocalDeployment {
    config: Arc<RwLock<Config>>,
    db: DBService,
    task_manager: TaskManager,
}

impl LocalDeployment {
    /// Wires the engine on top of an already opened database.
    pub fn from_parts(db: DBService, config: Config) -> Result<Self, DeploymentError> {
        let registry = Arc::new(AgentRegistry::from_config(&config.agents)?);

        let workflows = WorkflowCatalog::with_config(&config.workflows)?;
        workflows.verify_against(&registry)?;
        tracing::info!(
            "{} workflows available: {}",
            workflows.list().len(),
            workflows
                .list()
                .iter()
                .map(|w| w.workflow_type.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let progress = Arc::new(ProgressBroadcaster::new(
            db.pool.clone(),
            config.engine.broadcast_capacity,
            config.engine.replay_buffer_size,
        ));

        let sink: Option<Arc<dyn BookmarkSink>> = if config.engine.handoff_enabled {
            Some(Arc::new(SqliteBookmarkSink::new(db.clone())))
        } else {
            tracing::info!("Bookmark handoff disabled, tasks complete after the last agent");
            None
        };

        let task_manager = TaskManager::new(
            db.clone(),
            registry,
            Arc::new(workflows),
            progress,
            sink,
            TaskManagerSettings::from(&config.engine),
        );

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            db,
            task_manager,
        })
    }
}

#[async_trait]
impl Deployment for LocalDeployment {
    async fn new() -> Result<Self, DeploymentError> {
        ensure_asset_dir()?;

        let mut raw_config = load_config_from_file(&config_path()).await;
        raw_config.apply_env_overrides()?;

        // Always save config so new defaults land on disk
        save_config_to_file(&raw_config, &config_path()).await?;

        let db = DBService::new().await?;
        Self::from_parts(db, raw_config)
    }

    fn config(&self) -> &Arc<RwLock<Config>> {
        &self.config
    }

    fn db(&self) -> &DBService {
        &self.db
    }

    fn task_manager(&self) -> &TaskManager {
        &self.task_manager
    }
}
