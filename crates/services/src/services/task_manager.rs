//! Task Manager
//!
//! Owns the task state machine. A task runs its workflow's agents strictly
//! in order. Each successful step commits exactly one artifact together
//! with the step advance, and the first failure ends the task.

use std::{any::Any, panic::AssertUnwindSafe, str::FromStr, sync::Arc, time::Duration};

use db::{
    DBService,
    models::{
        artifact::Artifact,
        task::{CreateTask, Task, TaskError, TaskErrorKind, TaskStatus},
    },
};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::{sync::Semaphore, task::JoinHandle};
use ts_rs::TS;
use uuid::Uuid;

use crate::services::{
    agent_registry::AgentRegistry,
    agents::{Agent, AgentInput, AgentType, ArtifactDraft, schema::violations},
    artifacts::{ArtifactStore, ArtifactStoreError, CommittedStep},
    bookmark_sink::BookmarkSink,
    config::{EngineConfig, RecoveryPolicy},
    progress::{ProgressBroadcaster, ProgressError, ProgressReporter},
    workflows::WorkflowCatalog,
};

#[derive(Debug, Error)]
pub enum TaskManagerError {
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),
    #[error("Task {0} not found")]
    TaskNotFound(Uuid),
    #[error("Task {0} is being driven by another runner")]
    Conflict(Uuid),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    ArtifactStore(#[from] ArtifactStoreError),
    #[error(transparent)]
    Progress(#[from] ProgressError),
}

#[derive(Debug, Clone)]
pub struct TaskManagerSettings {
    pub recovery_policy: RecoveryPolicy,
    pub max_concurrent_tasks: usize,
    pub step_timeout: Option<Duration>,
}

impl From<&EngineConfig> for TaskManagerSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            recovery_policy: config.recovery_policy,
            max_concurrent_tasks: config.max_concurrent_tasks.max(1),
            step_timeout: config.step_timeout_secs.map(Duration::from_secs),
        }
    }
}

impl Default for TaskManagerSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

/// What `recover_incomplete_tasks` did at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct RecoveryReport {
    pub resumed: Vec<Uuid>,
    pub failed: Vec<Uuid>,
    pub requeued: Vec<Uuid>,
}

enum StepOutcome {
    Advanced(Task),
    Failed { kind: TaskErrorKind, message: String },
}

impl StepOutcome {
    fn failed(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        StepOutcome::Failed {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Clone)]
pub struct TaskManager {
    db: DBService,
    registry: Arc<AgentRegistry>,
    workflows: Arc<WorkflowCatalog>,
    artifacts: ArtifactStore,
    progress: Arc<ProgressBroadcaster>,
    sink: Option<Arc<dyn BookmarkSink>>,
    settings: TaskManagerSettings,
    permits: Arc<Semaphore>,
}

impl TaskManager {
    pub fn new(
        db: DBService,
        registry: Arc<AgentRegistry>,
        workflows: Arc<WorkflowCatalog>,
        progress: Arc<ProgressBroadcaster>,
        sink: Option<Arc<dyn BookmarkSink>>,
        settings: TaskManagerSettings,
    ) -> Self {
        Self {
            artifacts: ArtifactStore::new(db.clone()),
            permits: Arc::new(Semaphore::new(settings.max_concurrent_tasks.max(1))),
            db,
            registry,
            workflows,
            progress,
            sink,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn workflows(&self) -> &Arc<WorkflowCatalog> {
        &self.workflows
    }

    pub fn progress(&self) -> &Arc<ProgressBroadcaster> {
        &self.progress
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Persists a pending task. Nothing is written for an unknown workflow.
    pub async fn create_task(
        &self,
        workflow_type: &str,
        context: Value,
    ) -> Result<Task, TaskManagerError> {
        let definition = self
            .workflows
            .resolve(workflow_type)
            .map_err(|e| TaskManagerError::InvalidWorkflow(e.to_string()))?;

        let task = Task::create(
            &self.db.pool,
            &CreateTask {
                workflow_type: definition.workflow_type.clone(),
                workflow_agents: definition.agent_names(),
                context,
            },
        )
        .await?;

        tracing::info!(
            "[TASK_MANAGER] Created task {} ({}, {} steps)",
            task.id,
            task.workflow_type,
            task.total_steps
        );
        self.emit_status(&task, "Task created").await;
        Ok(task)
    }

    /// Creates a task and starts it in the background.
    pub async fn submit(
        &self,
        workflow_type: &str,
        context: Value,
    ) -> Result<Task, TaskManagerError> {
        let task = self.create_task(workflow_type, context).await?;
        self.spawn_task(task.id);
        Ok(task)
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<Task, TaskManagerError> {
        Task::find_by_id(&self.db.pool, task_id)
            .await?
            .ok_or(TaskManagerError::TaskNotFound(task_id))
    }

    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: i64,
    ) -> Result<Vec<Task>, TaskManagerError> {
        Ok(Task::find_recent(&self.db.pool, status, limit.clamp(1, 500)).await?)
    }

    pub async fn list_artifacts(&self, task_id: Uuid) -> Result<Vec<Artifact>, TaskManagerError> {
        self.get_task(task_id).await?;
        Ok(self.artifacts.list_by_task(task_id).await?)
    }

    pub async fn latest_artifact(
        &self,
        task_id: Uuid,
    ) -> Result<Option<Artifact>, TaskManagerError> {
        self.get_task(task_id).await?;
        Ok(self.artifacts.get_latest(task_id).await?)
    }

    /// Drives a pending task to a terminal state. Terminal tasks and tasks
    /// already claimed by another runner are returned unchanged.
    pub async fn run_task(&self, task_id: Uuid) -> Result<Task, TaskManagerError> {
        let task = self.get_task(task_id).await?;
        if task.status != TaskStatus::Pending {
            tracing::debug!(
                "[TASK_MANAGER] Task {} is {}, nothing to run",
                task_id,
                task.status
            );
            return Ok(task);
        }

        let Some(task) = Task::mark_running(&self.db.pool, task_id).await? else {
            // Lost the race to another runner.
            return self.get_task(task_id).await;
        };
        tracing::info!("[TASK_MANAGER] Starting task {} ({})", task.id, task.workflow_type);
        self.emit_status(&task, "Task started").await;

        // A claimed task finishes even if the caller stops waiting.
        let manager = self.clone();
        match tokio::spawn(async move { manager.drive(task).await }).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("[TASK_MANAGER] Driver for task {} aborted: {}", task_id, e);
                self.get_task(task_id).await
            }
        }
    }

    /// Runs `run_task` on the runtime, bounded by `max_concurrent_tasks`.
    pub fn spawn_task(&self, task_id: Uuid) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = manager.permits.clone().acquire_owned().await else {
                return;
            };
            if let Err(e) = manager.run_task(task_id).await {
                tracing::error!("[TASK_MANAGER] Task {} did not finish: {}", task_id, e);
            }
        })
    }

    fn spawn_resume(&self, task: Task) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = manager.permits.clone().acquire_owned().await else {
                return;
            };
            let task_id = task.id;
            manager
                .emit_status(&task, "Task resumed after restart")
                .await;
            if let Err(e) = manager.drive(task).await {
                tracing::error!("[RECOVERY] Task {} did not finish: {}", task_id, e);
            }
        })
    }

    /// Handles tasks left behind by a previous process. `running` tasks are
    /// resumed or failed per the recovery policy; `pending` tasks are
    /// started again.
    pub async fn recover_incomplete_tasks(&self) -> Result<RecoveryReport, TaskManagerError> {
        let mut report = RecoveryReport::default();

        for task in Task::find_by_status(&self.db.pool, TaskStatus::Running).await? {
            match self.settings.recovery_policy {
                RecoveryPolicy::Resume => {
                    tracing::info!(
                        "[RECOVERY] Resuming task {} at step {}/{}",
                        task.id,
                        task.current_step_index,
                        task.total_steps
                    );
                    report.resumed.push(task.id);
                    self.spawn_resume(task);
                }
                RecoveryPolicy::Fail => {
                    tracing::warn!("[RECOVERY] Failing interrupted task {}", task.id);
                    report.failed.push(task.id);
                    self.fail(
                        &task,
                        TaskErrorKind::ProcessRestart,
                        "Process restarted while the task was running",
                    )
                    .await?;
                }
            }
        }

        for task in Task::find_by_status(&self.db.pool, TaskStatus::Pending).await? {
            report.requeued.push(task.id);
            self.spawn_task(task.id);
        }

        if !(report.resumed.is_empty() && report.failed.is_empty() && report.requeued.is_empty()) {
            tracing::info!(
                "[RECOVERY] {} resumed, {} failed, {} requeued",
                report.resumed.len(),
                report.failed.len(),
                report.requeued.len()
            );
        }
        Ok(report)
    }

    /// Runs the remaining steps of a claimed task. Any error other than a
    /// lost race is recorded on the task before it is returned.
    async fn drive(&self, task: Task) -> Result<Task, TaskManagerError> {
        let claimed = task.clone();
        match self.drive_steps(task).await {
            Err(TaskManagerError::Conflict(id)) => Err(TaskManagerError::Conflict(id)),
            Err(e) => {
                tracing::error!("[TASK_MANAGER] Task {} hit an internal error: {}", claimed.id, e);
                self.fail(&claimed, TaskErrorKind::AgentProcessingError, &e.to_string())
                    .await
            }
            Ok(task) => Ok(task),
        }
    }

    async fn drive_steps(&self, mut task: Task) -> Result<Task, TaskManagerError> {
        while task.current_step_index < task.total_steps {
            match self.run_step(&task).await? {
                StepOutcome::Advanced(next) => task = next,
                StepOutcome::Failed { kind, message } => {
                    return self.fail(&task, kind, &message).await;
                }
            }
        }
        self.finish(task).await
    }

    async fn run_step(&self, task: &Task) -> Result<StepOutcome, TaskManagerError> {
        let step = task.current_step_index;
        let Some(agent_name) = task.agent_at(step).map(str::to_string) else {
            return Ok(StepOutcome::failed(
                TaskErrorKind::AgentProcessingError,
                format!("Workflow has no agent for step {step}"),
            ));
        };

        let Some(task) =
            Task::set_current_agent(&self.db.pool, task.id, step, &agent_name).await?
        else {
            return Err(TaskManagerError::Conflict(task.id));
        };
        self.emit_status(
            &task,
            format!("Running {} ({}/{})", agent_name, step + 1, task.total_steps),
        )
        .await;

        let Some((agent_type, agent)) = AgentType::from_str(&agent_name)
            .ok()
            .and_then(|t| self.registry.get(t).map(|a| (t, a)))
        else {
            return Ok(StepOutcome::failed(
                TaskErrorKind::AgentProcessingError,
                format!("No agent registered for '{agent_name}'"),
            ));
        };

        let payload = if step == 0 {
            task.context.clone()
        } else {
            match self.artifacts.get_latest(task.id).await? {
                Some(previous) if previous.step_index == step - 1 => previous.data,
                _ => {
                    return Ok(StepOutcome::failed(
                        TaskErrorKind::AgentProcessingError,
                        format!("Missing artifact from step {}", step - 1),
                    ));
                }
            }
        };

        if let Err(e) = agent.validate(&payload) {
            return Ok(StepOutcome::failed(e.kind(), format!("{agent_name}: {e}")));
        }

        let reporter = ProgressReporter::new(self.progress.clone(), task.id, &agent_name, step);
        let input = AgentInput {
            task_id: task.id,
            context: task.context.clone(),
            payload,
        };
        let draft = match self.invoke(agent.as_ref(), &agent_name, input, &reporter).await {
            Ok(draft) => draft,
            Err(message) => {
                return Ok(StepOutcome::failed(
                    TaskErrorKind::AgentProcessingError,
                    message,
                ));
            }
        };

        if let Some(capability) = self.registry.capability(agent_type) {
            let problems = violations(&capability.output_schema, &draft.data);
            if !problems.is_empty() {
                return Ok(StepOutcome::failed(
                    TaskErrorKind::AgentProcessingError,
                    format!(
                        "{agent_name} output does not match its declared schema: {}",
                        problems.join("; ")
                    ),
                ));
            }
        }

        match self.artifacts.commit_step(&task, &agent_name, draft).await {
            Ok(CommittedStep { task, artifact }) => {
                tracing::debug!(
                    "[TASK_MANAGER] Task {} step {} ({}) -> artifact {}",
                    task.id,
                    step,
                    agent_name,
                    artifact.id
                );
                if let Err(e) = self.progress.publish_progress(&task, &artifact).await {
                    tracing::warn!("[TASK_MANAGER] Progress event for {} dropped: {}", task.id, e);
                }
                Ok(StepOutcome::Advanced(task))
            }
            Err(e) if e.is_duplicate() => Ok(StepOutcome::failed(
                TaskErrorKind::DuplicateArtifact,
                e.to_string(),
            )),
            Err(ArtifactStoreError::StaleTask(id)) => Err(TaskManagerError::Conflict(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Runs one agent with panic capture and the optional step timeout.
    async fn invoke(
        &self,
        agent: &dyn Agent,
        agent_name: &str,
        input: AgentInput,
        reporter: &ProgressReporter,
    ) -> Result<ArtifactDraft, String> {
        let work = AssertUnwindSafe(agent.process(input, reporter)).catch_unwind();
        let outcome = match self.settings.step_timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(format!(
                        "{agent_name} timed out after {}ms",
                        limit.as_millis()
                    ));
                }
            },
            None => work.await,
        };

        match outcome {
            Ok(Ok(draft)) => Ok(draft),
            Ok(Err(e)) => Err(format!("{agent_name}: {e}")),
            Err(panic) => Err(format!("{agent_name} panicked: {}", panic_message(panic.as_ref()))),
        }
    }

    async fn fail(
        &self,
        task: &Task,
        kind: TaskErrorKind,
        message: &str,
    ) -> Result<Task, TaskManagerError> {
        let message = if message.trim().is_empty() {
            kind.to_string()
        } else {
            message.to_string()
        };

        let Some(failed) = Task::mark_failed(&self.db.pool, task.id, kind, &message).await? else {
            // Already terminal; keep whatever state won.
            return self.get_task(task.id).await;
        };
        tracing::error!(
            "[TASK_MANAGER] Task {} failed at step {} ({}): {}",
            failed.id,
            failed.current_step_index,
            kind,
            message
        );
        if let Err(e) = self.progress.publish_failed(&failed).await {
            tracing::warn!("[TASK_MANAGER] Failed event for {} dropped: {}", failed.id, e);
        }
        Ok(failed)
    }

    async fn finish(&self, task: Task) -> Result<Task, TaskManagerError> {
        let mut stored = None;
        if let Some(sink) = &self.sink {
            let Some(artifact) = self.artifacts.get_latest(task.id).await? else {
                return self
                    .fail(&task, TaskErrorKind::HandoffError, "No terminal artifact to hand off")
                    .await;
            };
            match sink.reconcile(&task, &artifact).await {
                Ok(count) => stored = Some(count),
                Err(e) => {
                    return self
                        .fail(&task, TaskErrorKind::HandoffError, &format!("Handoff failed: {e}"))
                        .await;
                }
            }
        }

        let Some(done) = Task::mark_completed(&self.db.pool, task.id).await? else {
            return Err(TaskManagerError::Conflict(task.id));
        };
        let artifact_count = self.artifacts.count(done.id).await?;
        tracing::info!(
            "[TASK_MANAGER] Task {} completed with {} artifacts",
            done.id,
            artifact_count
        );
        if let Err(e) = self
            .progress
            .publish_completed(&done, artifact_count, stored)
            .await
        {
            tracing::warn!("[TASK_MANAGER] Completed event for {} dropped: {}", done.id, e);
        }
        Ok(done)
    }

    async fn emit_status(&self, task: &Task, message: impl Into<String>) {
        if let Err(e) = self.progress.publish_status(task, message).await {
            tracing::warn!("[TASK_MANAGER] Status event for {} dropped: {}", task.id, e);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use db::models::{
        artifact::CreateArtifact,
        imported_bookmark::ImportedBookmark,
        progress_event::{ProgressEvent, ProgressEventType},
    };
    use serde_json::json;

    use super::*;
    use crate::services::{
        agents::{AgentCapability, AgentError, import::ImportAgent},
        bookmark_sink::{BookmarkSinkError, SqliteBookmarkSink},
        config::{AgentsConfig, ImportAgentConfig, WorkflowConfig},
        workflows::{BOOKMARK_PROCESSING, IMPORT_ONLY},
    };

    const EXPORT: &str = r#"<!DOCTYPE NETSCAPE-Bookmark-file-1>
<DL><p>
    <DT><A HREF="https://www.rust-lang.org/learn">Learn Rust</A>
    <DT><H3>Research</H3>
    <DL><p>
        <DT><A HREF="https://arxiv.org/abs/1706.03762">Attention Is All You Need</A>
        <DT><A HREF="https://github.com/tokio-rs/tokio">Tokio</A>
    </DL><p>
</DL><p>"#;

    #[derive(Clone, Copy)]
    enum Behavior {
        PassThrough,
        Fail,
        Panic,
        Sleep(Duration),
        BadOutput,
    }

    struct FakeAgent {
        agent_type: AgentType,
        behavior: Behavior,
    }

    fn fake(agent_type: AgentType, behavior: Behavior) -> Arc<dyn Agent> {
        Arc::new(FakeAgent {
            agent_type,
            behavior,
        })
    }

    fn pass_through_draft(input: &AgentInput) -> ArtifactDraft {
        ArtifactDraft {
            artifact_type: "fake_output".to_string(),
            data: json!({
                "bookmarks": input.payload.get("bookmarks").cloned().unwrap_or_else(|| json!([]))
            }),
        }
    }

    #[async_trait]
    impl Agent for FakeAgent {
        fn agent_type(&self) -> AgentType {
            self.agent_type
        }

        fn capability(&self) -> AgentCapability {
            AgentCapability {
                agent_type: self.agent_type,
                version: "0.0.1".to_string(),
                description: "test double".to_string(),
                input_schema: json!({ "type": "object" }),
                output_schema: json!({
                    "type": "object",
                    "required": ["bookmarks"],
                    "properties": { "bookmarks": { "type": "array" } }
                }),
                output_artifact_type: "fake_output".to_string(),
            }
        }

        async fn process(
            &self,
            input: AgentInput,
            reporter: &ProgressReporter,
        ) -> Result<ArtifactDraft, AgentError> {
            reporter.message("working").await;
            match self.behavior {
                Behavior::PassThrough => Ok(pass_through_draft(&input)),
                Behavior::Fail => Err(AgentError::Processing("upstream exploded".to_string())),
                Behavior::Panic => panic!("fake agent blew up"),
                Behavior::Sleep(duration) => {
                    tokio::time::sleep(duration).await;
                    Ok(pass_through_draft(&input))
                }
                Behavior::BadOutput => Ok(ArtifactDraft {
                    artifact_type: "fake_output".to_string(),
                    data: json!({ "nope": 1 }),
                }),
            }
        }
    }

    /// Pulls the artifacts table out from under the manager mid-step.
    struct TableDroppingAgent {
        pool: sqlx::SqlitePool,
    }

    #[async_trait]
    impl Agent for TableDroppingAgent {
        fn agent_type(&self) -> AgentType {
            AgentType::Import
        }

        fn capability(&self) -> AgentCapability {
            FakeAgent {
                agent_type: AgentType::Import,
                behavior: Behavior::PassThrough,
            }
            .capability()
        }

        async fn process(
            &self,
            input: AgentInput,
            _reporter: &ProgressReporter,
        ) -> Result<ArtifactDraft, AgentError> {
            sqlx::query("DROP TABLE artifacts")
                .execute(&self.pool)
                .await
                .map_err(|e| AgentError::Processing(e.to_string()))?;
            Ok(pass_through_draft(&input))
        }
    }

    struct FailingSink;

    #[async_trait]
    impl BookmarkSink for FailingSink {
        async fn reconcile(
            &self,
            _task: &Task,
            artifact: &Artifact,
        ) -> Result<usize, BookmarkSinkError> {
            Err(BookmarkSinkError::MissingBookmarks(artifact.artifact_type.clone()))
        }
    }

    struct Harness {
        db: DBService,
        manager: TaskManager,
    }

    async fn harness_with(
        registry: AgentRegistry,
        workflows: &[(&str, &[&str])],
        settings: TaskManagerSettings,
        sink: Option<Arc<dyn BookmarkSink>>,
    ) -> Harness {
        let db = DBService::new_in_memory().await.expect("db");
        harness_on(db, registry, workflows, settings, sink)
    }

    fn harness_on(
        db: DBService,
        registry: AgentRegistry,
        workflows: &[(&str, &[&str])],
        settings: TaskManagerSettings,
        sink: Option<Arc<dyn BookmarkSink>>,
    ) -> Harness {
        let configs: Vec<WorkflowConfig> = workflows
            .iter()
            .map(|(workflow_type, agents)| WorkflowConfig {
                workflow_type: workflow_type.to_string(),
                name: None,
                description: None,
                agents: agents.iter().map(|a| a.to_string()).collect(),
            })
            .collect();
        let catalog = WorkflowCatalog::with_config(&configs).expect("workflows");
        let progress = Arc::new(ProgressBroadcaster::new(db.pool.clone(), 256, 64));
        let manager = TaskManager::new(
            db.clone(),
            Arc::new(registry),
            Arc::new(catalog),
            progress,
            sink,
            settings,
        );
        Harness { db, manager }
    }

    async fn harness(agents: Vec<Arc<dyn Agent>>, workflows: &[(&str, &[&str])]) -> Harness {
        let registry = agents
            .into_iter()
            .fold(AgentRegistry::builder(), |builder, agent| {
                builder.register(agent).expect("register")
            })
            .build();
        harness_with(registry, workflows, TaskManagerSettings::default(), None).await
    }

    async fn history(h: &Harness, task_id: Uuid) -> Vec<ProgressEvent> {
        h.manager
            .progress()
            .history(task_id, None)
            .await
            .expect("history")
    }

    async fn wait_until_terminal(h: &Harness, task_id: Uuid) -> Task {
        for _ in 0..500 {
            let task = h.manager.get_task(task_id).await.expect("task");
            if task.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {task_id} did not finish");
    }

    #[tokio::test]
    async fn bookmark_processing_runs_every_agent_in_order() {
        let registry = AgentRegistry::from_config(&AgentsConfig::default()).expect("registry");
        let mut h = harness_with(registry, &[], TaskManagerSettings::default(), None).await;
        h.manager.sink = Some(Arc::new(SqliteBookmarkSink::new(h.db.clone())));

        let task = h
            .manager
            .create_task(BOOKMARK_PROCESSING, json!({ "file_content": EXPORT, "user_id": "u1" }))
            .await
            .expect("create");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.total_steps, 5);

        let done = h.manager.run_task(task.id).await.expect("run");
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.progress_percent, 100);
        assert_eq!(done.current_step_index, done.total_steps);
        assert!(done.completed_at.is_some());

        let artifacts = h.manager.list_artifacts(task.id).await.expect("artifacts");
        assert_eq!(artifacts.len() as i64, done.total_steps);
        let producers: Vec<_> = artifacts.iter().map(|a| a.agent_type.as_str()).collect();
        assert_eq!(
            producers,
            vec!["import", "validation", "enrichment", "categorization", "embedding"]
        );
        assert!(artifacts.iter().enumerate().all(|(i, a)| a.step_index == i as i64));
        assert_eq!(artifacts[4].artifact_type, "embedding_batch");

        let stored = ImportedBookmark::find_by_user(&h.db.pool, "u1").await.expect("stored");
        assert_eq!(stored.len(), 3);
        assert!(stored.iter().all(|b| !b.embedding.is_empty() && !b.categories.is_empty()));

        let events = history(&h, task.id).await;
        assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
        assert_eq!(events.last().map(|e| e.event_type), Some(ProgressEventType::Completed));
        let percents: Vec<i64> = events
            .iter()
            .filter(|e| e.event_type == ProgressEventType::Progress)
            .filter_map(|e| e.payload["percent"].as_i64())
            .collect();
        assert_eq!(percents, vec![20, 40, 60, 80, 100]);
    }

    #[tokio::test]
    async fn failing_step_stops_the_workflow() {
        let h = harness(
            vec![
                Arc::new(ImportAgent::new(ImportAgentConfig::default())),
                fake(AgentType::Validation, Behavior::Fail),
                fake(AgentType::Enrichment, Behavior::PassThrough),
            ],
            &[("import_then_validate", &["import", "validation", "enrichment"])],
        )
        .await;

        let task = h
            .manager
            .create_task("import_then_validate", json!({ "file_content": EXPORT }))
            .await
            .expect("create");
        let failed = h.manager.run_task(task.id).await.expect("run");

        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error_kind, Some(TaskErrorKind::AgentProcessingError));
        assert_eq!(failed.current_step_index, 1);
        assert_eq!(failed.current_agent.as_deref(), Some("validation"));
        assert!(failed.error_message.as_deref().is_some_and(|m| m.contains("upstream exploded")));
        assert!(failed.completed_at.is_some());

        let artifacts = h.manager.list_artifacts(task.id).await.expect("artifacts");
        assert_eq!(artifacts.len() as i64, failed.current_step_index);
        assert_eq!(artifacts[0].agent_type, "import");

        let events = history(&h, task.id).await;
        assert_eq!(events.last().map(|e| e.event_type), Some(ProgressEventType::Failed));
        assert!(!events.iter().any(|e| e.event_type == ProgressEventType::Completed));
    }

    #[tokio::test]
    async fn unknown_workflow_creates_nothing() {
        let h = harness(vec![fake(AgentType::Import, Behavior::PassThrough)], &[]).await;
        let err = h
            .manager
            .create_task("does_not_exist", json!({}))
            .await
            .expect_err("unknown workflow");
        assert!(matches!(err, TaskManagerError::InvalidWorkflow(_)));
        assert!(h.manager.list_tasks(None, 50).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn duplicate_artifact_fails_the_task() {
        let h = harness(vec![fake(AgentType::Import, Behavior::PassThrough)], &[]).await;
        let task = h
            .manager
            .create_task(IMPORT_ONLY, json!({}))
            .await
            .expect("create");
        h.manager
            .artifacts()
            .save(&CreateArtifact {
                task_id: task.id,
                agent_type: "import".to_string(),
                step_index: 7,
                artifact_type: "stray".to_string(),
                data: json!({}),
            })
            .await
            .expect("stray artifact");

        let failed = h.manager.run_task(task.id).await.expect("run");
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error_kind, Some(TaskErrorKind::DuplicateArtifact));
        assert_eq!(failed.current_step_index, 0);
        assert_eq!(h.manager.artifacts().count(task.id).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn schema_violation_is_reported_before_processing() {
        let h = harness(
            vec![Arc::new(ImportAgent::new(ImportAgentConfig::default()))],
            &[],
        )
        .await;
        let task = h
            .manager
            .create_task(IMPORT_ONLY, json!({ "file_name": "bookmarks.html" }))
            .await
            .expect("create");

        let failed = h.manager.run_task(task.id).await.expect("run");
        assert_eq!(failed.error_kind, Some(TaskErrorKind::SchemaViolation));
        assert!(failed.error_message.as_deref().is_some_and(|m| m.contains("file_content")));
        assert!(h.manager.list_artifacts(task.id).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn panics_and_bad_output_become_processing_errors() {
        let h = harness(
            vec![
                fake(AgentType::Import, Behavior::Panic),
                fake(AgentType::Validation, Behavior::BadOutput),
            ],
            &[("panics", &["import"]), ("bad_output", &["validation"])],
        )
        .await;

        let panicking = h.manager.create_task("panics", json!({})).await.expect("create");
        let failed = h.manager.run_task(panicking.id).await.expect("run");
        assert_eq!(failed.error_kind, Some(TaskErrorKind::AgentProcessingError));
        assert!(failed.error_message.as_deref().is_some_and(|m| m.contains("panicked")));

        let bad = h.manager.create_task("bad_output", json!({})).await.expect("create");
        let failed = h.manager.run_task(bad.id).await.expect("run");
        assert_eq!(failed.error_kind, Some(TaskErrorKind::AgentProcessingError));
        assert!(failed.error_message.as_deref().is_some_and(|m| m.contains("bookmarks")));
        assert!(h.manager.list_artifacts(bad.id).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn slow_steps_time_out() {
        let registry = AgentRegistry::builder()
            .register(fake(AgentType::Import, Behavior::Sleep(Duration::from_secs(30))))
            .expect("register")
            .build();
        let settings = TaskManagerSettings {
            step_timeout: Some(Duration::from_millis(50)),
            ..TaskManagerSettings::default()
        };
        let h = harness_with(registry, &[], settings, None).await;

        let task = h.manager.create_task(IMPORT_ONLY, json!({})).await.expect("create");
        let failed = h.manager.run_task(task.id).await.expect("run");
        assert_eq!(failed.error_kind, Some(TaskErrorKind::AgentProcessingError));
        assert!(failed.error_message.as_deref().is_some_and(|m| m.contains("timed out")));
    }

    #[tokio::test]
    async fn running_a_terminal_task_is_a_no_op() {
        let h = harness(vec![fake(AgentType::Import, Behavior::PassThrough)], &[]).await;
        let task = h.manager.create_task(IMPORT_ONLY, json!({})).await.expect("create");
        let first = h.manager.run_task(task.id).await.expect("first run");
        let events_before = history(&h, task.id).await.len();

        let second = h.manager.run_task(task.id).await.expect("second run");
        assert_eq!(second.status, TaskStatus::Completed);
        assert_eq!(second.completed_at, first.completed_at);
        assert_eq!(history(&h, task.id).await.len(), events_before);
        assert_eq!(h.manager.artifacts().count(task.id).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn concurrent_runs_execute_each_step_once() {
        let h = harness(
            vec![
                fake(AgentType::Import, Behavior::PassThrough),
                fake(AgentType::Validation, Behavior::PassThrough),
            ],
            &[("pair", &["import", "validation"])],
        )
        .await;
        let task = h.manager.create_task("pair", json!({})).await.expect("create");

        let (a, b) = tokio::join!(h.manager.run_task(task.id), h.manager.run_task(task.id));
        a.expect("first runner");
        b.expect("second runner");

        let done = wait_until_terminal(&h, task.id).await;
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(h.manager.artifacts().count(task.id).await.expect("count"), 2);
    }

    #[tokio::test]
    async fn handoff_failure_keeps_artifacts() {
        let registry = AgentRegistry::builder()
            .register(fake(AgentType::Import, Behavior::PassThrough))
            .expect("register")
            .build();
        let h = harness_with(
            registry,
            &[],
            TaskManagerSettings::default(),
            Some(Arc::new(FailingSink)),
        )
        .await;

        let task = h.manager.create_task(IMPORT_ONLY, json!({})).await.expect("create");
        let failed = h.manager.run_task(task.id).await.expect("run");
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error_kind, Some(TaskErrorKind::HandoffError));
        assert_eq!(failed.current_step_index, failed.total_steps);
        assert_eq!(h.manager.artifacts().count(task.id).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn submit_runs_in_the_background() {
        let h = harness(vec![fake(AgentType::Import, Behavior::PassThrough)], &[]).await;
        let task = h.manager.submit(IMPORT_ONLY, json!({})).await.expect("submit");
        assert_eq!(task.status, TaskStatus::Pending);

        let done = wait_until_terminal(&h, task.id).await;
        assert_eq!(done.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn dropped_caller_does_not_abandon_a_claimed_task() {
        let h = harness(
            vec![fake(AgentType::Import, Behavior::Sleep(Duration::from_millis(300)))],
            &[],
        )
        .await;
        let task = h.manager.create_task(IMPORT_ONLY, json!({})).await.expect("create");

        let waited =
            tokio::time::timeout(Duration::from_millis(50), h.manager.run_task(task.id)).await;
        assert!(waited.is_err(), "caller should give up before the step ends");

        let done = wait_until_terminal(&h, task.id).await;
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(h.manager.artifacts().count(task.id).await.expect("count"), 1);
        let events = history(&h, task.id).await;
        assert_eq!(events.last().map(|e| e.event_type), Some(ProgressEventType::Completed));
    }

    #[tokio::test]
    async fn store_errors_fail_the_task() {
        let db = DBService::new_in_memory().await.expect("db");
        let registry = AgentRegistry::builder()
            .register(Arc::new(TableDroppingAgent {
                pool: db.pool.clone(),
            }))
            .expect("register")
            .build();
        let h = harness_on(db, registry, &[], TaskManagerSettings::default(), None);

        let task = h.manager.create_task(IMPORT_ONLY, json!({})).await.expect("create");
        let failed = h.manager.run_task(task.id).await.expect("run");

        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error_kind, Some(TaskErrorKind::AgentProcessingError));
        assert!(failed.error_message.as_deref().is_some_and(|m| m.contains("no such table")));
        assert!(failed.completed_at.is_some());

        let events = history(&h, task.id).await;
        assert_eq!(events.last().map(|e| e.event_type), Some(ProgressEventType::Failed));
        assert_eq!(h.manager.progress().active_channels().await, 0);
    }

    async fn interrupted_task(h: &Harness) -> Task {
        let task = h.manager.create_task("pair", json!({})).await.expect("create");
        let running = Task::mark_running(&h.db.pool, task.id)
            .await
            .expect("mark running")
            .expect("pending");
        let committed = h
            .manager
            .artifacts()
            .commit_step(
                &running,
                "import",
                ArtifactDraft {
                    artifact_type: "fake_output".to_string(),
                    data: json!({ "bookmarks": [] }),
                },
            )
            .await
            .expect("step 0");
        committed.task
    }

    #[tokio::test]
    async fn recovery_resumes_from_the_last_committed_step() {
        let h = harness(
            vec![
                fake(AgentType::Import, Behavior::PassThrough),
                fake(AgentType::Validation, Behavior::PassThrough),
            ],
            &[("pair", &["import", "validation"])],
        )
        .await;
        let interrupted = interrupted_task(&h).await;
        let never_started = h.manager.create_task(IMPORT_ONLY, json!({})).await.expect("create");

        let report = h.manager.recover_incomplete_tasks().await.expect("recover");
        assert_eq!(report.resumed, vec![interrupted.id]);
        assert_eq!(report.requeued, vec![never_started.id]);

        let resumed = wait_until_terminal(&h, interrupted.id).await;
        assert_eq!(resumed.status, TaskStatus::Completed);
        let artifacts = h.manager.list_artifacts(interrupted.id).await.expect("list");
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[1].agent_type, "validation");

        let requeued = wait_until_terminal(&h, never_started.id).await;
        assert_eq!(requeued.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn recovery_can_fail_interrupted_tasks() {
        let registry = AgentRegistry::builder()
            .register(fake(AgentType::Import, Behavior::PassThrough))
            .and_then(|b| b.register(fake(AgentType::Validation, Behavior::PassThrough)))
            .expect("register")
            .build();
        let settings = TaskManagerSettings {
            recovery_policy: RecoveryPolicy::Fail,
            ..TaskManagerSettings::default()
        };
        let h = harness_with(registry, &[("pair", &["import", "validation"])], settings, None).await;
        let interrupted = interrupted_task(&h).await;

        let report = h.manager.recover_incomplete_tasks().await.expect("recover");
        assert_eq!(report.failed, vec![interrupted.id]);

        let failed = h.manager.get_task(interrupted.id).await.expect("task");
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error_kind, Some(TaskErrorKind::ProcessRestart));
        assert_eq!(h.manager.artifacts().count(interrupted.id).await.expect("count"), 1);
    }
}
