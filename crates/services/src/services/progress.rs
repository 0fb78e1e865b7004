//! Progress Broadcaster - per-task ordered event streams
//!
//! Every event is appended to the `progress_events` audit log before it is
//! forwarded to live subscribers, so a reconnecting client can always be
//! caught up from storage.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use async_stream::stream;
use chrono::Utc;
use db::models::{
    artifact::Artifact,
    progress_event::{CreateProgressEvent, ProgressEvent, ProgressEventError, ProgressEventType},
    task::{Task, TaskError, TaskStatus},
};
use futures::{StreamExt, stream::BoxStream};
use serde_json::{Value, json};
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, broadcast, broadcast::error::RecvError};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error(transparent)]
    Event(#[from] ProgressEventError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error("Task {0} not found")]
    TaskNotFound(Uuid),
    #[error("Task {0} already published a terminal event")]
    AlreadyTerminal(Uuid),
}

struct ChannelState {
    next_seq: i64,
    replay: VecDeque<ProgressEvent>,
    closed: bool,
}

struct TaskChannel {
    sender: broadcast::Sender<ProgressEvent>,
    state: Mutex<ChannelState>,
}

pub struct ProgressBroadcaster {
    pool: SqlitePool,
    channels: RwLock<HashMap<Uuid, Arc<TaskChannel>>>,
    capacity: usize,
    replay_limit: usize,
}

impl ProgressBroadcaster {
    pub fn new(pool: SqlitePool, capacity: usize, replay_limit: usize) -> Self {
        Self {
            pool,
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            replay_limit,
        }
    }

    /// Number of tasks with an open channel.
    pub async fn active_channels(&self) -> usize {
        self.channels.read().await.len()
    }

    async fn channel(&self, task_id: Uuid) -> Result<Arc<TaskChannel>, ProgressError> {
        if let Some(channel) = self.channels.read().await.get(&task_id) {
            return Ok(channel.clone());
        }

        // Audit-log read and insert both happen under the write lock.
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get(&task_id) {
            return Ok(channel.clone());
        }

        // Sequence numbers continue from the audit log after a restart.
        let last = ProgressEvent::find_last(&self.pool, task_id).await?;
        let (next_seq, closed) = match &last {
            Some(event) => (event.seq + 1, event.event_type.is_terminal()),
            None => (1, false),
        };
        let (sender, _) = broadcast::channel(self.capacity);
        let channel = Arc::new(TaskChannel {
            sender,
            state: Mutex::new(ChannelState {
                next_seq,
                replay: VecDeque::new(),
                closed,
            }),
        });
        if !closed {
            channels.insert(task_id, channel.clone());
        }
        Ok(channel)
    }

    /// Persists and forwards one event. Sequence assignment, persistence and
    /// delivery happen under the task's lock, so every subscriber observes
    /// events in `seq` order.
    pub async fn publish(
        &self,
        task_id: Uuid,
        event_type: ProgressEventType,
        payload: Value,
    ) -> Result<ProgressEvent, ProgressError> {
        let channel = self.channel(task_id).await?;
        let mut state = channel.state.lock().await;
        if state.closed {
            return Err(ProgressError::AlreadyTerminal(task_id));
        }

        let event = ProgressEvent::create(
            &self.pool,
            &CreateProgressEvent {
                task_id,
                seq: state.next_seq,
                event_type,
                payload,
            },
        )
        .await?;
        state.next_seq += 1;

        state.replay.push_back(event.clone());
        while state.replay.len() > self.replay_limit {
            state.replay.pop_front();
        }

        // No receivers is not an error.
        let _ = channel.sender.send(event.clone());

        if event_type.is_terminal() {
            state.closed = true;
            drop(state);
            let mut channels = self.channels.write().await;
            if channels
                .get(&task_id)
                .is_some_and(|current| Arc::ptr_eq(current, &channel))
            {
                channels.remove(&task_id);
            }
            tracing::debug!("[PROGRESS] Closed channel for task {}", task_id);
        }

        Ok(event)
    }

    /// Ordered event stream for one task.
    ///
    /// Without `after_seq` the stream opens with a synthetic `status` event
    /// carrying the current task snapshot. With `after_seq` the events the
    /// client missed are replayed first. Either way the stream ends right
    /// after the task's terminal event.
    pub async fn subscribe(
        &self,
        task_id: Uuid,
        after_seq: Option<i64>,
    ) -> Result<BoxStream<'static, ProgressEvent>, ProgressError> {
        if Task::find_by_id(&self.pool, task_id).await?.is_none() {
            return Err(ProgressError::TaskNotFound(task_id));
        }

        let channel = self.channel(task_id).await?;
        let (mut receiver, last_seq, closed, buffered) = {
            let state = channel.state.lock().await;
            (
                channel.sender.subscribe(),
                state.next_seq - 1,
                state.closed,
                state.replay.iter().cloned().collect::<Vec<_>>(),
            )
        };
        drop(channel);

        // Read only after subscribing: anything newer arrives on `receiver`.
        let task = Task::find_by_id(&self.pool, task_id)
            .await?
            .ok_or(ProgressError::TaskNotFound(task_id))?;
        let pool = self.pool.clone();

        let events = stream! {
            let mut last = match after_seq {
                None => {
                    yield snapshot_event(&task, last_seq);
                    last_seq
                }
                Some(after) => {
                    let missed: Vec<ProgressEvent> = if buffered.first().is_some_and(|e| e.seq <= after + 1) {
                        buffered.into_iter().filter(|e| e.seq > after).collect()
                    } else {
                        match ProgressEvent::find_after_seq(&pool, task_id, after).await {
                            Ok(events) => events.into_iter().filter(|e| e.seq <= last_seq).collect(),
                            Err(e) => {
                                tracing::warn!("[PROGRESS] Replay for task {} failed: {}", task_id, e);
                                Vec::new()
                            }
                        }
                    };
                    let mut last = after;
                    for event in missed {
                        last = event.seq;
                        let terminal = event.event_type.is_terminal();
                        yield event;
                        if terminal {
                            return;
                        }
                    }
                    last.max(last_seq)
                }
            };

            if closed || task.is_terminal() {
                if let Some(event) = terminal_event(&pool, &task, last_seq).await {
                    if after_seq.is_none_or(|after| event.seq > after) || event.id.is_nil() {
                        yield event;
                    }
                }
                return;
            }

            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if event.seq <= last {
                            continue;
                        }
                        last = event.seq;
                        let terminal = event.event_type.is_terminal();
                        yield event;
                        if terminal {
                            return;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            "[PROGRESS] Subscriber for task {} lagged by {} events, catching up from the audit log",
                            task_id,
                            skipped
                        );
                        match ProgressEvent::find_after_seq(&pool, task_id, last).await {
                            Ok(events) => {
                                for event in events {
                                    last = event.seq;
                                    let terminal = event.event_type.is_terminal();
                                    yield event;
                                    if terminal {
                                        return;
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::warn!("[PROGRESS] Catch-up for task {} failed: {}", task_id, e);
                                return;
                            }
                        }
                    }
                    Err(RecvError::Closed) => {
                        if let Ok(events) = ProgressEvent::find_after_seq(&pool, task_id, last).await {
                            for event in events {
                                yield event;
                            }
                        }
                        return;
                    }
                }
            }
        };

        Ok(events.boxed())
    }

    /// Audit log of a task, oldest first.
    pub async fn history(
        &self,
        task_id: Uuid,
        after_seq: Option<i64>,
    ) -> Result<Vec<ProgressEvent>, ProgressError> {
        Ok(ProgressEvent::find_after_seq(&self.pool, task_id, after_seq.unwrap_or(0)).await?)
    }

    pub async fn publish_status(
        &self,
        task: &Task,
        message: impl Into<String>,
    ) -> Result<ProgressEvent, ProgressError> {
        self.publish(
            task.id,
            ProgressEventType::Status,
            json!({
                "status": task.status,
                "current_agent": task.current_agent,
                "step": task.current_step_index,
                "total_steps": task.total_steps,
                "percent": task.progress_percent,
                "message": message.into(),
            }),
        )
        .await
    }

    pub async fn publish_progress(
        &self,
        task: &Task,
        artifact: &Artifact,
    ) -> Result<ProgressEvent, ProgressError> {
        self.publish(
            task.id,
            ProgressEventType::Progress,
            json!({
                "step": artifact.step_index,
                "total_steps": task.total_steps,
                "percent": task.progress_percent,
                "agent_type": artifact.agent_type,
                "artifact_id": artifact.id,
                "artifact_type": artifact.artifact_type,
            }),
        )
        .await
    }

    pub async fn publish_message(
        &self,
        task_id: Uuid,
        agent_type: &str,
        step: i64,
        message: &str,
        detail: Option<Value>,
    ) -> Result<ProgressEvent, ProgressError> {
        let mut payload = json!({
            "agent_type": agent_type,
            "step": step,
            "message": message,
        });
        if let Some(detail) = detail {
            payload["metadata"] = detail;
        }
        self.publish(task_id, ProgressEventType::Message, payload).await
    }

    pub async fn publish_completed(
        &self,
        task: &Task,
        artifact_count: i64,
        bookmarks_stored: Option<usize>,
    ) -> Result<ProgressEvent, ProgressError> {
        self.publish(
            task.id,
            ProgressEventType::Completed,
            json!({
                "status": task.status,
                "total_steps": task.total_steps,
                "percent": task.progress_percent,
                "artifact_count": artifact_count,
                "bookmarks_stored": bookmarks_stored,
                "completed_at": task.completed_at,
            }),
        )
        .await
    }

    pub async fn publish_failed(&self, task: &Task) -> Result<ProgressEvent, ProgressError> {
        self.publish(task.id, ProgressEventType::Failed, failure_payload(task))
            .await
    }
}

fn failure_payload(task: &Task) -> Value {
    json!({
        "status": task.status,
        "step": task.current_step_index,
        "agent_type": task.current_agent,
        "error_kind": task.error_kind,
        "error_message": task.error_message,
        "completed_at": task.completed_at,
    })
}

/// Status event built from a task row. It is never persisted and reuses the
/// last published `seq`, so resuming from it skips nothing.
fn snapshot_event(task: &Task, seq: i64) -> ProgressEvent {
    ProgressEvent {
        id: Uuid::new_v4(),
        task_id: task.id,
        seq,
        event_type: ProgressEventType::Status,
        payload: json!({
            "snapshot": true,
            "status": task.status,
            "current_agent": task.current_agent,
            "step": task.current_step_index,
            "total_steps": task.total_steps,
            "percent": task.progress_percent,
            "task": task,
        }),
        created_at: Utc::now(),
    }
}

/// The persisted terminal event of a finished task, or one derived from the
/// task row when none was recorded. Derived events carry a nil id.
async fn terminal_event(pool: &SqlitePool, task: &Task, seq: i64) -> Option<ProgressEvent> {
    match ProgressEvent::find_last_terminal(pool, task.id).await {
        Ok(Some(event)) => return Some(event),
        Ok(None) => {}
        Err(e) => tracing::warn!("[PROGRESS] Could not load terminal event for {}: {}", task.id, e),
    }

    let (event_type, payload) = match task.status {
        TaskStatus::Completed => (
            ProgressEventType::Completed,
            json!({
                "status": task.status,
                "total_steps": task.total_steps,
                "percent": task.progress_percent,
                "completed_at": task.completed_at,
            }),
        ),
        TaskStatus::Failed => (ProgressEventType::Failed, failure_payload(task)),
        TaskStatus::Pending | TaskStatus::Running => return None,
    };
    Some(ProgressEvent {
        id: Uuid::nil(),
        task_id: task.id,
        seq,
        event_type,
        payload,
        created_at: Utc::now(),
    })
}

#[derive(Clone)]
struct ReporterTarget {
    broadcaster: Arc<ProgressBroadcaster>,
    task_id: Uuid,
    agent_type: String,
    step_index: i64,
}

/// Handle an agent uses to emit `message` events for the step it is
/// running. Reporting never changes task state, and publish failures are
/// logged rather than surfaced to the agent.
#[derive(Clone, Default)]
pub struct ProgressReporter {
    target: Option<ReporterTarget>,
}

impl ProgressReporter {
    pub fn new(
        broadcaster: Arc<ProgressBroadcaster>,
        task_id: Uuid,
        agent_type: impl Into<String>,
        step_index: i64,
    ) -> Self {
        Self {
            target: Some(ReporterTarget {
                broadcaster,
                task_id,
                agent_type: agent_type.into(),
                step_index,
            }),
        }
    }

    /// A reporter that drops everything. Used when an agent runs outside a
    /// task.
    pub fn detached() -> Self {
        Self::default()
    }

    pub async fn message(&self, text: impl Into<String>) {
        self.report(text, None).await
    }

    pub async fn items(&self, label: &str, done: usize, total: usize) {
        let percentage = if total == 0 { 100 } else { done * 100 / total };
        self.report(
            format!("{label}: {done}/{total}"),
            Some(json!({ "current": done, "total": total, "percentage": percentage })),
        )
        .await
    }

    pub async fn report(&self, text: impl Into<String>, detail: Option<Value>) {
        let Some(target) = &self.target else {
            return;
        };
        let text = text.into();
        if let Err(e) = target
            .broadcaster
            .publish_message(
                target.task_id,
                &target.agent_type,
                target.step_index,
                &text,
                detail,
            )
            .await
        {
            tracing::warn!(
                "[PROGRESS] Dropped message from {} on task {}: {}",
                target.agent_type,
                target.task_id,
                e
            );
        }
    }
}
