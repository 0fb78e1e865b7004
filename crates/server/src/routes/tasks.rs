use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json as ResponseJson,
    routing::{get, post},
};
use db::models::{
    artifact::Artifact,
    progress_event::ProgressEvent,
    task::{Task, TaskStatus},
};
use deployment::Deployment;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;
use utils::response::ApiResponse;
use uuid::Uuid;

use crate::{DeploymentImpl, error::ApiError, routes::event_stream};

const DEFAULT_LIST_LIMIT: i64 = 50;

#[derive(Debug, Deserialize, TS)]
#[ts(export)]
pub struct CreateTaskRequest {
    pub workflow_type: String,
    #[serde(default = "empty_context")]
    pub context: Value,
}

fn empty_context() -> Value {
    Value::Object(Default::default())
}

#[derive(Debug, Serialize, TS)]
#[ts(export)]
pub struct CreateTaskResponse {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub status_url: String,
    pub stream_url: String,
}

#[derive(Debug, Deserialize)]
pub struct TaskListQuery {
    pub status: Option<TaskStatus>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub after: Option<i64>,
}

pub async fn create_task(
    State(deployment): State<DeploymentImpl>,
    Json(payload): Json<CreateTaskRequest>,
) -> Result<(StatusCode, ResponseJson<ApiResponse<CreateTaskResponse>>), ApiError> {
    if !payload.context.is_object() {
        return Err(ApiError::BadRequest(
            "context must be a JSON object".to_string(),
        ));
    }

    tracing::debug!("Creating '{}' task", payload.workflow_type);
    let task = deployment
        .task_manager()
        .submit(&payload.workflow_type, payload.context)
        .await?;

    let response = CreateTaskResponse {
        task_id: task.id,
        status: task.status,
        status_url: format!("/api/tasks/{}", task.id),
        stream_url: format!("/api/tasks/{}/stream", task.id),
    };
    Ok((StatusCode::CREATED, ResponseJson(ApiResponse::success(response))))
}

pub async fn get_tasks(
    State(deployment): State<DeploymentImpl>,
    Query(query): Query<TaskListQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<Task>>>, ApiError> {
    let tasks = deployment
        .task_manager()
        .list_tasks(query.status, query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await?;
    Ok(ResponseJson(ApiResponse::success(tasks)))
}

pub async fn get_task(
    State(deployment): State<DeploymentImpl>,
    Path(task_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    let task = deployment.task_manager().get_task(task_id).await?;
    Ok(ResponseJson(ApiResponse::success(task)))
}

/// Runs a pending task to completion before responding. Terminal tasks are
/// returned as they are.
pub async fn run_task(
    State(deployment): State<DeploymentImpl>,
    Path(task_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Task>>, ApiError> {
    let task = deployment.task_manager().run_task(task_id).await?;
    Ok(ResponseJson(ApiResponse::success(task)))
}

pub async fn get_artifacts(
    State(deployment): State<DeploymentImpl>,
    Path(task_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Vec<Artifact>>>, ApiError> {
    let artifacts = deployment.task_manager().list_artifacts(task_id).await?;
    Ok(ResponseJson(ApiResponse::success(artifacts)))
}

pub async fn get_latest_artifact(
    State(deployment): State<DeploymentImpl>,
    Path(task_id): Path<Uuid>,
) -> Result<ResponseJson<ApiResponse<Artifact>>, ApiError> {
    let artifact = deployment
        .task_manager()
        .latest_artifact(task_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Task {task_id} has no artifacts yet")))?;
    Ok(ResponseJson(ApiResponse::success(artifact)))
}

pub async fn get_events(
    State(deployment): State<DeploymentImpl>,
    Path(task_id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> Result<ResponseJson<ApiResponse<Vec<ProgressEvent>>>, ApiError> {
    deployment.task_manager().get_task(task_id).await?;
    let events = deployment.progress().history(task_id, query.after).await?;
    Ok(ResponseJson(ApiResponse::success(events)))
}

pub fn router(_deployment: &DeploymentImpl) -> Router<DeploymentImpl> {
    let task_id_router = Router::new()
        .route("/", get(get_task))
        .route("/run", post(run_task))
        .route("/artifacts", get(get_artifacts))
        .route("/artifacts/latest", get(get_latest_artifact))
        .route("/events", get(get_events))
        .route("/stream", get(event_stream::stream_task_events));

    let inner = Router::new()
        .route("/", get(get_tasks).post(create_task))
        .nest("/{task_id}", task_id_router);

    Router::new().nest("/tasks", inner)
}
