use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use db::models::task::TaskError;
use deployment::DeploymentError;
use services::services::{
    artifacts::ArtifactStoreError, config::ConfigError, progress::ProgressError,
    task_manager::TaskManagerError,
};
use thiserror::Error;
use utils::response::ApiResponse;

#[derive(Debug, Error, ts_rs::TS)]
#[ts(type = "string")]
pub enum ApiError {
    #[error(transparent)]
    TaskManager(#[from] TaskManagerError),
    #[error(transparent)]
    Progress(#[from] ProgressError),
    #[error(transparent)]
    ArtifactStore(#[from] ArtifactStoreError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Deployment(#[from] DeploymentError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status_code, error_type) = match &self {
            ApiError::TaskManager(err) => match err {
                TaskManagerError::InvalidWorkflow(_) => (StatusCode::BAD_REQUEST, "InvalidWorkflow"),
                TaskManagerError::TaskNotFound(_) => (StatusCode::NOT_FOUND, "TaskNotFound"),
                TaskManagerError::Conflict(_) => (StatusCode::CONFLICT, "TaskConflict"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "TaskManagerError"),
            },
            ApiError::Progress(err) => match err {
                ProgressError::TaskNotFound(_) => (StatusCode::NOT_FOUND, "TaskNotFound"),
                ProgressError::AlreadyTerminal(_) => (StatusCode::CONFLICT, "TaskTerminal"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "ProgressError"),
            },
            ApiError::ArtifactStore(err) => match err {
                ArtifactStoreError::StaleTask(_) => (StatusCode::CONFLICT, "TaskConflict"),
                e if e.is_duplicate() => (StatusCode::CONFLICT, "DuplicateArtifact"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "ArtifactStoreError"),
            },
            ApiError::Task(err) => match err {
                TaskError::NotFound => (StatusCode::NOT_FOUND, "TaskNotFound"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "TaskError"),
            },
            ApiError::Deployment(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DeploymentError"),
            ApiError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ConfigError"),
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DatabaseError"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BadRequest"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "ConflictError"),
        };

        let error_message = match &self {
            ApiError::TaskManager(
                e @ (TaskManagerError::InvalidWorkflow(_)
                | TaskManagerError::TaskNotFound(_)
                | TaskManagerError::Conflict(_)),
            ) => e.to_string(),
            ApiError::Progress(e @ ProgressError::TaskNotFound(_)) => e.to_string(),
            ApiError::BadRequest(msg) => msg.clone(),
            ApiError::NotFound(msg) => msg.clone(),
            ApiError::Conflict(msg) => msg.clone(),
            _ => format!("{}: {}", error_type, self),
        };

        if status_code.is_server_error() {
            tracing::error!("{}", error_message);
        }
        let response = ApiResponse::<()>::error(&error_message);
        (status_code, Json(response)).into_response()
    }
}
