use axum::{extract::State, response::Json as ResponseJson};
use deployment::Deployment;
use serde::Serialize;
use ts_rs::TS;
use utils::response::ApiResponse;

use crate::{DeploymentImpl, error::ApiError};

#[derive(Debug, Serialize, TS)]
#[ts(export)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub agents: usize,
    pub active_streams: usize,
}

pub async fn health_check(
    State(deployment): State<DeploymentImpl>,
) -> Result<ResponseJson<ApiResponse<HealthStatus>>, ApiError> {
    sqlx::query("SELECT 1").execute(&deployment.db().pool).await?;

    Ok(ResponseJson(ApiResponse::success(HealthStatus {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        agents: deployment.registry().len(),
        active_streams: deployment.progress().active_channels().await,
    })))
}
