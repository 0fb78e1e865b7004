use std::str::FromStr;

use axum::{
    Router,
    extract::{Path, State},
    response::Json as ResponseJson,
    routing::get,
};
use deployment::Deployment;
use services::services::agents::{AgentCapability, AgentType};
use utils::response::ApiResponse;

use crate::{DeploymentImpl, error::ApiError};

/// Capabilities of every registered agent in pipeline order.
pub async fn list_agents(
    State(deployment): State<DeploymentImpl>,
) -> ResponseJson<ApiResponse<Vec<AgentCapability>>> {
    ResponseJson(ApiResponse::success(deployment.registry().capabilities()))
}

pub async fn get_agent(
    State(deployment): State<DeploymentImpl>,
    Path(agent_type): Path<String>,
) -> Result<ResponseJson<ApiResponse<AgentCapability>>, ApiError> {
    let capability = AgentType::from_str(&agent_type)
        .ok()
        .and_then(|t| deployment.registry().capability(t).cloned())
        .ok_or_else(|| ApiError::NotFound(format!("Unknown agent type '{agent_type}'")))?;
    Ok(ResponseJson(ApiResponse::success(capability)))
}

pub fn router() -> Router<DeploymentImpl> {
    Router::new()
        .route("/agents", get(list_agents))
        .route("/agents/{agent_type}", get(get_agent))
}
