use axum::{Router, extract::State, response::Json as ResponseJson, routing::get};
use deployment::Deployment;
use services::services::workflows::WorkflowDefinition;
use utils::response::ApiResponse;

use crate::DeploymentImpl;

pub async fn list_workflows(
    State(deployment): State<DeploymentImpl>,
) -> ResponseJson<ApiResponse<Vec<WorkflowDefinition>>> {
    ResponseJson(ApiResponse::success(deployment.workflows().list()))
}

pub fn router() -> Router<DeploymentImpl> {
    Router::new().route("/workflows", get(list_workflows))
}
