use axum::{
    Router, middleware,
    routing::{IntoMakeService, get},
};

use crate::{DeploymentImpl, middleware::request_id_middleware};

pub mod agents;
pub mod event_stream;
pub mod health;
pub mod tasks;
pub mod workflows;

/// Every endpoint under `/api`.
pub fn api_router(deployment: DeploymentImpl) -> Router {
    let base_routes = Router::new()
        .route("/health", get(health::health_check))
        .merge(tasks::router(&deployment))
        .merge(agents::router())
        .merge(workflows::router())
        .with_state(deployment);

    Router::new()
        .nest("/api", base_routes)
        .layer(middleware::from_fn(request_id_middleware))
}

pub fn router(deployment: DeploymentImpl) -> IntoMakeService<Router> {
    api_router(deployment).into_make_service()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode},
        response::Response,
    };
    use db::DBService;
    use deployment::Deployment;
    use serde_json::{Value, json};
    use services::services::config::Config;
    use tower::ServiceExt;

    use super::*;
    use crate::middleware::REQUEST_ID_HEADER;

    const EXPORT: &str = r#"<!DOCTYPE NETSCAPE-Bookmark-file-1>
<DL><p>
    <DT><A HREF="https://www.rust-lang.org/">Rust</A>
    <DT><A HREF="https://docs.rs/axum">axum docs</A>
</DL><p>"#;

    async fn deployment() -> DeploymentImpl {
        let db = DBService::new_in_memory().await.expect("db");
        DeploymentImpl::from_parts(db, Config::default()).expect("deployment")
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response: Response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request")
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    #[tokio::test]
    async fn health_reports_registered_agents() {
        let app = api_router(deployment().await);
        let response = app.clone().oneshot(get_request("/api/health")).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));

        let (_, body) = send(&app, get_request("/api/health")).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["agents"], 5);
    }

    #[tokio::test]
    async fn unknown_workflow_is_a_bad_request() {
        let app = api_router(deployment().await);
        let (status, body) = send(
            &app,
            post_json("/api/tasks", json!({ "workflow_type": "nope", "context": {} })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (_, listed) = send(&app, get_request("/api/tasks")).await;
        assert_eq!(listed["data"].as_array().map(Vec::len), Some(0));
    }

    #[tokio::test]
    async fn missing_task_is_not_found() {
        let app = api_router(deployment().await);
        let uri = format!("/api/tasks/{}", uuid::Uuid::new_v4());
        let (status, _) = send(&app, get_request(&uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, get_request(&format!("{uri}/stream"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn submitted_task_runs_to_completion() {
        let deployment = deployment().await;
        let app = api_router(deployment.clone());

        let (status, body) = send(
            &app,
            post_json(
                "/api/tasks",
                json!({ "workflow_type": "import_only", "context": { "file_content": EXPORT } }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let task_id = body["data"]["task_id"].as_str().expect("task id").to_string();
        assert_eq!(body["data"]["stream_url"], format!("/api/tasks/{task_id}/stream"));

        let mut task = Value::Null;
        for _ in 0..200 {
            let (_, body) = send(&app, get_request(&format!("/api/tasks/{task_id}"))).await;
            task = body["data"].clone();
            if task["status"] == "completed" || task["status"] == "failed" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(task["status"], "completed");
        assert_eq!(task["progress_percent"], 100);

        let (_, artifacts) =
            send(&app, get_request(&format!("/api/tasks/{task_id}/artifacts"))).await;
        assert_eq!(artifacts["data"].as_array().map(Vec::len), Some(1));

        let (status, latest) =
            send(&app, get_request(&format!("/api/tasks/{task_id}/artifacts/latest"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(latest["data"]["agent_type"], "import");

        let (_, rerun) = send(&app, post_json(&format!("/api/tasks/{task_id}/run"), json!({}))).await;
        assert_eq!(rerun["data"]["status"], "completed");

        let (_, events) = send(&app, get_request(&format!("/api/tasks/{task_id}/events"))).await;
        let events = events["data"].as_array().cloned().unwrap_or_default();
        assert_eq!(events.last().map(|e| e["event_type"].clone()), Some(json!("completed")));

        assert!(deployment.task_manager().get_task(task_id.parse().expect("uuid")).await.is_ok());
    }

    #[tokio::test]
    async fn finished_task_stream_replays_snapshot_and_terminal_event() {
        let deployment = deployment().await;
        let task = deployment
            .task_manager()
            .create_task("import_only", json!({ "file_content": EXPORT }))
            .await
            .expect("create");
        deployment.task_manager().run_task(task.id).await.expect("run");

        let app = api_router(deployment);
        let response = app
            .oneshot(get_request(&format!("/api/tasks/{}/stream", task.id)))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let text = String::from_utf8_lossy(&bytes);

        assert!(text.contains("event: status"));
        assert!(text.contains("event: completed"));
        assert!(text.contains("\"type\":\"completed\""));
    }

    #[tokio::test]
    async fn agents_and_workflows_are_listed() {
        let app = api_router(deployment().await);

        let (_, agents) = send(&app, get_request("/api/agents")).await;
        assert_eq!(agents["data"].as_array().map(Vec::len), Some(5));
        assert_eq!(agents["data"][0]["agent_type"], "import");

        let (status, agent) = send(&app, get_request("/api/agents/embedding")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(agent["data"]["output_artifact_type"], "embedding_batch");

        let (status, _) = send(&app, get_request("/api/agents/summarization")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, workflows) = send(&app, get_request("/api/workflows")).await;
        assert_eq!(workflows["data"].as_array().map(Vec::len), Some(3));
    }
}
