use serde_json::json;
use sqlx::SqlitePool;

use super::task::{CreateTask, Task};
use crate::DBService;

pub(crate) async fn setup_test_pool() -> SqlitePool {
    DBService::new_in_memory()
        .await
        .expect("failed to open sqlite memory db")
        .pool
}

pub(crate) async fn insert_task(pool: &SqlitePool, agents: &[&str]) -> Task {
    Task::create(
        pool,
        &CreateTask {
            workflow_type: "test_workflow".to_string(),
            workflow_agents: agents.iter().map(|a| a.to_string()).collect(),
            context: json!({ "file_content": "<DL></DL>" }),
        },
    )
    .await
    .expect("failed to create task")
}
