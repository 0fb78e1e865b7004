//! Handoff of a finished task's bookmarks to bookmark storage.

use async_trait::async_trait;
use db::{
    DBService,
    models::{
        artifact::Artifact,
        imported_bookmark::{ImportedBookmark, ImportedBookmarkError, UpsertImportedBookmark},
        task::Task,
    },
};
use serde::Deserialize;
use thiserror::Error;

use crate::services::agents::types::BookmarkRecord;

pub const ANONYMOUS_USER: &str = "anonymous";

#[derive(Debug, Error)]
pub enum BookmarkSinkError {
    #[error("Artifact {0} has no bookmark list")]
    MissingBookmarks(String),
    #[error(transparent)]
    Bookmark(#[from] ImportedBookmarkError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait BookmarkSink: Send + Sync {
    /// Stores the bookmarks carried by a task's terminal artifact and
    /// returns how many were written. Must be idempotent per bookmark.
    async fn reconcile(&self, task: &Task, artifact: &Artifact) -> Result<usize, BookmarkSinkError>;
}

#[derive(Deserialize)]
struct BookmarkList {
    bookmarks: Vec<BookmarkRecord>,
}

/// Upserts into `imported_bookmarks`, keyed by `(user_id, url_hash)`.
#[derive(Clone)]
pub struct SqliteBookmarkSink {
    db: DBService,
}

impl SqliteBookmarkSink {
    pub fn new(db: DBService) -> Self {
        Self { db }
    }
}

fn owner_of(task: &Task) -> String {
    task.context
        .get("user_id")
        .and_then(|v| match v {
            serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| ANONYMOUS_USER.to_string())
}

#[async_trait]
impl BookmarkSink for SqliteBookmarkSink {
    async fn reconcile(&self, task: &Task, artifact: &Artifact) -> Result<usize, BookmarkSinkError> {
        let list: BookmarkList = serde_json::from_value(artifact.data.clone())
            .map_err(|_| BookmarkSinkError::MissingBookmarks(artifact.artifact_type.clone()))?;
        let user_id = owner_of(task);

        let mut tx = self.db.pool.begin().await?;
        for mut record in list.bookmarks {
            record.ensure_hash();
            ImportedBookmark::upsert(
                &mut *tx,
                &UpsertImportedBookmark {
                    user_id: user_id.clone(),
                    task_id: task.id,
                    url: record.url,
                    url_hash: record.url_hash,
                    title: record.title,
                    description: record.description,
                    domain: record.domain,
                    language: record.language,
                    folder_path: record.folder_path,
                    tags: record.tags,
                    categories: record.categories,
                    embedding: record.embedding.unwrap_or_default(),
                },
            )
            .await?;
        }
        tx.commit().await?;

        let stored = ImportedBookmark::count_by_task(&self.db.pool, task.id).await?;
        tracing::info!(
            "[HANDOFF] Task {}: {} bookmarks stored for user '{}'",
            task.id,
            stored,
            user_id
        );
        Ok(stored as usize)
    }
}

#[cfg(test)]
mod tests {
    use db::models::{
        artifact::CreateArtifact,
        task::CreateTask,
    };
    use serde_json::json;

    use super::*;

    async fn setup(context: serde_json::Value) -> (DBService, Task) {
        let db = DBService::new_in_memory().await.expect("db");
        let task = Task::create(
            &db.pool,
            &CreateTask {
                workflow_type: "import_only".to_string(),
                workflow_agents: vec!["import".to_string()],
                context,
            },
        )
        .await
        .expect("task");
        (db, task)
    }

    async fn artifact(db: &DBService, task: &Task, data: serde_json::Value) -> Artifact {
        Artifact::create(
            &db.pool,
            &CreateArtifact {
                task_id: task.id,
                agent_type: "import".to_string(),
                step_index: 0,
                artifact_type: "bookmark_import_result".to_string(),
                data,
            },
        )
        .await
        .expect("artifact")
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let (db, task) = setup(json!({ "user_id": "u-42" })).await;
        let artifact = artifact(
            &db,
            &task,
            json!({ "bookmarks": [
                { "url": "https://rust-lang.org", "title": "Rust", "tags": ["lang"] },
                { "url": "https://docs.rs", "title": "Docs" }
            ]}),
        )
        .await;

        let sink = SqliteBookmarkSink::new(db.clone());
        assert_eq!(sink.reconcile(&task, &artifact).await.expect("first"), 2);
        assert_eq!(sink.reconcile(&task, &artifact).await.expect("second"), 2);

        let stored = ImportedBookmark::find_by_user(&db.pool, "u-42").await.expect("find");
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().any(|b| b.tags == vec!["lang"]));
    }

    #[tokio::test]
    async fn missing_owner_falls_back_to_anonymous() {
        let (db, task) = setup(json!({})).await;
        let artifact = artifact(
            &db,
            &task,
            json!({ "bookmarks": [{ "url": "https://example.com", "title": "Example" }] }),
        )
        .await;

        SqliteBookmarkSink::new(db.clone())
            .reconcile(&task, &artifact)
            .await
            .expect("reconcile");
        let stored = ImportedBookmark::find_by_user(&db.pool, ANONYMOUS_USER)
            .await
            .expect("find");
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn artifacts_without_bookmarks_are_rejected() {
        let (db, task) = setup(json!({})).await;
        let artifact = artifact(&db, &task, json!({ "summary": "nothing here" })).await;

        let err = SqliteBookmarkSink::new(db)
            .reconcile(&task, &artifact)
            .await
            .expect_err("no bookmarks");
        assert!(matches!(err, BookmarkSinkError::MissingBookmarks(_)));
    }
}
