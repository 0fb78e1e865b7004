use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, FromRow, Sqlite, SqlitePool, types::Json};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ImportedBookmarkError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Bookmark handed off to storage at the end of a completed task.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ImportedBookmark {
    pub id: Uuid,
    pub user_id: String,
    pub task_id: Uuid,
    pub url: String,
    pub url_hash: String,
    pub title: String,
    pub description: Option<String>,
    pub domain: Option<String>,
    pub language: Option<String>,
    #[sqlx(json)]
    pub folder_path: Vec<String>,
    #[sqlx(json)]
    pub tags: Vec<String>,
    #[sqlx(json)]
    pub categories: Vec<String>,
    #[sqlx(json)]
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UpsertImportedBookmark {
    pub user_id: String,
    pub task_id: Uuid,
    pub url: String,
    pub url_hash: String,
    pub title: String,
    pub description: Option<String>,
    pub domain: Option<String>,
    pub language: Option<String>,
    pub folder_path: Vec<String>,
    pub tags: Vec<String>,
    pub categories: Vec<String>,
    pub embedding: Vec<f32>,
}

impl ImportedBookmark {
    /// Inserts or refreshes the bookmark keyed by `(user_id, url_hash)`.
    pub async fn upsert<'e, E>(
        executor: E,
        data: &UpsertImportedBookmark,
    ) -> Result<Self, ImportedBookmarkError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let bookmark = sqlx::query_as::<_, ImportedBookmark>(
            r#"
            INSERT INTO imported_bookmarks (
                id, user_id, task_id, url, url_hash, title, description, domain, language,
                folder_path, tags, categories, embedding
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT (user_id, url_hash) DO UPDATE SET
                task_id = excluded.task_id,
                url = excluded.url,
                title = excluded.title,
                description = COALESCE(excluded.description, imported_bookmarks.description),
                domain = COALESCE(excluded.domain, imported_bookmarks.domain),
                language = COALESCE(excluded.language, imported_bookmarks.language),
                folder_path = excluded.folder_path,
                tags = excluded.tags,
                categories = excluded.categories,
                embedding = excluded.embedding,
                updated_at = datetime('now', 'subsec')
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&data.user_id)
        .bind(data.task_id)
        .bind(&data.url)
        .bind(&data.url_hash)
        .bind(&data.title)
        .bind(&data.description)
        .bind(&data.domain)
        .bind(&data.language)
        .bind(Json(&data.folder_path))
        .bind(Json(&data.tags))
        .bind(Json(&data.categories))
        .bind(Json(&data.embedding))
        .fetch_one(executor)
        .await?;
        Ok(bookmark)
    }

    pub async fn find_by_user(
        pool: &SqlitePool,
        user_id: &str,
    ) -> Result<Vec<Self>, ImportedBookmarkError> {
        let bookmarks = sqlx::query_as::<_, ImportedBookmark>(
            "SELECT * FROM imported_bookmarks WHERE user_id = ?1 ORDER BY created_at ASC, url ASC",
        )
        .bind(user_id)
        .fetch_all(pool)
        .await?;
        Ok(bookmarks)
    }

    pub async fn count_by_task(
        pool: &SqlitePool,
        task_id: Uuid,
    ) -> Result<i64, ImportedBookmarkError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM imported_bookmarks WHERE task_id = ?1")
                .bind(task_id)
                .fetch_one(pool)
                .await?;
        Ok(count)
    }
}
