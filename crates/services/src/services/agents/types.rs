use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ts_rs::TS;

/// Bookmark as it flows between pipeline agents. Every agent reads and
/// writes a `bookmarks` list of these, adding the fields it owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, TS)]
#[ts(export)]
pub struct BookmarkRecord {
    pub url: String,
    #[serde(default)]
    pub title: String,
    /// Hex SHA-256 of the normalized URL.
    #[serde(default)]
    pub url_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub folder_path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl BookmarkRecord {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            url_hash: url_hash(&url),
            url,
            title: title.into(),
            description: None,
            tags: Vec::new(),
            folder_path: Vec::new(),
            add_date: None,
            icon: None,
            redirect_url: None,
            domain: None,
            language: None,
            categories: Vec::new(),
            embedding: None,
        }
    }

    /// Fills `url_hash` when an upstream producer left it empty.
    pub fn ensure_hash(&mut self) {
        if self.url_hash.is_empty() {
            self.url_hash = url_hash(&self.url);
        }
    }
}

/// Input/output shape shared by the agents after `import`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, TS)]
#[ts(export)]
pub struct BookmarkBatch {
    pub bookmarks: Vec<BookmarkRecord>,
}

/// Hex SHA-256 of the URL with surrounding whitespace and a trailing slash
/// on the bare origin removed.
pub fn url_hash(url: &str) -> String {
    let trimmed = url.trim();
    let normalized = match trimmed.strip_suffix('/') {
        Some(stripped) if stripped.matches('/').count() == 2 => stripped,
        _ => trimmed,
    };
    hex::encode(Sha256::digest(normalized.as_bytes()))
}
