use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use ts_rs::TS;
use url::Url;

use super::{
    Agent, AgentCapability, AgentError, AgentInput, AgentType, ArtifactDraft,
    schema::{schema_value, validate_input},
    types::{BookmarkBatch, BookmarkRecord},
};
use crate::services::{config::EmbeddingAgentConfig, progress::ProgressReporter};

pub const ARTIFACT_TYPE: &str = "embedding_batch";
pub const MODEL: &str = "hashed-bow-v1";
const TITLE_WEIGHT: f32 = 2.0;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, TS)]
#[ts(export)]
pub struct EmbeddingBatch {
    pub bookmarks: Vec<BookmarkRecord>,
    pub model: String,
    pub dimensions: usize,
}

/// Deterministic feature-hashed bag-of-words vectors. Identical text always
/// yields the identical vector, so re-running a task is reproducible.
pub struct EmbeddingAgent {
    dimensions: usize,
}

impl EmbeddingAgent {
    pub fn new(config: EmbeddingAgentConfig) -> Self {
        Self {
            dimensions: config.dimensions.max(1),
        }
    }

    pub fn embed(&self, record: &BookmarkRecord) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];

        let mut add = |text: &str, weight: f32| {
            for token in text
                .split(|c: char| !c.is_alphanumeric())
                .filter(|t| t.chars().count() > 1)
            {
                let digest = Sha256::digest(token.to_lowercase().as_bytes());
                let mut bucket = [0u8; 8];
                bucket.copy_from_slice(&digest[..8]);
                let index = (u64::from_be_bytes(bucket) % self.dimensions as u64) as usize;
                let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
                vector[index] += sign * weight;
            }
        };

        add(&record.title, TITLE_WEIGHT);
        if let Some(description) = &record.description {
            add(description, 1.0);
        }
        if let Ok(parsed) = Url::parse(record.url.trim()) {
            add(parsed.host_str().unwrap_or_default(), 1.0);
            add(parsed.path(), 1.0);
        }
        for label in record.tags.iter().chain(record.categories.iter()) {
            add(label, 1.0);
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

#[async_trait]
impl Agent for EmbeddingAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::Embedding
    }

    fn capability(&self) -> AgentCapability {
        AgentCapability {
            agent_type: AgentType::Embedding,
            version: "1.0.0".to_string(),
            description: format!(
                "Computes {}-dimensional hashed bag-of-words vectors",
                self.dimensions
            ),
            input_schema: schema_value::<BookmarkBatch>(),
            output_schema: schema_value::<EmbeddingBatch>(),
            output_artifact_type: ARTIFACT_TYPE.to_string(),
        }
    }

    fn validate(&self, input: &Value) -> Result<(), AgentError> {
        validate_input::<BookmarkBatch>(input).map(|_| ())
    }

    async fn process(
        &self,
        input: AgentInput,
        reporter: &ProgressReporter,
    ) -> Result<ArtifactDraft, AgentError> {
        let batch = validate_input::<BookmarkBatch>(&input.payload)?;
        let total = batch.bookmarks.len();

        let mut bookmarks = Vec::with_capacity(total);
        for (idx, mut record) in batch.bookmarks.into_iter().enumerate() {
            record.ensure_hash();
            record.embedding = Some(self.embed(&record));
            bookmarks.push(record);
            if (idx + 1) % 500 == 0 {
                reporter.items("Embedded bookmarks", idx + 1, total).await;
            }
        }

        reporter
            .message(format!("Generated {total} embeddings with {MODEL}"))
            .await;

        ArtifactDraft::from_output(
            ARTIFACT_TYPE,
            &EmbeddingBatch {
                bookmarks,
                model: MODEL.to_string(),
                dimensions: self.dimensions,
            },
        )
    }
}
