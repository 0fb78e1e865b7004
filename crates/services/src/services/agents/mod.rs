//! Agent contract: the capability every pipeline stage declares and the
//! trait the task manager drives.

use async_trait::async_trait;
use db::models::task::TaskErrorKind;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};
use thiserror::Error;
use ts_rs::TS;
use uuid::Uuid;

use crate::services::progress::ProgressReporter;

pub mod categorization;
pub mod embedding;
pub mod enrichment;
pub mod import;
pub mod parser;
pub mod schema;
pub mod types;
pub mod validation;

/// Closed set of agent types. Declaration order is pipeline order.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    JsonSchema,
    TS,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[ts(export)]
pub enum AgentType {
    Import,
    Validation,
    Enrichment,
    Categorization,
    Embedding,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct AgentCapability {
    pub agent_type: AgentType,
    pub version: String,
    pub description: String,
    /// JSON Schema of the accepted input.
    pub input_schema: Value,
    /// JSON Schema of the produced artifact data.
    pub output_schema: Value,
    pub output_artifact_type: String,
}

#[derive(Debug, Clone)]
pub struct AgentInput {
    pub task_id: Uuid,
    /// Context the task was created with.
    pub context: Value,
    /// Task context for the first step, otherwise the previous artifact's data.
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct ArtifactDraft {
    pub artifact_type: String,
    pub data: Value,
}

impl ArtifactDraft {
    pub fn from_output<T: Serialize>(
        artifact_type: impl Into<String>,
        output: &T,
    ) -> Result<Self, AgentError> {
        Ok(Self {
            artifact_type: artifact_type.into(),
            data: serde_json::to_value(output)?,
        })
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("input does not match the declared schema: {}", .0.join("; "))]
    SchemaViolation(Vec<String>),
    #[error("{0}")]
    Processing(String),
    #[error("failed to encode agent output: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AgentError {
    pub fn kind(&self) -> TaskErrorKind {
        match self {
            AgentError::SchemaViolation(_) => TaskErrorKind::SchemaViolation,
            AgentError::Processing(_) | AgentError::Serialization(_) => {
                TaskErrorKind::AgentProcessingError
            }
        }
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn agent_type(&self) -> AgentType;

    fn capability(&self) -> AgentCapability;

    /// Checks `input` against the declared input schema.
    fn validate(&self, input: &Value) -> Result<(), AgentError> {
        let problems = schema::violations(&self.capability().input_schema, input);
        if problems.is_empty() {
            Ok(())
        } else {
            Err(AgentError::SchemaViolation(problems))
        }
    }

    /// Produces exactly one artifact from `input`. Progress messages go
    /// through `reporter`; they never advance the task.
    async fn process(
        &self,
        input: AgentInput,
        reporter: &ProgressReporter,
    ) -> Result<ArtifactDraft, AgentError>;
}
