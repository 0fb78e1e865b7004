use std::collections::HashSet;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

use super::{
    Agent, AgentCapability, AgentError, AgentInput, AgentType, ArtifactDraft,
    parser::{self, ParseError},
    schema::{schema_value, validate_input},
    types::{BookmarkRecord, url_hash},
};
use crate::services::{config::ImportAgentConfig, progress::ProgressReporter};

pub const ARTIFACT_TYPE: &str = "bookmark_import_result";
const REPORT_EVERY: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ImportInput {
    /// Raw contents of the uploaded export file.
    pub file_content: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, TS)]
#[ts(export)]
pub struct SkippedEntry {
    pub url: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, TS)]
#[ts(export)]
pub struct ImportResult {
    pub bookmarks: Vec<BookmarkRecord>,
    pub format: String,
    pub total_parsed: usize,
    pub skipped: Vec<SkippedEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

/// Parses a browser export into bookmark records.
pub struct ImportAgent {
    config: ImportAgentConfig,
}

impl ImportAgent {
    pub fn new(config: ImportAgentConfig) -> Self {
        Self { config }
    }

    fn import(&self, input: &ImportInput) -> Result<ImportResult, AgentError> {
        let export = parser::parse(&input.file_content).map_err(|e| match e {
            ParseError::UnknownFormat => AgentError::Processing(format!(
                "unrecognized bookmark export format{}",
                input
                    .file_name
                    .as_deref()
                    .map(|n| format!(" in '{n}'"))
                    .unwrap_or_default()
            )),
            other => AgentError::Processing(other.to_string()),
        })?;

        let total_parsed = export.bookmarks.len();
        if total_parsed > self.config.max_bookmarks {
            return Err(AgentError::Processing(format!(
                "export contains {total_parsed} bookmarks, the limit is {}",
                self.config.max_bookmarks
            )));
        }

        let mut seen = HashSet::new();
        let mut bookmarks = Vec::with_capacity(total_parsed);
        let mut skipped = Vec::new();

        for parsed in export.bookmarks {
            if let Err(e) = url::Url::parse(&parsed.url) {
                skipped.push(SkippedEntry {
                    url: parsed.url,
                    reason: format!("invalid url: {e}"),
                });
                continue;
            }
            let hash = url_hash(&parsed.url);
            if !seen.insert(hash.clone()) {
                skipped.push(SkippedEntry {
                    url: parsed.url,
                    reason: "duplicate of an earlier entry".to_string(),
                });
                continue;
            }

            bookmarks.push(BookmarkRecord {
                url_hash: hash,
                description: parsed.description,
                tags: parsed.tags,
                folder_path: parsed.folder_path,
                add_date: parsed.add_date,
                icon: parsed.icon,
                ..BookmarkRecord::new(parsed.url, parsed.title)
            });
        }

        if bookmarks.is_empty() {
            return Err(AgentError::Processing(format!(
                "no importable bookmarks found ({} skipped)",
                skipped.len()
            )));
        }

        Ok(ImportResult {
            bookmarks,
            format: export.format.to_string(),
            total_parsed,
            skipped,
            file_name: input.file_name.clone(),
        })
    }
}

#[async_trait]
impl Agent for ImportAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::Import
    }

    fn capability(&self) -> AgentCapability {
        AgentCapability {
            agent_type: AgentType::Import,
            version: "1.0.0".to_string(),
            description: "Parses Netscape HTML and JSON bookmark exports".to_string(),
            input_schema: schema_value::<ImportInput>(),
            output_schema: schema_value::<ImportResult>(),
            output_artifact_type: ARTIFACT_TYPE.to_string(),
        }
    }

    fn validate(&self, input: &Value) -> Result<(), AgentError> {
        validate_input::<ImportInput>(input).map(|_| ())
    }

    async fn process(
        &self,
        input: AgentInput,
        reporter: &ProgressReporter,
    ) -> Result<ArtifactDraft, AgentError> {
        let import_input = validate_input::<ImportInput>(&input.payload)?;
        tracing::debug!(
            "[AGENT:import] Parsing {} bytes for task {}",
            import_input.file_content.len(),
            input.task_id
        );

        let result = self.import(&import_input)?;

        for done in (REPORT_EVERY..result.bookmarks.len()).step_by(REPORT_EVERY) {
            reporter
                .items("Imported bookmarks", done, result.bookmarks.len())
                .await;
        }
        reporter
            .message(format!(
                "Imported {} bookmarks from {} export ({} skipped)",
                result.bookmarks.len(),
                result.format,
                result.skipped.len()
            ))
            .await;

        ArtifactDraft::from_output(ARTIFACT_TYPE, &result)
    }
}
