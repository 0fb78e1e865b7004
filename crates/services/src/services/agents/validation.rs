use std::collections::HashSet;

use async_trait::async_trait;
use futures::{StreamExt, stream};
use reqwest::{Client, StatusCode};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;
use url::Url;

use super::{
    Agent, AgentCapability, AgentError, AgentInput, AgentType, ArtifactDraft,
    schema::{schema_value, validate_input},
    types::{BookmarkBatch, BookmarkRecord},
};
use crate::services::{config::ValidationAgentConfig, progress::ProgressReporter};

pub const ARTIFACT_TYPE: &str = "validation_report";
const REPORT_EVERY: usize = 25;

/// Schemes browsers use for internal pages. They cannot be probed and are
/// kept as-is.
const INTERNAL_SCHEMES: &[&str] = &[
    "about",
    "chrome",
    "chrome-extension",
    "edge",
    "file",
    "moz-extension",
    "place",
];

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, TS)]
#[ts(export)]
pub struct RejectedBookmark {
    pub url: String,
    pub title: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, TS)]
#[ts(export)]
pub struct ValidationReport {
    /// Bookmarks that passed, in input order.
    pub bookmarks: Vec<BookmarkRecord>,
    pub rejected: Vec<RejectedBookmark>,
    pub checked: usize,
    pub liveness_checked: bool,
}

#[derive(Debug, PartialEq)]
enum UrlClass {
    Remote,
    Internal,
}

/// Result of probing a single URL over HTTP.
#[derive(Debug)]
struct Liveness {
    status: Option<u16>,
    final_url: Option<String>,
    error: Option<String>,
}

/// Rejects malformed, unsupported and duplicate URLs and, when enabled,
/// URLs that do not answer with a non-error status.
pub struct ValidationAgent {
    config: ValidationAgentConfig,
    client: Client,
}

impl ValidationAgent {
    pub fn new(config: ValidationAgentConfig, client: Client) -> Self {
        Self { config, client }
    }

    fn classify(url: &str) -> Result<UrlClass, String> {
        let parsed = Url::parse(url.trim()).map_err(|e| format!("invalid url: {e}"))?;
        match parsed.scheme() {
            "http" | "https" => match parsed.host_str() {
                Some(host) if !host.is_empty() => Ok(UrlClass::Remote),
                _ => Err("url has no host".to_string()),
            },
            scheme if INTERNAL_SCHEMES.contains(&scheme) => Ok(UrlClass::Internal),
            scheme => Err(format!("unsupported url scheme '{scheme}'")),
        }
    }

    async fn probe(client: &Client, url: &str) -> Liveness {
        let head = client.head(url).send().await;
        let response = match head {
            Ok(resp)
                if resp.status() != StatusCode::METHOD_NOT_ALLOWED
                    && resp.status() != StatusCode::NOT_IMPLEMENTED =>
            {
                Ok(resp)
            }
            _ => client.get(url).send().await,
        };

        match response {
            Ok(resp) => {
                let status = resp.status();
                let final_url = resp.url().as_str();
                Liveness {
                    status: Some(status.as_u16()),
                    final_url: (final_url != url).then(|| final_url.to_string()),
                    error: (status.as_u16() >= 400).then(|| format!("HTTP {}", status.as_u16())),
                }
            }
            Err(e) => Liveness {
                status: None,
                final_url: None,
                error: Some(if e.is_timeout() {
                    "Request timed out".to_string()
                } else if e.is_connect() {
                    "Connection failed - site unreachable".to_string()
                } else if e.is_redirect() {
                    "Too many redirects".to_string()
                } else {
                    format!("Request failed: {e}")
                }),
            },
        }
    }

    async fn validate_batch(
        &self,
        batch: BookmarkBatch,
        reporter: &ProgressReporter,
    ) -> ValidationReport {
        let checked = batch.bookmarks.len();
        let mut seen = HashSet::new();
        let mut rejected = Vec::new();
        let mut candidates = Vec::new();

        for mut record in batch.bookmarks {
            record.ensure_hash();
            match Self::classify(&record.url) {
                Err(reason) => rejected.push(reject(&record, reason, None)),
                Ok(_) if !seen.insert(record.url_hash.clone()) => {
                    rejected.push(reject(&record, "duplicate url".to_string(), None))
                }
                Ok(class) => candidates.push((record, class)),
            }
        }

        if !self.config.check_liveness {
            return ValidationReport {
                bookmarks: candidates.into_iter().map(|(r, _)| r).collect(),
                rejected,
                checked,
                liveness_checked: false,
            };
        }

        let total = candidates.len();
        let client = &self.client;
        let mut probes = stream::iter(candidates)
            .map(|(record, class)| async move {
                let liveness = match class {
                    UrlClass::Remote => Some(Self::probe(client, record.url.trim()).await),
                    UrlClass::Internal => None,
                };
                (record, liveness)
            })
            .buffered(self.config.concurrency.max(1));

        let mut bookmarks = Vec::with_capacity(total);
        let mut done = 0;
        while let Some((mut record, liveness)) = probes.next().await {
            done += 1;
            match liveness {
                Some(Liveness {
                    error: Some(reason),
                    status,
                    ..
                }) => rejected.push(reject(&record, reason, status)),
                Some(Liveness { final_url, .. }) => {
                    record.redirect_url = final_url;
                    bookmarks.push(record);
                }
                None => bookmarks.push(record),
            }
            if done % REPORT_EVERY == 0 {
                reporter.items("Checked bookmarks", done, total).await;
            }
        }

        ValidationReport {
            bookmarks,
            rejected,
            checked,
            liveness_checked: true,
        }
    }
}

fn reject(record: &BookmarkRecord, reason: String, status_code: Option<u16>) -> RejectedBookmark {
    RejectedBookmark {
        url: record.url.clone(),
        title: record.title.clone(),
        reason,
        status_code,
    }
}

#[async_trait]
impl Agent for ValidationAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::Validation
    }

    fn capability(&self) -> AgentCapability {
        AgentCapability {
            agent_type: AgentType::Validation,
            version: "1.0.0".to_string(),
            description: "Rejects malformed, duplicate and (optionally) unreachable URLs"
                .to_string(),
            input_schema: schema_value::<BookmarkBatch>(),
            output_schema: schema_value::<ValidationReport>(),
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
        let report = self.validate_batch(batch, reporter).await;

        tracing::debug!(
            "[AGENT:validation] Task {}: {} valid, {} rejected",
            input.task_id,
            report.bookmarks.len(),
            report.rejected.len()
        );
        reporter
            .message(format!(
                "Validated {} bookmarks: {} valid, {} rejected",
                report.checked,
                report.bookmarks.len(),
                report.rejected.len()
            ))
            .await;

        ArtifactDraft::from_output(ARTIFACT_TYPE, &report)
    }
}
