use async_trait::async_trait;
use futures::{StreamExt, stream};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
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
use crate::services::{config::EnrichmentAgentConfig, progress::ProgressReporter};

pub const ARTIFACT_TYPE: &str = "enrichment_report";
const MAX_PAGE_BYTES: usize = 256 * 1024;
const MAX_DESCRIPTION_CHARS: usize = 300;

static TITLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("title regex"));
static META_DESCRIPTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<meta\s+[^>]*name\s*=\s*["'](?:description|og:description)["'][^>]*content\s*=\s*["']([^"']*)["']"#)
        .expect("meta regex")
});
static HTML_LANG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<html\b[^>]*\blang\s*=\s*["']([a-zA-Z]{2,3})"#).expect("lang regex")
});

const STOPWORDS: &[(&str, &[&str])] = &[
    ("en", &["the", "and", "of", "to", "for", "with", "how", "what", "your", "is"]),
    ("es", &["el", "la", "los", "las", "de", "del", "para", "con", "y", "como"]),
    ("fr", &["le", "la", "les", "des", "du", "pour", "avec", "et", "est", "une"]),
    ("de", &["der", "die", "das", "und", "mit", "für", "ist", "ein", "eine", "wie"]),
    ("pt", &["o", "os", "as", "do", "da", "para", "com", "e", "como", "uma"]),
    ("it", &["il", "lo", "gli", "della", "per", "con", "e", "come", "una", "di"]),
];

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, TS)]
#[ts(export)]
pub struct EnrichmentReport {
    pub bookmarks: Vec<BookmarkRecord>,
    pub enriched: usize,
    pub pages_fetched: usize,
}

#[derive(Debug, Default, PartialEq)]
struct PageMetadata {
    title: Option<String>,
    description: Option<String>,
    language: Option<String>,
}

/// Fills in domain, missing titles, descriptions and language.
pub struct EnrichmentAgent {
    config: EnrichmentAgentConfig,
    client: Client,
}

impl EnrichmentAgent {
    pub fn new(config: EnrichmentAgentConfig, client: Client) -> Self {
        Self { config, client }
    }

    async fn fetch_metadata(client: &Client, url: &str) -> Option<PageMetadata> {
        let response = client.get(url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body = response.text().await.ok()?;
        let head = match body.char_indices().nth(MAX_PAGE_BYTES) {
            Some((idx, _)) => &body[..idx],
            None => body.as_str(),
        };
        Some(extract_metadata(head))
    }

    async fn enrich_batch(
        &self,
        batch: BookmarkBatch,
        reporter: &ProgressReporter,
    ) -> EnrichmentReport {
        let total = batch.bookmarks.len();
        let fetch = self.config.fetch_metadata;
        let client = &self.client;

        let mut results = stream::iter(batch.bookmarks)
            .map(|record| async move {
                let metadata = if fetch && is_http(&record.url) {
                    Self::fetch_metadata(client, record.url.trim()).await
                } else {
                    None
                };
                (record, metadata)
            })
            .buffered(self.config.concurrency.max(1));

        let mut bookmarks = Vec::with_capacity(total);
        let mut enriched = 0;
        let mut pages_fetched = 0;
        while let Some((record, metadata)) = results.next().await {
            if metadata.is_some() {
                pages_fetched += 1;
            }
            let updated = enrich_record(record.clone(), metadata);
            if updated != record {
                enriched += 1;
            }
            bookmarks.push(updated);
            if bookmarks.len() % 50 == 0 {
                reporter.items("Enriched bookmarks", bookmarks.len(), total).await;
            }
        }

        EnrichmentReport {
            bookmarks,
            enriched,
            pages_fetched,
        }
    }
}

fn is_http(url: &str) -> bool {
    let lower = url.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn extract_metadata(html: &str) -> PageMetadata {
    let capture = |re: &Regex| {
        re.captures(html)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|s| !s.is_empty())
    };
    PageMetadata {
        title: capture(&TITLE_RE),
        description: capture(&META_DESCRIPTION_RE),
        language: capture(&HTML_LANG_RE).map(|l| l.to_ascii_lowercase()),
    }
}

fn domain_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url.trim()).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some(host.strip_prefix("www.").map(String::from).unwrap_or(host))
}

/// Title derived from the last meaningful path segment, or the domain.
fn fallback_title(url: &str, domain: Option<&str>) -> String {
    let segment = Url::parse(url.trim()).ok().and_then(|parsed| {
        parsed
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last().map(String::from))
    });

    match segment {
        Some(seg) => {
            let stem = seg.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(&seg);
            let words: Vec<_> = stem
                .split(['-', '_', '+'])
                .filter(|w| !w.is_empty())
                .collect();
            if words.is_empty() {
                domain.unwrap_or(url).to_string()
            } else {
                words.join(" ")
            }
        }
        None => domain.unwrap_or(url).to_string(),
    }
}

/// Best-effort language guess from common function words.
pub fn detect_language(text: &str) -> Option<String> {
    let tokens: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect();

    STOPWORDS
        .iter()
        .map(|(lang, words)| {
            let hits = tokens.iter().filter(|t| words.contains(&t.as_str())).count();
            (*lang, hits)
        })
        .filter(|(_, hits)| *hits >= 2)
        .max_by_key(|(_, hits)| *hits)
        .map(|(lang, _)| lang.to_string())
}

fn enrich_record(mut record: BookmarkRecord, metadata: Option<PageMetadata>) -> BookmarkRecord {
    record.ensure_hash();
    if record.domain.is_none() {
        record.domain = domain_of(&record.url);
    }

    let metadata = metadata.unwrap_or_default();
    if record.title.trim().is_empty() {
        record.title = metadata
            .title
            .unwrap_or_else(|| fallback_title(&record.url, record.domain.as_deref()));
    }
    if record.description.is_none() {
        record.description = metadata
            .description
            .map(|d| d.chars().take(MAX_DESCRIPTION_CHARS).collect());
    }
    if record.language.is_none() {
        record.language = metadata.language.or_else(|| {
            let text = format!(
                "{} {}",
                record.title,
                record.description.as_deref().unwrap_or_default()
            );
            detect_language(&text)
        });
    }
    record
}

#[async_trait]
impl Agent for EnrichmentAgent {
    fn agent_type(&self) -> AgentType {
        AgentType::Enrichment
    }

    fn capability(&self) -> AgentCapability {
        AgentCapability {
            agent_type: AgentType::Enrichment,
            version: "1.0.0".to_string(),
            description: "Derives domain, title, description and language for each bookmark"
                .to_string(),
            input_schema: schema_value::<BookmarkBatch>(),
            output_schema: schema_value::<EnrichmentReport>(),
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
        let report = self.enrich_batch(batch, reporter).await;
        reporter
            .message(format!(
                "Enriched {} of {} bookmarks",
                report.enriched,
                report.bookmarks.len()
            ))
            .await;
        ArtifactDraft::from_output(ARTIFACT_TYPE, &report)
    }
}
