use serde::{Deserialize, Serialize};
use ts_rs::TS;

fn default_true() -> bool {
    true
}

fn default_max_concurrent_tasks() -> usize {
    4
}

fn default_broadcast_capacity() -> usize {
    256
}

fn default_replay_buffer_size() -> usize {
    128
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_validation_concurrency() -> usize {
    10
}

fn default_enrichment_concurrency() -> usize {
    8
}

fn default_max_bookmarks() -> usize {
    50_000
}

fn default_embedding_dimensions() -> usize {
    256
}

/// What to do with tasks found `running` when the process starts.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// Continue from the last committed step.
    #[default]
    Resume,
    /// Mark the task failed with `process_restart`.
    Fail,
}

#[derive(Clone, Debug, Serialize, Deserialize, TS)]
pub struct EngineConfig {
    #[serde(default)]
    pub recovery_policy: RecoveryPolicy,
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Upper bound for a single agent step. `None` disables the limit.
    #[serde(default)]
    pub step_timeout_secs: Option<u64>,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default = "default_replay_buffer_size")]
    pub replay_buffer_size: usize,
    /// Hand the final bookmark list to storage before completing a task.
    #[serde(default = "default_true")]
    pub handoff_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            recovery_policy: RecoveryPolicy::default(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            step_timeout_secs: None,
            broadcast_capacity: default_broadcast_capacity(),
            replay_buffer_size: default_replay_buffer_size(),
            handoff_enabled: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, TS)]
pub struct ImportAgentConfig {
    #[serde(default = "default_max_bookmarks")]
    pub max_bookmarks: usize,
}

impl Default for ImportAgentConfig {
    fn default() -> Self {
        Self {
            max_bookmarks: default_max_bookmarks(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, TS)]
pub struct ValidationAgentConfig {
    /// Probe each http(s) URL over the network.
    #[serde(default)]
    pub check_liveness: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_validation_concurrency")]
    pub concurrency: usize,
}

impl Default for ValidationAgentConfig {
    fn default() -> Self {
        Self {
            check_liveness: false,
            request_timeout_secs: default_request_timeout_secs(),
            concurrency: default_validation_concurrency(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, TS)]
pub struct EnrichmentAgentConfig {
    /// Fetch each page to read its title, description and language.
    #[serde(default)]
    pub fetch_metadata: bool,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_enrichment_concurrency")]
    pub concurrency: usize,
}

impl Default for EnrichmentAgentConfig {
    fn default() -> Self {
        Self {
            fetch_metadata: false,
            request_timeout_secs: default_request_timeout_secs(),
            concurrency: default_enrichment_concurrency(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, TS)]
pub struct EmbeddingAgentConfig {
    #[serde(default = "default_embedding_dimensions")]
    pub dimensions: usize,
}

impl Default for EmbeddingAgentConfig {
    fn default() -> Self {
        Self {
            dimensions: default_embedding_dimensions(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, TS)]
pub struct AgentsConfig {
    #[serde(default)]
    pub import: ImportAgentConfig,
    #[serde(default)]
    pub validation: ValidationAgentConfig,
    #[serde(default)]
    pub enrichment: EnrichmentAgentConfig,
    #[serde(default)]
    pub embedding: EmbeddingAgentConfig,
}

/// Additional workflow declared in `config.json`.
#[derive(Clone, Debug, Serialize, Deserialize, TS)]
pub struct WorkflowConfig {
    pub workflow_type: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub agents: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, TS)]
pub struct Config {
    pub config_version: String,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub workflows: Vec<WorkflowConfig>,
}

impl From<String> for Config {
    fn from(raw_config: String) -> Self {
        match serde_json::from_str::<Config>(&raw_config) {
            Ok(config) if config.config_version == "v1" => config,
            Ok(config) => {
                tracing::warn!(
                    "Unknown config version '{}', using defaults",
                    config.config_version
                );
                Self::default()
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to parse config at line {}, column {}: {}, using defaults",
                    e.line(),
                    e.column(),
                    e
                );
                Self::default()
            }
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: "v1".to_string(),
            engine: EngineConfig::default(),
            agents: AgentsConfig::default(),
            workflows: Vec::new(),
        }
    }
}
