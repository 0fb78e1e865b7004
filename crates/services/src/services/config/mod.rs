use std::path::PathBuf;

use thiserror::Error;

pub mod versions;

pub use versions::v1::{
    AgentsConfig, Config, EmbeddingAgentConfig, EngineConfig, EnrichmentAgentConfig,
    ImportAgentConfig, RecoveryPolicy, ValidationAgentConfig, WorkflowConfig,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("Invalid value for {name}: '{value}'")]
    InvalidEnv { name: &'static str, value: String },
}

/// Loads `config.json`, falling back to defaults when the file is missing
/// or unreadable.
pub async fn load_config_from_file(config_path: &PathBuf) -> Config {
    match tokio::fs::read_to_string(config_path).await {
        Ok(raw_config) => Config::from(raw_config),
        Err(_) => {
            tracing::info!("No config file found, creating one");
            Config::default()
        }
    }
}

pub async fn save_config_to_file(config: &Config, config_path: &PathBuf) -> Result<(), ConfigError> {
    let raw_config = serde_json::to_string_pretty(config)?;
    tokio::fs::write(config_path, raw_config).await?;
    Ok(())
}

impl Config {
    /// Applies `A2A_*` environment overrides on top of the file config.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        if let Some(value) = lookup("A2A_RECOVERY_POLICY") {
            self.engine.recovery_policy = match value.trim().to_ascii_lowercase().as_str() {
                "resume" => RecoveryPolicy::Resume,
                "fail" => RecoveryPolicy::Fail,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        name: "A2A_RECOVERY_POLICY",
                        value,
                    });
                }
            };
        }
        if let Some(value) = lookup("A2A_MAX_CONCURRENT_TASKS") {
            self.engine.max_concurrent_tasks = match value.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        name: "A2A_MAX_CONCURRENT_TASKS",
                        value,
                    });
                }
            };
        }
        if let Some(value) = lookup("A2A_CHECK_LIVENESS") {
            self.agents.validation.check_liveness =
                parse_flag(&value).ok_or(ConfigError::InvalidEnv {
                    name: "A2A_CHECK_LIVENESS",
                    value: value.clone(),
                })?;
        }
        if let Some(value) = lookup("A2A_FETCH_METADATA") {
            self.agents.enrichment.fetch_metadata =
                parse_flag(&value).ok_or(ConfigError::InvalidEnv {
                    name: "A2A_FETCH_METADATA",
                    value: value.clone(),
                })?;
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
