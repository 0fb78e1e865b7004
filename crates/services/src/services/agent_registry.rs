//! Agent Registry
//!
//! Built once at startup and shared read-only afterwards. Holds one agent
//! per [`AgentType`] together with the capability it declared when it was
//! registered.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use reqwest::Client;
use thiserror::Error;

use crate::services::{
    agents::{
        Agent, AgentCapability, AgentType, categorization::CategorizationAgent,
        embedding::EmbeddingAgent, enrichment::EnrichmentAgent, import::ImportAgent,
        validation::ValidationAgent,
    },
    config::AgentsConfig,
};

const USER_AGENT: &str = concat!("a2a-bookmark-orchestrator/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Agent '{0}' is already registered")]
    DuplicateAgent(AgentType),
    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

#[derive(Clone)]
pub struct RegisteredAgent {
    pub agent: Arc<dyn Agent>,
    pub capability: AgentCapability,
}

pub struct AgentRegistry {
    agents: BTreeMap<AgentType, RegisteredAgent>,
}

#[derive(Default)]
pub struct AgentRegistryBuilder {
    agents: BTreeMap<AgentType, RegisteredAgent>,
}

impl AgentRegistryBuilder {
    pub fn register(mut self, agent: Arc<dyn Agent>) -> Result<Self, RegistryError> {
        let agent_type = agent.agent_type();
        if self.agents.contains_key(&agent_type) {
            return Err(RegistryError::DuplicateAgent(agent_type));
        }
        let capability = agent.capability();
        tracing::debug!(
            "[REGISTRY] Registered {} v{} -> {}",
            agent_type,
            capability.version,
            capability.output_artifact_type
        );
        self.agents
            .insert(agent_type, RegisteredAgent { agent, capability });
        Ok(self)
    }

    pub fn build(self) -> AgentRegistry {
        AgentRegistry {
            agents: self.agents,
        }
    }
}

fn http_client(timeout_secs: u64) -> Result<Client, RegistryError> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .user_agent(USER_AGENT)
        .build()?)
}

impl AgentRegistry {
    pub fn builder() -> AgentRegistryBuilder {
        AgentRegistryBuilder::default()
    }

    /// Registry with the five built-in agents.
    pub fn from_config(config: &AgentsConfig) -> Result<Self, RegistryError> {
        let registry = Self::builder()
            .register(Arc::new(ImportAgent::new(config.import.clone())))?
            .register(Arc::new(ValidationAgent::new(
                config.validation.clone(),
                http_client(config.validation.request_timeout_secs)?,
            )))?
            .register(Arc::new(EnrichmentAgent::new(
                config.enrichment.clone(),
                http_client(config.enrichment.request_timeout_secs)?,
            )))?
            .register(Arc::new(CategorizationAgent::new()))?
            .register(Arc::new(EmbeddingAgent::new(config.embedding.clone())))?
            .build();

        tracing::info!(
            "[REGISTRY] {} agents registered (liveness checks {}, metadata fetch {})",
            registry.len(),
            if config.validation.check_liveness { "on" } else { "off" },
            if config.enrichment.fetch_metadata { "on" } else { "off" },
        );
        Ok(registry)
    }

    pub fn get(&self, agent_type: AgentType) -> Option<Arc<dyn Agent>> {
        self.agents.get(&agent_type).map(|r| r.agent.clone())
    }

    pub fn capability(&self, agent_type: AgentType) -> Option<&AgentCapability> {
        self.agents.get(&agent_type).map(|r| &r.capability)
    }

    /// Capabilities in pipeline order.
    pub fn capabilities(&self) -> Vec<AgentCapability> {
        self.agents.values().map(|r| r.capability.clone()).collect()
    }

    pub fn contains(&self, agent_type: AgentType) -> bool {
        self.agents.contains_key(&agent_type)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}
