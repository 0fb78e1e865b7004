use std::{collections::BTreeMap, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;

use crate::services::{agent_registry::AgentRegistry, agents::AgentType, config::WorkflowConfig};

pub const BOOKMARK_PROCESSING: &str = "bookmark_processing";
pub const IMPORT_ONLY: &str = "import_only";
pub const VALIDATE_ENRICH: &str = "validate_enrich";

#[derive(Debug, Error, PartialEq)]
pub enum WorkflowError {
    #[error("Unknown workflow type '{0}'")]
    UnknownWorkflow(String),
    #[error("Workflow '{0}' has no agents")]
    Empty(String),
    #[error("Workflow '{workflow}' lists agent '{agent}' more than once")]
    DuplicateAgent { workflow: String, agent: AgentType },
    #[error("Workflow '{workflow}' names unknown agent '{agent}'")]
    UnknownAgent { workflow: String, agent: String },
    #[error("Workflow '{workflow}' needs agent '{agent}', which is not registered")]
    UnregisteredAgent { workflow: String, agent: AgentType },
}

/// Ordered agent sequence a task runs through.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct WorkflowDefinition {
    pub workflow_type: String,
    pub name: String,
    pub description: String,
    pub agents: Vec<AgentType>,
}

impl WorkflowDefinition {
    fn new(workflow_type: &str, name: &str, description: &str, agents: Vec<AgentType>) -> Self {
        Self {
            workflow_type: workflow_type.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            agents,
        }
    }

    pub fn agent_names(&self) -> Vec<String> {
        self.agents.iter().map(ToString::to_string).collect()
    }

    fn check_shape(&self) -> Result<(), WorkflowError> {
        if self.agents.is_empty() {
            return Err(WorkflowError::Empty(self.workflow_type.clone()));
        }
        let mut seen = Vec::with_capacity(self.agents.len());
        for agent in &self.agents {
            if seen.contains(agent) {
                return Err(WorkflowError::DuplicateAgent {
                    workflow: self.workflow_type.clone(),
                    agent: *agent,
                });
            }
            seen.push(*agent);
        }
        Ok(())
    }
}

impl TryFrom<&WorkflowConfig> for WorkflowDefinition {
    type Error = WorkflowError;

    fn try_from(config: &WorkflowConfig) -> Result<Self, Self::Error> {
        let agents = config
            .agents
            .iter()
            .map(|name| {
                AgentType::from_str(name.trim()).map_err(|_| WorkflowError::UnknownAgent {
                    workflow: config.workflow_type.clone(),
                    agent: name.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let definition = WorkflowDefinition {
            workflow_type: config.workflow_type.clone(),
            name: config
                .name
                .clone()
                .unwrap_or_else(|| config.workflow_type.clone()),
            description: config.description.clone().unwrap_or_default(),
            agents,
        };
        definition.check_shape()?;
        Ok(definition)
    }
}

/// Known workflows keyed by type.
#[derive(Debug, Clone)]
pub struct WorkflowCatalog {
    workflows: BTreeMap<String, WorkflowDefinition>,
}

impl WorkflowCatalog {
    pub fn builtin() -> Self {
        use AgentType::*;

        let workflows = [
            WorkflowDefinition::new(
                BOOKMARK_PROCESSING,
                "Bookmark processing",
                "Import, validate, enrich, categorize and embed a bookmark export",
                vec![Import, Validation, Enrichment, Categorization, Embedding],
            ),
            WorkflowDefinition::new(
                IMPORT_ONLY,
                "Import only",
                "Parse a bookmark export without further processing",
                vec![Import],
            ),
            WorkflowDefinition::new(
                VALIDATE_ENRICH,
                "Validate and enrich",
                "Validate and enrich an already imported bookmark batch",
                vec![Validation, Enrichment],
            ),
        ];

        Self {
            workflows: workflows
                .into_iter()
                .map(|w| (w.workflow_type.clone(), w))
                .collect(),
        }
    }

    /// Built-ins plus workflows declared in config. A configured workflow
    /// replaces a built-in of the same type.
    pub fn with_config(extra: &[WorkflowConfig]) -> Result<Self, WorkflowError> {
        let mut catalog = Self::builtin();
        for config in extra {
            let definition = WorkflowDefinition::try_from(config)?;
            if catalog.workflows.contains_key(&definition.workflow_type) {
                tracing::info!(
                    "[WORKFLOWS] Config overrides built-in workflow '{}'",
                    definition.workflow_type
                );
            }
            catalog
                .workflows
                .insert(definition.workflow_type.clone(), definition);
        }
        Ok(catalog)
    }

    /// Every workflow must only name registered agents.
    pub fn verify_against(&self, registry: &AgentRegistry) -> Result<(), WorkflowError> {
        for definition in self.workflows.values() {
            definition.check_shape()?;
            if let Some(agent) = definition.agents.iter().find(|a| !registry.contains(**a)) {
                return Err(WorkflowError::UnregisteredAgent {
                    workflow: definition.workflow_type.clone(),
                    agent: *agent,
                });
            }
        }
        Ok(())
    }

    pub fn resolve(&self, workflow_type: &str) -> Result<&WorkflowDefinition, WorkflowError> {
        self.workflows
            .get(workflow_type)
            .ok_or_else(|| WorkflowError::UnknownWorkflow(workflow_type.to_string()))
    }

    pub fn list(&self) -> Vec<WorkflowDefinition> {
        self.workflows.values().cloned().collect()
    }
}
