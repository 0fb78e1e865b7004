pub mod agent_registry;
pub mod agents;
pub mod artifacts;
pub mod bookmark_sink;
pub mod config;
pub mod progress;
pub mod task_manager;
pub mod workflows;
