//! Shared collaborators handed to every task.
//!
//! Replaces process-wide singletons: whatever a task needs beyond its own state is reached
//! through the [`EngineContext`] it was constructed with.

use std::sync::Arc;

use super::RequestPacer;
use crate::checkpoint::{CheckpointService, NoopCheckpoints};
use crate::config::Config;
use crate::llm::ModelClient;
use crate::store::TaskStore;
use crate::tools::ToolRegistry;

pub struct EngineContext {
    pub config: Config,
    pub client: Arc<dyn ModelClient>,
    pub store: Arc<dyn TaskStore>,
    pub checkpoints: Arc<dyn CheckpointService>,
    pub tools: Arc<ToolRegistry>,
    /// One pacer per engine, shared by every task including nested ones
    pub pacer: Arc<RequestPacer>,
}

impl EngineContext {
    /// Context with the built-in tools and checkpointing turned off.
    pub fn new(config: Config, client: Arc<dyn ModelClient>, store: Arc<dyn TaskStore>) -> Self {
        let pacer = Arc::new(RequestPacer::new(config.request_delay));
        Self {
            config,
            client,
            store,
            checkpoints: Arc::new(NoopCheckpoints),
            tools: Arc::new(ToolRegistry::new()),
            pacer,
        }
    }

    pub fn with_checkpoints(mut self, checkpoints: Arc<dyn CheckpointService>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Arc::new(tools);
        self
    }
}
