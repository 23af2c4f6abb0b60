use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use waypoint_core::config::ExecutionConfig;
use waypoint_core::event::EventBus;
use waypoint_core::traits::{ModelCallExecutor, ModelMemory, ToolCallExecutor};
use waypoint_core::types::{ConversationId, WorkflowEvent};

/// Everything a workflow run needs from the outside world.
///
/// Passed explicitly to every executor; clones share the same collaborators
/// and cancellation token.
#[derive(Clone)]
pub struct AgentContext {
    pub conversation_id: ConversationId,
    pub config: ExecutionConfig,
    pub model: Arc<dyn ModelCallExecutor>,
    pub tools: Arc<dyn ToolCallExecutor>,
    pub memory: Arc<dyn ModelMemory>,
    pub event_bus: Arc<EventBus>,
    pub cancel: CancellationToken,
}

impl AgentContext {
    pub fn new(
        model: Arc<dyn ModelCallExecutor>,
        tools: Arc<dyn ToolCallExecutor>,
        memory: Arc<dyn ModelMemory>,
    ) -> Self {
        Self {
            conversation_id: ConversationId::new(),
            config: ExecutionConfig::default(),
            model,
            tools,
            memory,
            event_bus: Arc::new(EventBus::default()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_conversation_id(mut self, id: ConversationId) -> Self {
        self.conversation_id = id;
        self
    }

    pub fn with_config(mut self, config: ExecutionConfig) -> Self {
        self.config = config;
        self
    }

    /// Layer recognised metadata keys over the current config.
    pub fn with_metadata(mut self, metadata: &HashMap<String, serde_json::Value>) -> Self {
        self.config = self.config.merge_metadata(metadata);
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = bus;
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn publish(&self, event: WorkflowEvent) {
        self.event_bus.publish(event);
    }
}

impl fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentContext")
            .field("conversation_id", &self.conversation_id)
            .field("config", &self.config)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}
