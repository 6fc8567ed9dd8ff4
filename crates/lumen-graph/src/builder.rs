use lumen_llm::{ChunkCallback, ConfigError, ConversationHistory, LlmProvider, StreamChunk};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::node::{Condition, ConversationNode};
use crate::prompt::PromptPolicy;
use crate::router::Router;
use crate::transform::InputTransformer;

/// Assembles a [`ConversationNode`] and checks its routing table.
pub struct NodeBuilder {
    name: String,
    provider: Arc<dyn LlmProvider>,
    prompt: PromptPolicy,
    transformer: Option<Arc<dyn InputTransformer>>,
    router: Option<Arc<dyn Router>>,
    routes: HashMap<String, Arc<ConversationNode>>,
    next_node: Option<Arc<ConversationNode>>,
    condition: Option<Condition>,
    stream_callback: Option<ChunkCallback>,
    history: ConversationHistory,
}

impl NodeBuilder {
    pub(crate) fn new(name: String, provider: Arc<dyn LlmProvider>, prompt: PromptPolicy) -> Self {
        Self {
            name,
            provider,
            prompt,
            transformer: None,
            router: None,
            routes: HashMap::new(),
            next_node: None,
            condition: None,
            stream_callback: None,
            history: ConversationHistory::new(),
        }
    }

    pub fn transformer(mut self, transformer: impl InputTransformer + 'static) -> Self {
        self.transformer = Some(Arc::new(transformer));
        self
    }

    pub fn router(mut self, router: impl Router + 'static) -> Self {
        self.router = Some(Arc::new(router));
        self
    }

    pub fn shared_router(mut self, router: Arc<dyn Router>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn route(mut self, route_id: impl Into<String>, node: Arc<ConversationNode>) -> Self {
        self.routes.insert(route_id.into(), node);
        self
    }

    /// Legacy single successor, used when no route matched.
    pub fn next_node(mut self, node: Arc<ConversationNode>) -> Self {
        self.next_node = Some(node);
        self
    }

    pub fn condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.condition = Some(Arc::new(condition));
        self
    }

    pub fn stream_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&StreamChunk) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.stream_callback = Some(Arc::new(callback));
        self
    }

    /// Seed the transcript, e.g. with a thread's earlier messages.
    pub fn history(mut self, history: impl Into<ConversationHistory>) -> Self {
        self.history = history.into();
        self
    }

    pub fn build(self) -> Result<ConversationNode, ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("node name must not be empty".to_string()));
        }

        match (&self.router, self.routes.is_empty()) {
            (Some(_), true) => {
                return Err(ConfigError::Invalid(format!(
                    "node '{}' has a router but no routes",
                    self.name
                )));
            }
            (None, false) => {
                return Err(ConfigError::Invalid(format!(
                    "node '{}' has routes but no router",
                    self.name
                )));
            }
            _ => {}
        }

        if let Some(declared) = self.router.as_ref().and_then(|r| r.declared_routes()) {
            if let Some(missing) = declared.iter().find(|id| !self.routes.contains_key(*id)) {
                return Err(ConfigError::Invalid(format!(
                    "node '{}' router declares unknown route '{missing}'",
                    self.name
                )));
            }
        }

        if self.condition.is_some() && self.next_node.is_none() {
            return Err(ConfigError::Invalid(format!(
                "node '{}' has a condition but no next node",
                self.name
            )));
        }

        tracing::debug!(
            node = %self.name,
            provider = self.provider.name(),
            routes = self.routes.len(),
            chained = self.next_node.is_some(),
            "built conversation node"
        );

        Ok(ConversationNode {
            name: self.name,
            provider: self.provider,
            prompt: self.prompt,
            transformer: self.transformer,
            router: self.router,
            routes: self.routes,
            next_node: self.next_node,
            condition: self.condition,
            stream_callback: self.stream_callback,
            history: Mutex::new(self.history),
        })
    }
}
