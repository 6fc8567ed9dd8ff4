use futures::future::BoxFuture;
use lumen_client::NetworkGateway;
use lumen_llm::{
    ChunkCallback, ConfigError, ConversationHistory, GenerationRequest, LLMConfig, LlmError,
    LlmProvider, Message, ProviderFactory, TokenUsage,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use crate::builder::NodeBuilder;
use crate::context::{NodeContext, RouteDecision};
use crate::prompt::{BuiltPrompt, PromptPolicy};
use crate::router::Router;
use crate::transform::InputTransformer;

/// Upper bound on routed transitions within one chain.
pub const MAX_ROUTE_HOPS: u32 = 16;

/// Predicate gating legacy single-successor chaining.
pub type Condition = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("input transformation failed: {0}")]
    Transform(anyhow::Error),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("routing failed: {0}")]
    Routing(anyhow::Error),
}

impl NodeError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transform(_) => "TransformError",
            Self::Llm(e) => e.kind(),
            Self::Routing(_) => "RoutingError",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResponseMetadata {
    /// Node that produced the response.
    pub node: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    /// Final chain state, when routing was active.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<NodeContext>,
}

/// Result of [`ConversationNode::process`]. Failures are reported in
/// `error` with empty `content`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeResponse {
    pub content: String,
    pub metadata: ResponseMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when a router ran but named no known route.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_decision: Option<RouteDecision>,
}

impl NodeResponse {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Where a turn goes after the provider has answered.
pub(crate) enum Hop<'n> {
    /// Matched route; the context has already been updated.
    Routed(&'n ConversationNode),
    /// Legacy chaining with the raw response as input.
    Chained(&'n ConversationNode),
    /// Stop here, remembering an unmatched decision if a router ran.
    Terminal(Option<RouteDecision>),
}

/// One prompt policy, one provider, one transcript.
pub struct ConversationNode {
    pub(crate) name: String,
    pub(crate) provider: Arc<dyn LlmProvider>,
    pub(crate) prompt: PromptPolicy,
    pub(crate) transformer: Option<Arc<dyn InputTransformer>>,
    pub(crate) router: Option<Arc<dyn Router>>,
    pub(crate) routes: HashMap<String, Arc<ConversationNode>>,
    pub(crate) next_node: Option<Arc<ConversationNode>>,
    pub(crate) condition: Option<Condition>,
    pub(crate) stream_callback: Option<ChunkCallback>,
    pub(crate) history: Mutex<ConversationHistory>,
}

impl ConversationNode {
    pub fn builder(
        name: impl Into<String>,
        provider: Arc<dyn LlmProvider>,
        prompt: PromptPolicy,
    ) -> NodeBuilder {
        NodeBuilder::new(name.into(), provider, prompt)
    }

    /// Builder whose provider is resolved from `config.provider`.
    pub fn from_config(
        name: impl Into<String>,
        config: LLMConfig,
        prompt: PromptPolicy,
        gateway: &NetworkGateway,
    ) -> Result<NodeBuilder, ConfigError> {
        let provider = ProviderFactory::create(config, gateway)?;
        Ok(Self::builder(name, provider, prompt))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    pub fn prompt_policy(&self) -> &PromptPolicy {
        &self.prompt
    }

    pub fn route_ids(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Snapshot of the transcript.
    pub fn history(&self) -> ConversationHistory {
        self.lock_history().clone()
    }

    pub fn reset_conversation(&self) {
        self.lock_history().clear();
    }

    /// Prompt this node would send for `input` under `context`.
    pub fn build_prompt(&self, input: &str, context: Option<&NodeContext>) -> BuiltPrompt {
        let additions = context
            .map(|ctx| ctx.system_prompt_additions.as_slice())
            .unwrap_or_default();
        self.prompt.build(input, additions)
    }

    /// Run one turn and follow routing or chaining to the end of the chain.
    ///
    /// Never fails: errors come back as a [`NodeResponse`] with `error` set.
    pub fn process<'a>(
        &'a self,
        input: impl Into<String>,
        context: Option<&'a mut NodeContext>,
    ) -> BoxFuture<'a, NodeResponse> {
        let input = input.into();
        Box::pin(async move {
            match self.run(input, context).await {
                Ok(response) => response,
                Err(err) => self.error_response(&err),
            }
        })
    }

    async fn run(
        &self,
        input: String,
        context: Option<&mut NodeContext>,
    ) -> Result<NodeResponse, NodeError> {
        let mut owned = None;
        let mut context = match context {
            Some(ctx) => Some(ctx),
            None if self.router.is_some() => Some(owned.insert(NodeContext::new(input.as_str()))),
            None => None,
        };

        let request = self.prepare_turn(input, context.as_deref_mut()).await?;
        let generation = self
            .provider
            .generate(request)
            .await
            .map_err(LlmError::from)?;
        self.record_assistant(&generation.content);

        tracing::info!(
            node = %self.name,
            provider = %generation.provider,
            model = %generation.model,
            chars = generation.content.len(),
            "node turn completed"
        );

        let mut response = NodeResponse {
            content: generation.content,
            metadata: ResponseMetadata {
                node: self.name.clone(),
                provider: Some(generation.provider),
                model: Some(generation.model),
                usage: generation.usage,
                ..ResponseMetadata::default()
            },
            ..NodeResponse::default()
        };

        match self.next_hop(&response.content, context.as_deref_mut()).await? {
            Hop::Routed(next) => match context {
                Some(ctx) => {
                    let next_input = ctx.current_input.clone();
                    Ok(next.process(next_input, Some(ctx)).await)
                }
                None => Ok(response),
            },
            Hop::Chained(next) => Ok(next.process(response.content, None).await),
            Hop::Terminal(decision) => {
                response.route_decision = decision;
                response.metadata.context = context.as_deref().cloned();
                Ok(response)
            }
        }
    }

    /// Transform the input, build the prompt and queue the user message.
    pub(crate) async fn prepare_turn(
        &self,
        input: String,
        context: Option<&mut NodeContext>,
    ) -> Result<GenerationRequest, NodeError> {
        let input = match &self.transformer {
            Some(transformer) => transformer
                .transform(&input)
                .await
                .map_err(NodeError::Transform)?,
            None => input,
        };

        let additions = match context {
            Some(ctx) => {
                ctx.current_input = input.clone();
                ctx.system_prompt_additions.clone()
            }
            None => Vec::new(),
        };
        let prompt = self.prompt.build(&input, &additions);
        Ok(self.open_turn(prompt))
    }

    fn open_turn(&self, prompt: BuiltPrompt) -> GenerationRequest {
        let messages = {
            let mut history = self.lock_history();
            if let Some(user) = prompt.user_prompt {
                history.push(Message::user(user));
            }
            history.messages().to_vec()
        };

        let config = self.provider.config();
        GenerationRequest {
            system_prompt: prompt.system_prompt,
            messages,
            temperature: Some(config.temperature),
            max_tokens: config.max_tokens,
        }
    }

    pub(crate) fn record_assistant(&self, content: &str) {
        self.lock_history().push(Message::assistant(content));
    }

    pub(crate) async fn next_hop(
        &self,
        content: &str,
        context: Option<&mut NodeContext>,
    ) -> Result<Hop<'_>, NodeError> {
        let mut unmatched = None;

        if let (Some(router), Some(ctx)) = (&self.router, context) {
            let decision = router
                .route(content, ctx)
                .await
                .map_err(NodeError::Routing)?;

            match self.routes.get(&decision.route_id) {
                Some(next) => {
                    if ctx.hops >= MAX_ROUTE_HOPS {
                        return Err(NodeError::Routing(anyhow::anyhow!(
                            "route hop limit of {MAX_ROUTE_HOPS} reached at {}",
                            self.name
                        )));
                    }
                    ctx.apply(&decision);
                    tracing::info!(
                        node = %self.name,
                        route = %decision.route_id,
                        next = %next.name,
                        hops = ctx.hops,
                        "routing to successor"
                    );
                    return Ok(Hop::Routed(next.as_ref()));
                }
                None => {
                    tracing::warn!(node = %self.name, route = %decision.route_id, "router named no known route");
                    unmatched = Some(decision);
                }
            }
        }

        if let Some(next) = &self.next_node {
            if self.condition.as_ref().map_or(true, |passes| passes(content)) {
                tracing::debug!(node = %self.name, next = %next.name, "chaining to next node");
                return Ok(Hop::Chained(next.as_ref()));
            }
        }

        Ok(Hop::Terminal(unmatched))
    }

    fn error_response(&self, err: &NodeError) -> NodeResponse {
        tracing::error!(node = %self.name, error_type = err.kind(), error = %err, "node turn failed");
        NodeResponse {
            content: String::new(),
            metadata: ResponseMetadata {
                node: self.name.clone(),
                error_type: Some(err.kind().to_string()),
                ..ResponseMetadata::default()
            },
            error: Some(err.to_string()),
            route_decision: None,
        }
    }

    pub(crate) fn lock_history(&self) -> MutexGuard<'_, ConversationHistory> {
        // The transcript is append-only, so a poisoned lock still holds a usable value.
        self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for ConversationNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationNode")
            .field("name", &self.name)
            .field("provider", &self.provider.name())
            .field("prompt", &self.prompt)
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .field("next_node", &self.next_node.as_ref().map(|n| n.name.as_str()))
            .finish_non_exhaustive()
    }
}
