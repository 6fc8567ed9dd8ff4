use futures::StreamExt;
use lumen_client::{ClientError, NetworkGateway, RequestContext};
use lumen_graph::{ConversationNode, InputType, PromptPolicy};
use lumen_llm::{ConfigError, LLMConfig, Message, Role, StreamChunk, TokenUsage};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::services::{CreditAccount, Downstream, NewMessage, UsageEvent};

pub const TITLE_PROMPT: &str = "Generate a short and concise one-sentence title for the following conversation between a user and an assistant. Only return the sentence itself without quotation marks or any extra characters : {input}";

const INSUFFICIENT_BALANCE: &str = "Your credit account has insufficient balance";
const INACTIVE_ACCOUNT: &str = "Your credit account is not active";
const MISSING_PROJECT_KEY: &str = "No LLM API key is configured for your project";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Rejected before any provider cost was incurred.
    #[error("{0}")]
    PreconditionFailed(String),

    #[error(transparent)]
    Downstream(#[from] ClientError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// A user message addressed to a bot in a thread.
#[derive(Debug, Clone, PartialEq)]
pub struct SendMessage {
    pub bot_id: String,
    pub thread_id: String,
    pub content: String,
    /// Client-chosen id for the user message.
    pub id: Option<String>,
    pub parent_id: Option<String>,
    /// Client-chosen id for the assistant reply.
    pub response_id: Option<String>,
}

impl SendMessage {
    pub fn new(
        bot_id: impl Into<String>,
        thread_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            bot_id: bot_id.into(),
            thread_id: thread_id.into(),
            content: content.into(),
            id: None,
            parent_id: None,
            response_id: None,
        }
    }
}

/// How a bot answers.
#[derive(Debug, Clone)]
pub struct BotProfile {
    pub system_prompt: Option<String>,
    pub llm: LLMConfig,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub minimum_balance: f64,
    pub history_limit: u32,
    /// Chunks buffered between the producer task and the caller.
    pub channel_capacity: usize,
    /// Model used to name new threads; `None` disables naming.
    pub title: Option<LLMConfig>,
    /// Answer with the caller's project key from the credit service instead
    /// of the key in the bot profile.
    pub project_keys: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            minimum_balance: 0.0,
            history_limit: 10,
            channel_capacity: 32,
            title: None,
            project_keys: false,
        }
    }
}

/// Turns one user message into a streamed answer and does the bookkeeping
/// around it.
pub struct MessageOrchestrator {
    gateway: Arc<NetworkGateway>,
    downstream: Downstream,
    settings: OrchestratorSettings,
}

impl MessageOrchestrator {
    pub fn new(gateway: Arc<NetworkGateway>, downstream: Downstream, settings: OrchestratorSettings) -> Self {
        Self {
            gateway,
            downstream,
            settings,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Check credit, persist the user message and start streaming the answer.
    ///
    /// Everything that can reject the request happens before this returns.
    /// The returned stream is fed by a background task that also persists
    /// the answer, reports usage and names new threads once the final chunk
    /// has been delivered. Dropping the stream abandons that task.
    pub async fn send(
        &self,
        message: SendMessage,
        profile: &BotProfile,
    ) -> Result<ReceiverStream<StreamChunk>, OrchestratorError> {
        let account = self.check_credit().await?;
        let api_key = self.project_key().await?;
        let llm = with_key(profile.llm.clone(), api_key.as_deref());

        let mut prompt = PromptPolicy::user();
        if let Some(system_prompt) = &profile.system_prompt {
            prompt = prompt.with_base_system_prompt(system_prompt);
        }
        let builder = ConversationNode::from_config("assistant", llm, prompt, &self.gateway)?;

        let user_message = NewMessage::completed(
            message.id.clone().unwrap_or_else(new_message_id),
            Role::User,
            message.content.as_str(),
        )
        .with_parent(message.parent_id.clone());
        let stored = self
            .downstream
            .post_message(&message.thread_id, &user_message)
            .await?;

        let history: Vec<Message> = self
            .downstream
            .recent_messages(&message.thread_id, &message.bot_id, self.settings.history_limit)
            .await?
            .into_iter()
            .filter(|m| m.id != stored.id)
            .map(Message::from)
            .collect();
        let first_exchange = history.is_empty();
        let node = builder.history(history).build()?;

        let context = RequestContext::current().unwrap_or_default();
        let exchange = Exchange {
            node,
            downstream: self.downstream.clone(),
            gateway: self.gateway.clone(),
            title: self
                .settings
                .title
                .clone()
                .filter(|_| first_exchange)
                .map(|title| with_key(title, api_key.as_deref())),
            thread_id: message.thread_id,
            user_message_id: stored.id,
            response_id: message.response_id.unwrap_or_else(new_message_id),
            input: message.content,
            model: profile.llm.model.clone(),
            request_id: Uuid::new_v4().to_string(),
            account_id: account.id.or_else(|| context.tenant_id.clone()),
        };

        tracing::info!(
            thread_id = %exchange.thread_id,
            bot_id = %message.bot_id,
            request_id = %exchange.request_id,
            model = %exchange.model,
            first_exchange,
            "starting exchange"
        );

        let (tx, rx) = mpsc::channel(self.settings.channel_capacity.max(1));
        tokio::spawn(context.scope(exchange.run(tx)));
        Ok(ReceiverStream::new(rx))
    }

    async fn check_credit(&self) -> Result<CreditAccount, OrchestratorError> {
        let account = self.downstream.credit_account().await?;
        if account.balance < self.settings.minimum_balance {
            tracing::info!(balance = account.balance, "rejecting message, insufficient balance");
            return Err(OrchestratorError::PreconditionFailed(INSUFFICIENT_BALANCE.to_string()));
        }
        if !account.is_active() {
            tracing::info!(status = %account.status, "rejecting message, inactive credit account");
            return Err(OrchestratorError::PreconditionFailed(INACTIVE_ACCOUNT.to_string()));
        }
        Ok(account)
    }

    async fn project_key(&self) -> Result<Option<String>, OrchestratorError> {
        if !self.settings.project_keys {
            return Ok(None);
        }
        let key = self.downstream.project_api_key().await?.key;
        if key.trim().is_empty() {
            tracing::info!("rejecting message, project has no LLM key");
            return Err(OrchestratorError::PreconditionFailed(MISSING_PROJECT_KEY.to_string()));
        }
        Ok(Some(key))
    }
}

fn with_key(mut config: LLMConfig, api_key: Option<&str>) -> LLMConfig {
    if let Some(key) = api_key {
        config.api_key = key.to_string();
    }
    config
}

/// Time-ordered message id.
fn new_message_id() -> String {
    Uuid::now_v7().to_string()
}

/// State owned by the background task of one exchange.
struct Exchange {
    node: ConversationNode,
    downstream: Downstream,
    gateway: Arc<NetworkGateway>,
    title: Option<LLMConfig>,
    thread_id: String,
    user_message_id: String,
    response_id: String,
    input: String,
    model: String,
    request_id: String,
    account_id: Option<String>,
}

impl Exchange {
    async fn run(self, tx: mpsc::Sender<StreamChunk>) {
        let mut content = String::new();
        let mut usage = None;
        let mut failed = false;

        {
            let mut chunks = self.node.process_stream(self.input.as_str(), None);
            while let Some(chunk) = chunks.next().await {
                if let Some(reported) = chunk.usage() {
                    usage = Some(add_usage(usage, reported));
                }
                content.push_str(&chunk.content);
                failed |= chunk.is_error();
                let done = chunk.done;

                if tx.send(chunk).await.is_err() {
                    tracing::info!(thread_id = %self.thread_id, request_id = %self.request_id, "caller went away, abandoning exchange");
                    return;
                }
                if done {
                    break;
                }
            }
        }
        drop(tx);

        if failed {
            tracing::warn!(thread_id = %self.thread_id, request_id = %self.request_id, "exchange failed, answer not persisted");
            return;
        }
        self.complete(content, usage).await;
    }

    async fn complete(self, content: String, usage: Option<TokenUsage>) {
        let reply = NewMessage::completed(self.response_id.as_str(), Role::Assistant, content.as_str())
            .with_parent(Some(self.user_message_id.clone()));
        if let Err(e) = self.downstream.post_message(&self.thread_id, &reply).await {
            tracing::error!(thread_id = %self.thread_id, error = %e, "failed to persist assistant message");
        }

        match usage {
            Some(usage) => {
                let context = RequestContext::current().unwrap_or_default();
                let event = UsageEvent {
                    account_id: self.account_id.clone(),
                    model_name: self.model.clone(),
                    input_tokens: usage.prompt_tokens,
                    output_tokens: usage.completion_tokens,
                    request_id: self.request_id.clone(),
                    user_id: context.user_id,
                    tenant_id: context.tenant_id,
                };
                if let Err(e) = self.downstream.emit_usage(&event).await {
                    tracing::warn!(request_id = %self.request_id, error = %e, "failed to emit usage event");
                }
            }
            None => tracing::debug!(request_id = %self.request_id, "provider reported no usage"),
        }

        if let Some(config) = self.title {
            let job = TitleJob {
                gateway: self.gateway,
                downstream: self.downstream,
                config,
                thread_id: self.thread_id,
                transcript: vec![Message::user(self.input), Message::assistant(content)],
            };
            let context = RequestContext::current().unwrap_or_default();
            tokio::spawn(context.scope(job.run()));
        }
    }
}

fn add_usage(total: Option<TokenUsage>, more: TokenUsage) -> TokenUsage {
    match total {
        None => more,
        Some(total) => TokenUsage {
            prompt_tokens: total.prompt_tokens.saturating_add(more.prompt_tokens),
            completion_tokens: total.completion_tokens.saturating_add(more.completion_tokens),
            total_tokens: total.total_tokens.saturating_add(more.total_tokens),
        },
    }
}

/// Names a thread after its first exchange. Failures are only logged.
struct TitleJob {
    gateway: Arc<NetworkGateway>,
    downstream: Downstream,
    config: LLMConfig,
    thread_id: String,
    transcript: Vec<Message>,
}

impl TitleJob {
    async fn run(self) {
        let thread_id = self.thread_id.clone();
        if let Err(e) = self.generate().await {
            tracing::warn!(thread_id = %thread_id, error = %e, "title generation failed");
        }
    }

    async fn generate(self) -> anyhow::Result<()> {
        let transcript = serde_json::to_string(&self.transcript)?;
        let node = ConversationNode::from_config(
            "title",
            self.config,
            PromptPolicy::new(InputType::UserPrompt, TITLE_PROMPT),
            &self.gateway,
        )?
        .build()?;

        let response = node.process(transcript, None).await;
        if let Some(error) = response.error {
            anyhow::bail!(error);
        }

        let title = clean_title(&response.content);
        if title.is_empty() {
            anyhow::bail!("model returned an empty title");
        }
        self.downstream.rename_thread(&self.thread_id, title).await?;
        tracing::info!(thread_id = %self.thread_id, title, "thread renamed");
        Ok(())
    }
}

fn clean_title(raw: &str) -> &str {
    raw.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
        .trim_matches(|c: char| c == '"' || c == '\'')
        .trim()
}
