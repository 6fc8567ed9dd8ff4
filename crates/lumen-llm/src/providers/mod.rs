pub mod anthropic;
pub mod openai;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;

use crate::buffer_utils::{EventStream, ProviderEvent};
use crate::config::{LLMConfig, StreamPolicy};
use crate::error::ProviderError;
use crate::streaming::{StreamBuffer, StreamChunk};
use crate::types::{Message, TokenUsage, UsageAccumulator};

/// Lazy, single-pass chunk sequence. The last item always has `done == true`.
pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

/// Provider-neutral generation input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl GenerationRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        let prompt = system_prompt.into();
        self.system_prompt = (!prompt.is_empty()).then_some(prompt);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub content: String,
    pub usage: Option<TokenUsage>,
    pub model: String,
    pub provider: String,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Registry id of this provider.
    fn name(&self) -> &'static str;

    fn config(&self) -> &LLMConfig;

    /// Single-shot completion, retried on transient failures.
    async fn generate(&self, request: GenerationRequest) -> Result<Generation, ProviderError>;

    /// Streaming completion.
    ///
    /// Errors before the first byte are returned directly; anything later
    /// arrives as a terminal error chunk. Never retried.
    async fn generate_stream(&self, request: GenerationRequest) -> Result<ChunkStream, ProviderError>;
}

/// Feed vendor events through a [`StreamBuffer`], reconciling usage into the
/// final chunk.
///
/// Only a vendor stop signal finishes cleanly. Events that run dry without
/// one end in an error chunk.
pub(crate) fn buffered_chunks(
    provider: &'static str,
    events: EventStream,
    policy: StreamPolicy,
) -> ChunkStream {
    Box::pin(async_stream::stream! {
        let mut events = events;
        let mut buffer = StreamBuffer::new(policy).with_source(provider);
        let mut usage = UsageAccumulator::new();
        let mut stopped = false;

        while let Some(event) = events.next().await {
            match event {
                Ok(ProviderEvent::TextDelta(text)) => match buffer.process_chunk(&text, false) {
                    Ok(Some(chunk)) => yield chunk,
                    Ok(None) => {}
                    Err(overflow) => {
                        tracing::warn!(provider, error = %overflow, "stream aborted");
                        yield buffer.fail(overflow.to_string());
                        return;
                    }
                },
                Ok(ProviderEvent::Usage(report)) => usage.apply(report),
                Ok(ProviderEvent::Stop) => {
                    stopped = true;
                    break;
                }
                Ok(ProviderEvent::Failed(message)) => {
                    let err = ProviderError::new(provider, message);
                    tracing::warn!(provider, error = %err, "provider reported stream error");
                    yield buffer.fail(err.to_string());
                    return;
                }
                Err(err) => {
                    tracing::warn!(provider, error = %err, "stream interrupted");
                    yield buffer.fail(err.to_string());
                    return;
                }
            }
        }

        if !stopped {
            let err = ProviderError::new(provider, "stream ended before completion");
            tracing::warn!(provider, chunks = buffer.chunks_emitted(), "stream truncated");
            yield buffer.fail(err.to_string());
            return;
        }

        let usage = usage.finish();
        tracing::debug!(provider, chunks = buffer.chunks_emitted() + 1, ?usage, "stream completed");
        yield buffer.finalize(usage);
    })
}

/// Fold system-role turns into the system prompt for vendors that take it
/// out of band.
pub(crate) fn split_system(request: &GenerationRequest) -> (Option<String>, Vec<&Message>) {
    let mut system: Vec<&str> = request.system_prompt.as_deref().into_iter().collect();
    let mut turns = Vec::with_capacity(request.messages.len());
    for message in &request.messages {
        match message.role {
            crate::types::Role::System => system.push(&message.content),
            _ => turns.push(message),
        }
    }
    let system = (!system.is_empty()).then(|| system.join("\n"));
    (system, turns)
}
