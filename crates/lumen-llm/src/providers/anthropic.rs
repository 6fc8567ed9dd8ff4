use async_trait::async_trait;
use lumen_client::{ClientOptions, NetworkGateway, ServiceClient, ServiceRequest};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{buffered_chunks, split_system, ChunkStream, Generation, GenerationRequest, LlmProvider};
use crate::buffer_utils::{parse_sse_stream, ProviderEvent, SseEventParser, SseFrame};
use crate::config::LLMConfig;
use crate::error::{ConfigError, ProviderError};
use crate::retry::{execute_with_retry, RetryPolicy};
use crate::types::{TokenUsage, UsageReport};

pub const PROVIDER: &str = "anthropic";
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
pub const API_VERSION: &str = "2023-06-01";
/// The Messages API requires `max_tokens`; used when the config has none.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic Messages API adapter.
pub struct AnthropicProvider {
    config: LLMConfig,
    client: ServiceClient,
    retry: RetryPolicy,
}

impl AnthropicProvider {
    pub fn new(config: LLMConfig, gateway: &NetworkGateway) -> Result<Self, ConfigError> {
        config.validate()?;
        let base_url = config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        let client = gateway
            .client_with(
                base_url,
                ClientOptions::default()
                    .with_timeout(config.timeout())
                    .without_identity(),
            )
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        Ok(Self {
            retry: RetryPolicy::new(config.max_retries),
            config,
            client,
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn request_body(&self, request: &GenerationRequest, stream: bool) -> Value {
        let (system, turns) = split_system(request);
        let messages: Vec<Value> = turns
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();

        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
            "max_tokens": request.max_tokens.or(self.config.max_tokens).unwrap_or(DEFAULT_MAX_TOKENS),
            "temperature": request.temperature.unwrap_or(self.config.temperature),
            "stream": stream,
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }
        body
    }

    fn messages_request(&self, body: Value) -> ServiceRequest {
        ServiceRequest::post("messages")
            .header("x-api-key", self.config.api_key.clone())
            .header("anthropic-version", API_VERSION)
            .json_value(body)
    }

    async fn generate_once(&self, body: Value) -> Result<Generation, ProviderError> {
        let response = self
            .client
            .send(self.messages_request(body))
            .await
            .map_err(|e| ProviderError::from_client(PROVIDER, e))?;
        let message: MessagesResponse = response
            .json()
            .map_err(|e| ProviderError::new(PROVIDER, e.to_string()))?;

        let content = message
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        Ok(Generation {
            content,
            usage: message
                .usage
                .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens)),
            model: message.model.unwrap_or_else(|| self.config.model.clone()),
            provider: PROVIDER.to_string(),
        })
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn config(&self) -> &LLMConfig {
        &self.config
    }

    async fn generate(&self, request: GenerationRequest) -> Result<Generation, ProviderError> {
        let body = self.request_body(&request, false);
        let generation =
            execute_with_retry(&self.retry, "generate", || self.generate_once(body.clone())).await?;

        tracing::info!(
            provider = PROVIDER,
            model = %generation.model,
            prompt_tokens = generation.usage.map(|u| u.prompt_tokens),
            completion_tokens = generation.usage.map(|u| u.completion_tokens),
            "generation completed"
        );
        Ok(generation)
    }

    async fn generate_stream(&self, request: GenerationRequest) -> Result<ChunkStream, ProviderError> {
        let body = self.request_body(&request, true);
        let response = self
            .client
            .stream(self.messages_request(body))
            .await
            .map_err(|e| ProviderError::from_client(PROVIDER, e))?;

        let events = parse_sse_stream(PROVIDER, response.into_byte_stream(), MessageEventParser);
        Ok(buffered_chunks(PROVIDER, events, self.config.stream_policy()))
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

/// Usage is spread over the stream: `message_start` carries input tokens
/// and the first output count, each `message_delta` adds output tokens.
struct MessageEventParser;

impl SseEventParser for MessageEventParser {
    fn parse_frame(&self, frame: &SseFrame) -> Result<Vec<ProviderEvent>, ProviderError> {
        let payload: Value = serde_json::from_str(&frame.data)
            .map_err(|e| ProviderError::new(PROVIDER, format!("malformed stream event: {e}")))?;
        let kind = payload
            .get("type")
            .and_then(Value::as_str)
            .or(frame.event.as_deref())
            .unwrap_or_default();

        let events = match kind {
            "message_start" => {
                let usage: AnthropicUsage = payload
                    .pointer("/message/usage")
                    .cloned()
                    .map(serde_json::from_value::<AnthropicUsage>)
                    .transpose()
                    .map_err(|e| ProviderError::new(PROVIDER, format!("malformed usage: {e}")))?
                    .unwrap_or_default();
                vec![ProviderEvent::Usage(UsageReport::Started {
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                })]
            }
            "content_block_delta" => payload
                .pointer("/delta/text")
                .and_then(Value::as_str)
                .filter(|text| !text.is_empty())
                .map(|text| vec![ProviderEvent::TextDelta(text.to_string())])
                .unwrap_or_default(),
            "message_delta" => payload
                .pointer("/usage/output_tokens")
                .and_then(Value::as_u64)
                .map(|tokens| {
                    vec![ProviderEvent::Usage(UsageReport::OutputDelta(
                        u32::try_from(tokens).unwrap_or(u32::MAX),
                    ))]
                })
                .unwrap_or_default(),
            "message_stop" => vec![ProviderEvent::Stop],
            "error" => {
                let message = payload
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown stream error");
                vec![ProviderEvent::Failed(message.to_string())]
            }
            _ => Vec::new(),
        };
        Ok(events)
    }
}
