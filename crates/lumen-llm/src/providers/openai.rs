use async_trait::async_trait;
use lumen_client::{ClientOptions, NetworkGateway, ServiceClient, ServiceRequest};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{buffered_chunks, ChunkStream, Generation, GenerationRequest, LlmProvider};
use crate::buffer_utils::{parse_sse_stream, ProviderEvent, SseEventParser, SseFrame};
use crate::config::LLMConfig;
use crate::error::{ConfigError, ProviderError};
use crate::retry::{execute_with_retry, RetryPolicy};
use crate::types::{TokenUsage, UsageReport};

pub const PROVIDER: &str = "openai";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI Chat Completions adapter.
pub struct OpenAiProvider {
    config: LLMConfig,
    client: ServiceClient,
    retry: RetryPolicy,
}

impl OpenAiProvider {
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
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.extend(
            request
                .messages
                .iter()
                .map(|m| json!({"role": m.role.as_str(), "content": m.content})),
        );

        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": request.temperature.unwrap_or(self.config.temperature),
            "stream": stream,
        });
        if let Some(max_tokens) = request.max_tokens.or(self.config.max_tokens) {
            body["max_tokens"] = json!(max_tokens);
        }
        if stream {
            body["stream_options"] = json!({"include_usage": true});
        }
        body
    }

    fn completion_request(&self, body: Value) -> ServiceRequest {
        ServiceRequest::post("chat/completions")
            .header("authorization", format!("Bearer {}", self.config.api_key))
            .json_value(body)
    }

    async fn generate_once(&self, body: Value) -> Result<Generation, ProviderError> {
        let response = self
            .client
            .send(self.completion_request(body))
            .await
            .map_err(|e| ProviderError::from_client(PROVIDER, e))?;
        let completion: ChatCompletion = response
            .json()
            .map_err(|e| ProviderError::new(PROVIDER, e.to_string()))?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();

        Ok(Generation {
            content,
            usage: completion.usage,
            model: completion.model.unwrap_or_else(|| self.config.model.clone()),
            provider: PROVIDER.to_string(),
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
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
            .stream(self.completion_request(body))
            .await
            .map_err(|e| ProviderError::from_client(PROVIDER, e))?;

        let events = parse_sse_stream(PROVIDER, response.into_byte_stream(), ChatChunkParser);
        Ok(buffered_chunks(PROVIDER, events, self.config.stream_policy()))
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Content arrives in `choices[].delta.content`; usage arrives once in a
/// trailing chunk with no choices, just before `[DONE]`.
struct ChatChunkParser;

impl SseEventParser for ChatChunkParser {
    fn parse_frame(&self, frame: &SseFrame) -> Result<Vec<ProviderEvent>, ProviderError> {
        let chunk: ChatCompletionChunk = serde_json::from_str(&frame.data)
            .map_err(|e| ProviderError::new(PROVIDER, format!("malformed stream chunk: {e}")))?;

        let mut events: Vec<ProviderEvent> = chunk
            .choices
            .into_iter()
            .filter_map(|choice| choice.delta.content)
            .filter(|text| !text.is_empty())
            .map(ProviderEvent::TextDelta)
            .collect();
        if let Some(usage) = chunk.usage {
            events.push(ProviderEvent::Usage(UsageReport::Total(usage)));
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    fn provider() -> OpenAiProvider {
        let config = LLMConfig::new(PROVIDER, "sk-test", "gpt-4o-mini").with_max_tokens(256);
        OpenAiProvider::new(config, &NetworkGateway::default()).unwrap()
    }

    #[test]
    fn test_request_body_puts_system_prompt_first() {
        let request = GenerationRequest::new(vec![Message::user("hi")]).with_system_prompt("Be brief.");
        let body = provider().request_body(&request, true);

        assert_eq!(body["messages"][0], json!({"role": "system", "content": "Be brief."}));
        assert_eq!(body["messages"][1], json!({"role": "user", "content": "hi"}));
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_parser_reads_delta_and_trailing_usage() {
        let parser = ChatChunkParser;
        let delta = SseFrame {
            event: None,
            data: r#"{"choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}],"usage":null}"#.into(),
        };
        assert_eq!(parser.parse_frame(&delta).unwrap(), vec![ProviderEvent::TextDelta("Hi".into())]);

        let usage = SseFrame {
            event: None,
            data: r#"{"choices":[],"usage":{"prompt_tokens":9,"completion_tokens":2,"total_tokens":11}}"#.into(),
        };
        assert_eq!(
            parser.parse_frame(&usage).unwrap(),
            vec![ProviderEvent::Usage(UsageReport::Total(TokenUsage::new(9, 2)))]
        );
    }

    #[test]
    fn test_parser_rejects_garbage() {
        let frame = SseFrame {
            event: None,
            data: "not json".into(),
        };
        assert!(ChatChunkParser.parse_frame(&frame).is_err());
    }
}
