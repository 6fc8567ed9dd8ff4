use futures::StreamExt;
use lumen_client::NetworkGateway;
use lumen_llm::{
    AnthropicProvider, GenerationRequest, LLMConfig, LlmProvider, Message, OpenAiProvider,
    ProviderFactory, RetryPolicy, StreamChunk, StreamPolicy, TokenUsage,
};
use mockito::Matcher;
use serde_json::json;
use std::time::Duration;

fn fast_retry(attempts: u32) -> RetryPolicy {
    RetryPolicy::new(attempts).with_backoff(Duration::from_millis(1), Duration::from_millis(5))
}

fn request() -> GenerationRequest {
    GenerationRequest::new(vec![Message::user("Explain: gravity")]).with_system_prompt("Be concise.")
}

async fn drain(provider: &dyn LlmProvider) -> Vec<StreamChunk> {
    provider
        .generate_stream(request())
        .await
        .unwrap()
        .collect()
        .await
}

#[tokio::test]
async fn test_openai_stream_buffers_and_reports_usage() {
    let mut server = mockito::Server::new_async().await;
    let body = concat!(
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"\"}}],\"usage\":null}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Gravity \"}}],\"usage\":null}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"pulls \"}}],\"usage\":null}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"mass.\"},\"finish_reason\":\"stop\"}],\"usage\":null}\n\n",
        "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":14,\"completion_tokens\":4,\"total_tokens\":18}}\n\n",
        "data: [DONE]\n\n",
    );
    let mock = server
        .mock("POST", "/chat/completions")
        .match_header("authorization", "Bearer sk-test")
        .match_body(Matcher::PartialJson(json!({
            "model": "gpt-4o-mini",
            "stream": true,
            "stream_options": {"include_usage": true},
            "messages": [
                {"role": "system", "content": "Be concise."},
                {"role": "user", "content": "Explain: gravity"}
            ]
        })))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(body)
        .create_async()
        .await;

    let gateway = NetworkGateway::default();
    let config = LLMConfig::new("openai", "sk-test", "gpt-4o-mini")
        .with_base_url(server.url())
        .with_streaming(StreamPolicy::new(8, 256));
    let provider = OpenAiProvider::new(config, &gateway).unwrap();

    let chunks = drain(&provider).await;

    let text: String = chunks.iter().map(|c| c.content.as_str()).collect();
    assert_eq!(text, "Gravity pulls mass.");
    assert_eq!(chunks.iter().filter(|c| c.done).count(), 1);
    let last = chunks.last().unwrap();
    assert!(last.done);
    assert_eq!(last.usage(), Some(TokenUsage::new(14, 4)));
    assert!(chunks[..chunks.len() - 1].iter().all(|c| c.content.chars().count() >= 8));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_openai_generate_returns_content_and_usage() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .match_body(Matcher::PartialJson(json!({"stream": false, "temperature": 0.5})))
        .with_status(200)
        .with_body(
            json!({
                "model": "gpt-4o-mini-2024-07-18",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "A force."}}],
                "usage": {"prompt_tokens": 10, "completion_tokens": 3, "total_tokens": 13}
            })
            .to_string(),
        )
        .create_async()
        .await;

    let gateway = NetworkGateway::default();
    let config = LLMConfig::new("openai", "sk-test", "gpt-4o-mini")
        .with_base_url(server.url())
        .with_temperature(0.5);
    let provider = OpenAiProvider::new(config, &gateway).unwrap();

    let generation = provider.generate(request()).await.unwrap();
    assert_eq!(generation.content, "A force.");
    assert_eq!(generation.usage, Some(TokenUsage::new(10, 3)));
    assert_eq!(generation.model, "gpt-4o-mini-2024-07-18");
    assert_eq!(generation.provider, "openai");
}

#[tokio::test]
async fn test_generate_retries_transient_errors() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/chat/completions")
        .with_status(503)
        .with_body(r#"{"message":"overloaded"}"#)
        .expect(2)
        .create_async()
        .await;

    let gateway = NetworkGateway::default();
    let config = LLMConfig::new("openai", "sk-test", "gpt-4o-mini").with_base_url(server.url());
    let provider = OpenAiProvider::new(config, &gateway)
        .unwrap()
        .with_retry_policy(fast_retry(2));

    let err = provider.generate(request()).await.unwrap_err();
    assert_eq!(err.provider, "openai");
    assert!(err.message.contains("overloaded"));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_generate_does_not_retry_client_errors() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/messages")
        .with_status(401)
        .with_body(r#"{"type":"error","error":{"type":"authentication_error"},"message":"invalid x-api-key"}"#)
        .expect(1)
        .create_async()
        .await;

    let gateway = NetworkGateway::default();
    let config = LLMConfig::new("anthropic", "bad", "claude-3-5-haiku-latest").with_base_url(server.url());
    let provider = AnthropicProvider::new(config, &gateway)
        .unwrap()
        .with_retry_policy(fast_retry(3));

    let err = provider.generate(request()).await.unwrap_err();
    assert!(!err.retryable);
    assert!(err.message.contains("invalid x-api-key"));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_anthropic_stream_accumulates_usage() {
    let mut server = mockito::Server::new_async().await;
    let body = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"usage\":{\"input_tokens\":25,\"output_tokens\":1}}}\n\n",
        "event: content_block_start\n",
        "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
        "event: ping\n",
        "data: {\"type\":\"ping\"}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\" there\"}}\n\n",
        "event: content_block_stop\n",
        "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":15}}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );
    let mock = server
        .mock("POST", "/messages")
        .match_header("x-api-key", "ak-test")
        .match_header("anthropic-version", "2023-06-01")
        .match_body(Matcher::PartialJson(json!({
            "system": "Be concise.",
            "stream": true,
            "max_tokens": 4096
        })))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(body)
        .create_async()
        .await;

    let gateway = NetworkGateway::default();
    let config = LLMConfig::new("anthropic", "ak-test", "claude-3-5-haiku-latest").with_base_url(server.url());
    let provider = ProviderFactory::create(config, &gateway).unwrap();

    let chunks = drain(provider.as_ref()).await;

    let last = chunks.last().unwrap();
    assert!(last.done);
    assert_eq!(
        chunks.iter().map(|c| c.content.as_str()).collect::<String>(),
        "Hello there"
    );
    assert_eq!(
        last.usage(),
        Some(TokenUsage {
            prompt_tokens: 25,
            completion_tokens: 16,
            total_tokens: 41
        })
    );
    mock.assert_async().await;
}

#[tokio::test]
async fn test_anthropic_stream_error_event_is_terminal() {
    let mut server = mockito::Server::new_async().await;
    let body = concat!(
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Par\"}}\n\n",
        "event: error\n",
        "data: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n",
    );
    server
        .mock("POST", "/messages")
        .with_status(200)
        .with_body(body)
        .create_async()
        .await;

    let gateway = NetworkGateway::default();
    let config = LLMConfig::new("anthropic", "ak", "claude-3-5-haiku-latest").with_base_url(server.url());
    let provider = AnthropicProvider::new(config, &gateway).unwrap();

    let chunks = drain(&provider).await;
    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].done);
    assert_eq!(chunks[0].content, "Par");
    assert_eq!(chunks[0].metadata.error.as_deref(), Some("anthropic error: Overloaded"));
}

#[tokio::test]
async fn test_openai_stream_cut_before_done_is_an_error() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body("data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Gravity is a \"}}],\"usage\":null}\n\n")
        .create_async()
        .await;

    let gateway = NetworkGateway::default();
    let config = LLMConfig::new("openai", "sk-test", "gpt-4o-mini").with_base_url(server.url());
    let provider = OpenAiProvider::new(config, &gateway).unwrap();

    let chunks = drain(&provider).await;
    assert_eq!(chunks.iter().filter(|c| c.done).count(), 1);
    let last = chunks.last().unwrap();
    assert!(last.is_error());
    assert_eq!(last.content, "Gravity is a ");
    assert_eq!(
        last.metadata.error.as_deref(),
        Some("openai error: stream ended before completion")
    );
}

#[tokio::test]
async fn test_anthropic_stream_cut_before_message_stop_is_an_error() {
    let mut server = mockito::Server::new_async().await;
    let body = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"usage\":{\"input_tokens\":5,\"output_tokens\":1}}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Gravity is a \"}}\n\n",
    );
    server
        .mock("POST", "/messages")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(body)
        .create_async()
        .await;

    let gateway = NetworkGateway::default();
    let config = LLMConfig::new("anthropic", "ak", "claude-3-5-haiku-latest").with_base_url(server.url());
    let provider = AnthropicProvider::new(config, &gateway).unwrap();

    let chunks = drain(&provider).await;
    let last = chunks.last().unwrap();
    assert!(last.done);
    assert!(last.is_error());
    assert_eq!(last.usage(), None);
    assert_eq!(
        last.metadata.error.as_deref(),
        Some("anthropic error: stream ended before completion")
    );
}

#[tokio::test]
async fn test_stream_rejected_before_first_byte_is_an_error() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(400)
        .with_body(r#"{"error":{"message":"bad"},"message":"model not found"}"#)
        .create_async()
        .await;

    let gateway = NetworkGateway::default();
    let config = LLMConfig::new("openai", "sk", "gpt-nope").with_base_url(server.url());
    let provider = OpenAiProvider::new(config, &gateway).unwrap();

    let err = provider.generate_stream(request()).await.err().unwrap();
    assert_eq!(err.provider, "openai");
    assert!(err.message.contains("model not found"));
}
