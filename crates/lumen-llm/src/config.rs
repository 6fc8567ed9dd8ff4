use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;
use crate::streaming::StreamChunk;

/// Observer invoked for every chunk a [`crate::StreamBuffer`] emits.
///
/// Errors are logged and swallowed; a failing observer never aborts the
/// stream.
pub type ChunkCallback = Arc<dyn Fn(&StreamChunk) -> anyhow::Result<()> + Send + Sync>;

/// How provider deltas are coalesced into chunks.
#[derive(Clone, Serialize, Deserialize)]
pub struct StreamPolicy {
    /// Pending characters that trigger a flush.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Hard ceiling on pending characters.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(skip)]
    pub callback: Option<ChunkCallback>,
}

fn default_chunk_size() -> usize {
    100
}

fn default_buffer_size() -> usize {
    1024
}

impl Default for StreamPolicy {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            buffer_size: default_buffer_size(),
            callback: None,
        }
    }
}

impl StreamPolicy {
    pub fn new(chunk_size: usize, buffer_size: usize) -> Self {
        Self {
            chunk_size,
            buffer_size,
            callback: None,
        }
    }

    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&StreamChunk) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be positive".to_string()));
        }
        if self.chunk_size > self.buffer_size {
            return Err(ConfigError::Invalid(format!(
                "chunk_size ({}) exceeds buffer_size ({})",
                self.chunk_size, self.buffer_size
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for StreamPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamPolicy")
            .field("chunk_size", &self.chunk_size)
            .field("buffer_size", &self.buffer_size)
            .field("callback", &self.callback.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Per-node model settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    /// Registry id, e.g. `"openai"` or `"anthropic"`.
    pub provider: String,

    #[serde(default, skip_serializing)]
    pub api_key: String,

    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Overrides the vendor endpoint, e.g. for a proxy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming: Option<StreamPolicy>,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

impl LLMConfig {
    pub fn new(
        provider: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: default_temperature(),
            max_tokens: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            base_url: None,
            streaming: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_streaming(mut self, policy: StreamPolicy) -> Self {
        self.streaming = Some(policy);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    /// Streaming policy, falling back to the defaults.
    pub fn stream_policy(&self) -> StreamPolicy {
        self.streaming.clone().unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::Invalid("model must not be empty".to_string()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::Invalid(format!(
                "temperature {} outside 0.0..=2.0",
                self.temperature
            )));
        }
        if let Some(policy) = &self.streaming {
            policy.validate()?;
        }
        Ok(())
    }
}

impl fmt::Debug for LLMConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LLMConfig")
            .field("provider", &self.provider)
            .field("api_key", &"***")
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("base_url", &self.base_url)
            .field("streaming", &self.streaming)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LLMConfig::new("openai", "sk-test", "gpt-4o-mini");
        assert_eq!(config.temperature, 0.7);
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.max_retries, 3);

        let policy = config.stream_policy();
        assert_eq!(policy.chunk_size, 100);
        assert_eq!(policy.buffer_size, 1024);
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: LLMConfig =
            serde_json::from_str(r#"{"provider":"anthropic","model":"claude-3-haiku"}"#).unwrap();
        assert_eq!(config.max_retries, 3);
        assert!(config.api_key.is_empty());
        assert!(config.streaming.is_none());
    }

    #[test]
    fn test_debug_redacts_key() {
        let config = LLMConfig::new("openai", "sk-very-secret", "gpt-4o");
        assert!(!format!("{config:?}").contains("sk-very-secret"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let hot = LLMConfig::new("openai", "k", "gpt-4o").with_temperature(3.5);
        assert!(hot.validate().is_err());

        let inverted = LLMConfig::new("openai", "k", "gpt-4o").with_streaming(StreamPolicy::new(200, 100));
        assert!(matches!(inverted.validate(), Err(ConfigError::Invalid(_))));
    }
}
