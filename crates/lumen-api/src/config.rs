use config::{Config as ConfigLoader, ConfigError, Environment, File};
use lumen_client::{CircuitBreakerConfig, GatewayConfig};
use lumen_llm::{LLMConfig, StreamPolicy};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub services: ServicesConfig,
    #[serde(default)]
    pub gateway: GatewaySettings,
    pub assistant: AssistantConfig,
    pub title: TitleConfig,
    #[serde(default)]
    pub credit: CreditConfig,
    pub logging: LoggingConfig,

    // Secrets (from ENV only). Unused when `credit.project_keys` is on.
    #[serde(default)]
    pub llm_api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Deadline for a handler to start its response; streamed bodies are not cut.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    300
}

/// Base URLs of the downstream services.
#[derive(Debug, Clone, Deserialize)]
pub struct ServicesConfig {
    pub message_store_url: String,
    pub credit_url: String,
    pub events_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl ServicesConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub half_open_max_calls: u32,
    pub max_idle_per_host: usize,
    pub max_connections: usize,
    pub keep_alive_ms: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            half_open_max_calls: 3,
            max_idle_per_host: 20,
            max_connections: 100,
            keep_alive_ms: 5_000,
        }
    }
}

impl GatewaySettings {
    pub fn to_gateway_config(&self, default_timeout: Duration) -> GatewayConfig {
        GatewayConfig {
            max_idle_per_host: self.max_idle_per_host,
            keep_alive: Duration::from_millis(self.keep_alive_ms),
            ..GatewayConfig::default()
        }
        .with_default_timeout(default_timeout)
        .with_max_connections(self.max_connections)
        .with_breaker(CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_millis(self.recovery_timeout_ms),
            half_open_max_calls: self.half_open_max_calls,
        })
    }
}

/// Model settings for the answering node.
#[derive(Debug, Clone, Deserialize)]
pub struct AssistantConfig {
    pub provider: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Vendor endpoint override, e.g. a proxy.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Earlier messages loaded from the thread as context.
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_history_limit() -> u32 {
    10
}

fn default_chunk_size() -> usize {
    100
}

fn default_buffer_size() -> usize {
    1024
}

impl AssistantConfig {
    pub fn llm_config(&self, api_key: &str) -> LLMConfig {
        let mut config = LLMConfig::new(&self.provider, api_key, &self.model)
            .with_temperature(self.temperature)
            .with_streaming(StreamPolicy::new(self.chunk_size, self.buffer_size));
        if let Some(max_tokens) = self.max_tokens {
            config = config.with_max_tokens(max_tokens);
        }
        if let Some(base_url) = &self.base_url {
            config = config.with_base_url(base_url);
        }
        config
    }
}

/// Small model used to name new threads. Provider and endpoint default to
/// the assistant's.
#[derive(Debug, Clone, Deserialize)]
pub struct TitleConfig {
    #[serde(default)]
    pub provider: Option<String>,
    pub model: String,
    #[serde(default = "default_title_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_title_enabled")]
    pub enabled: bool,
}

fn default_title_max_tokens() -> u32 {
    32
}

fn default_title_enabled() -> bool {
    true
}

impl TitleConfig {
    pub fn llm_config(&self, assistant: &AssistantConfig, api_key: &str) -> LLMConfig {
        let provider = self.provider.as_deref().unwrap_or(&assistant.provider);
        let config = LLMConfig::new(provider, api_key, &self.model)
            .with_temperature(0.3)
            .with_max_tokens(self.max_tokens);
        match &assistant.base_url {
            Some(base_url) if self.provider.is_none() => config.with_base_url(base_url),
            _ => config,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreditConfig {
    /// Balances strictly below this floor are rejected.
    #[serde(default)]
    pub minimum_balance: f64,
    /// Fetch each caller's LLM key from the credit service.
    #[serde(default)]
    pub project_keys: bool,
}

impl Default for CreditConfig {
    fn default() -> Self {
        Self {
            minimum_balance: 0.0,
            project_keys: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Config {
    /// Load configuration from TOML files and environment variables
    ///
    /// Hierarchy (weakest to strongest):
    /// 1. config/default.toml
    /// 2. config/{ENV}.toml (if ENV is set)
    /// 3. Environment variables prefixed `LUMEN_`, sections split by `__`
    ///    (e.g. `LUMEN_SERVER__PORT`, `LUMEN_SERVICES__CREDIT_URL`)
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("ENV").unwrap_or_else(|_| "dev".to_string());

        let builder = ConfigLoader::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(
                Environment::with_prefix("LUMEN")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut cfg: Config = builder.build()?.try_deserialize()?;

        // Secrets are never read from TOML
        cfg.llm_api_key = match std::env::var("LLM_API_KEY") {
            Ok(key) => key,
            Err(_) if cfg.credit.project_keys => String::new(),
            Err(_) => {
                return Err(ConfigError::Message(
                    "LLM_API_KEY environment variable is required unless credit.project_keys is enabled"
                        .to_string(),
                ))
            }
        };

        Ok(cfg)
    }

    /// Load config from a specific path (useful for testing)
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        ConfigLoader::builder()
            .add_source(File::from(path.as_ref()))
            .build()?
            .try_deserialize()
    }
}
