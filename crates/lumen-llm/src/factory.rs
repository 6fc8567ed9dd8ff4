use lumen_client::NetworkGateway;
use std::sync::Arc;

use crate::config::LLMConfig;
use crate::error::ConfigError;
use crate::providers::{anthropic::AnthropicProvider, openai::OpenAiProvider, LlmProvider};

type Constructor = fn(LLMConfig, &NetworkGateway) -> Result<Arc<dyn LlmProvider>, ConfigError>;

/// Static registry of provider constructors, keyed by provider id.
const REGISTRY: &[(&str, Constructor)] = &[
    (crate::providers::openai::PROVIDER, build_openai),
    (crate::providers::anthropic::PROVIDER, build_anthropic),
];

fn build_openai(config: LLMConfig, gateway: &NetworkGateway) -> Result<Arc<dyn LlmProvider>, ConfigError> {
    Ok(Arc::new(OpenAiProvider::new(config, gateway)?))
}

fn build_anthropic(
    config: LLMConfig,
    gateway: &NetworkGateway,
) -> Result<Arc<dyn LlmProvider>, ConfigError> {
    Ok(Arc::new(AnthropicProvider::new(config, gateway)?))
}

/// Resolves [`LLMConfig::provider`] to an adapter.
pub struct ProviderFactory;

impl ProviderFactory {
    /// Build the adapter named by `config.provider` (case-insensitive).
    pub fn create(
        config: LLMConfig,
        gateway: &NetworkGateway,
    ) -> Result<Arc<dyn LlmProvider>, ConfigError> {
        let id = config.provider.trim().to_ascii_lowercase();
        let (_, construct) = REGISTRY
            .iter()
            .find(|(name, _)| *name == id)
            .ok_or_else(|| ConfigError::UnknownProvider(config.provider.clone()))?;

        tracing::debug!(provider = %id, model = %config.model, "creating provider");
        construct(config, gateway)
    }

    pub fn supported() -> impl Iterator<Item = &'static str> {
        REGISTRY.iter().map(|(name, _)| *name)
    }
}
