use lumen_client::{ClientError, NetworkGateway};
use std::sync::Arc;

use crate::config::Config;
use crate::orchestrator::{BotProfile, MessageOrchestrator, OrchestratorSettings};
use crate::services::Downstream;

/// Shared application state passed to all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub gateway: Arc<NetworkGateway>,
    pub orchestrator: Arc<MessageOrchestrator>,
}

impl AppState {
    /// Build the gateway, downstream clients and orchestrator from config.
    pub fn new(config: Config) -> Result<Self, ClientError> {
        let gateway = Arc::new(NetworkGateway::new(
            config.gateway.to_gateway_config(config.services.timeout()),
        ));
        let downstream = Downstream::new(&gateway, &config.services)?;

        let settings = OrchestratorSettings {
            minimum_balance: config.credit.minimum_balance,
            history_limit: config.assistant.history_limit,
            project_keys: config.credit.project_keys,
            title: config
                .title
                .enabled
                .then(|| config.title.llm_config(&config.assistant, &config.llm_api_key)),
            ..OrchestratorSettings::default()
        };
        let orchestrator = Arc::new(MessageOrchestrator::new(gateway.clone(), downstream, settings));

        Ok(Self {
            config: Arc::new(config),
            gateway,
            orchestrator,
        })
    }

    /// Profile every bot answers with; bot records live outside this service.
    pub fn bot_profile(&self) -> BotProfile {
        BotProfile {
            system_prompt: self.config.assistant.system_prompt.clone(),
            llm: self.config.assistant.llm_config(&self.config.llm_api_key),
        }
    }
}
