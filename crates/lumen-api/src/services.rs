//! Clients for the services the orchestrator depends on: the message store
//! (messages and thread names), the credit service (accounts and project LLM
//! keys) and the usage event sink.
//! Every response body is wrapped as `{"data": ...}`.

use lumen_client::{
    ClientError, ClientOptions, NetworkGateway, ServiceClient, ServiceRequest, ServiceResponse,
};
use lumen_llm::{Message, Role};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::ServicesConfig;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

/// The caller's credit account.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreditAccount {
    #[serde(default)]
    pub id: Option<String>,
    pub balance: f64,
    pub status: String,
}

impl CreditAccount {
    pub fn is_active(&self) -> bool {
        self.status == "ACTIVE"
    }
}

/// The LLM credential issued to the caller's project.
#[derive(Clone, PartialEq, Deserialize)]
pub struct ProjectApiKey {
    pub key: String,
}

impl std::fmt::Debug for ProjectApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectApiKey").field("key", &"<redacted>").finish()
    }
}

/// Message as written to the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewMessage {
    pub id: String,
    pub content: String,
    pub role: Role,
    pub parent_id: Option<String>,
    pub status: &'static str,
}

impl NewMessage {
    pub fn completed(id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            role,
            parent_id: None,
            status: "completed",
        }
    }

    pub fn with_parent(mut self, parent_id: Option<String>) -> Self {
        self.parent_id = parent_id;
        self
    }
}

/// Message as read back from the store.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub parent_id: Option<String>,
}

impl From<StoredMessage> for Message {
    fn from(stored: StoredMessage) -> Self {
        Message::new(stored.role, stored.content)
    }
}

/// Token consumption of one completed exchange.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEvent {
    pub account_id: Option<String>,
    pub model_name: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub request_id: String,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
}

/// Handles to every downstream service, sharing the gateway's pools and breakers.
#[derive(Clone)]
pub struct Downstream {
    messages: ServiceClient,
    credits: ServiceClient,
    events: ServiceClient,
}

impl Downstream {
    pub fn new(gateway: &NetworkGateway, config: &ServicesConfig) -> Result<Self, ClientError> {
        let options = ClientOptions::default().with_timeout(config.timeout());
        Ok(Self {
            messages: gateway.client_with(&config.message_store_url, options)?,
            credits: gateway.client_with(&config.credit_url, options)?,
            events: gateway.client_with(&config.events_url, options)?,
        })
    }

    pub async fn credit_account(&self) -> Result<CreditAccount, ClientError> {
        let response = self.credits.get("credits/me").await?;
        data(&response)
    }

    pub async fn project_api_key(&self) -> Result<ProjectApiKey, ClientError> {
        let response = self.credits.get("project-api-keys/me/current").await?;
        data(&response)
    }

    pub async fn post_message(
        &self,
        thread_id: &str,
        message: &NewMessage,
    ) -> Result<StoredMessage, ClientError> {
        let response = self
            .messages
            .post(&format!("messages/{thread_id}"), message)
            .await?;
        data(&response)
    }

    /// Most recent messages of `thread_id` written by `bot_id`'s conversation,
    /// oldest first.
    pub async fn recent_messages(
        &self,
        thread_id: &str,
        bot_id: &str,
        limit: u32,
    ) -> Result<Vec<StoredMessage>, ClientError> {
        let request = ServiceRequest::get(format!("messages/{thread_id}"))
            .query("skip", 0)
            .query("limit", limit)
            .query("group_by", bot_id);
        let response = self.messages.send(request).await?;
        data(&response)
    }

    pub async fn rename_thread(&self, thread_id: &str, name: &str) -> Result<(), ClientError> {
        self.messages
            .put(
                &format!("threads/{thread_id}/name"),
                &serde_json::json!({ "name": name }),
            )
            .await?;
        Ok(())
    }

    pub async fn emit_usage(&self, event: &UsageEvent) -> Result<(), ClientError> {
        self.events.post("events", event).await?;
        Ok(())
    }
}

fn data<T: DeserializeOwned>(response: &ServiceResponse) -> Result<T, ClientError> {
    Ok(response.json::<Envelope<T>>()?.data)
}
