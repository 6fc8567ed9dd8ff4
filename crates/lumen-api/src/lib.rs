//! Message orchestration service.
//!
//! Accepts a user message, checks the caller's credit, persists the turn
//! through the message store and streams the assistant's answer back as
//! server-sent events, with usage reporting and thread naming done in the
//! background.

pub mod config;
pub mod error;
pub mod middleware;
pub mod orchestrator;
pub mod routes;
pub mod services;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use orchestrator::{BotProfile, MessageOrchestrator, OrchestratorError, OrchestratorSettings, SendMessage};
pub use routes::build_router;
pub use services::{CreditAccount, Downstream, NewMessage, ProjectApiKey, StoredMessage, UsageEvent};
pub use state::AppState;
