//! Provider-agnostic LLM access.
//!
//! Every vendor is driven through [`LlmProvider`]. Streaming output is
//! normalized into [`StreamChunk`]s that have been coalesced by a
//! [`StreamBuffer`], and the final chunk of every stream carries the
//! reconciled [`TokenUsage`] when the vendor reported it.

pub mod buffer_utils;
pub mod config;
pub mod error;
pub mod factory;
pub mod providers;
pub mod retry;
pub mod streaming;
pub mod types;

pub use config::{ChunkCallback, LLMConfig, StreamPolicy};
pub use error::{BufferOverflow, ConfigError, LlmError, ProviderError};
pub use factory::ProviderFactory;
pub use providers::{
    anthropic::AnthropicProvider, openai::OpenAiProvider, ChunkStream, Generation,
    GenerationRequest, LlmProvider,
};
pub use retry::RetryPolicy;
pub use streaming::{ChunkMetadata, StreamBuffer, StreamChunk};
pub use types::{ConversationHistory, Message, Role, TokenUsage, UsageAccumulator, UsageReport};
