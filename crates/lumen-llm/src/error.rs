use lumen_client::ClientError;
use thiserror::Error;

/// Rejected configuration; raised before any network call is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown LLM provider: {0}")]
    UnknownProvider(String),

    #[error("invalid LLM configuration: {0}")]
    Invalid(String),
}

/// A vendor call failed. Vendor-specific failures never leak past this type.
#[derive(Debug, Clone, Error)]
#[error("{provider} error: {message}")]
pub struct ProviderError {
    pub provider: String,
    pub message: String,
    /// Whether repeating the call may succeed (timeouts, 429, 5xx).
    pub retryable: bool,
}

impl ProviderError {
    pub fn new(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn transient(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::new(provider, message)
        }
    }

    pub fn from_client(provider: impl Into<String>, err: ClientError) -> Self {
        Self {
            provider: provider.into(),
            retryable: err.is_transient(),
            message: err.to_string(),
        }
    }
}

/// Pending stream content would exceed the configured buffer size.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stream buffer overflow: {attempted} characters pending exceeds limit of {limit}")]
pub struct BufferOverflow {
    pub limit: usize,
    pub attempted: usize,
}

#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    BufferOverflow(#[from] BufferOverflow),
}

impl LlmError {
    /// Stable label for logs and error metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::Provider(_) => "ProviderError",
            Self::BufferOverflow(_) => "BufferOverflow",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_client_keeps_retryability() {
        let err = ProviderError::from_client(
            "openai",
            ClientError::Upstream {
                status_code: 429,
                message: "rate limited".to_string(),
            },
        );
        assert!(err.retryable);
        assert_eq!(err.to_string(), "openai error: upstream returned 429: rate limited");

        let err = ProviderError::from_client(
            "anthropic",
            ClientError::Upstream {
                status_code: 400,
                message: "bad model".to_string(),
            },
        );
        assert!(!err.retryable);
    }

    #[test]
    fn test_kind_labels() {
        let err: LlmError = ConfigError::UnknownProvider("gemini".into()).into();
        assert_eq!(err.kind(), "ConfigError");
        assert_eq!(err.to_string(), "unknown LLM provider: gemini");
    }
}
