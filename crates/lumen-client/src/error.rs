use thiserror::Error;

/// Failures surfaced by [`crate::ServiceClient`].
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("connection to {url} failed: {message}")]
    Connection { url: String, message: String },

    #[error("service unavailable: circuit open for {service}")]
    CircuitOpen { service: String },

    #[error("upstream returned {status_code}: {message}")]
    Upstream { status_code: u16, message: String },

    #[error("failed to decode response from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to build HTTP client: {0}")]
    Setup(String),
}

impl ClientError {
    /// Whether this outcome counts against the circuit breaker.
    ///
    /// Client-side rejections (4xx) are the caller's fault and leave the
    /// breaker untouched.
    pub fn counts_as_failure(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Connection { .. } => true,
            Self::Upstream { status_code, .. } => *status_code >= 500,
            _ => false,
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Connection { .. } => true,
            Self::Upstream { status_code, .. } => *status_code >= 500 || *status_code == 429,
            _ => false,
        }
    }

    /// HTTP status reported by the upstream, if one was received.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Upstream { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors_do_not_trip_breaker() {
        let not_found = ClientError::Upstream {
            status_code: 404,
            message: "missing".to_string(),
        };
        assert!(!not_found.counts_as_failure());
        assert!(!not_found.is_transient());

        let throttled = ClientError::Upstream {
            status_code: 429,
            message: "slow down".to_string(),
        };
        assert!(!throttled.counts_as_failure());
        assert!(throttled.is_transient());
    }

    #[test]
    fn test_server_and_transport_errors_trip_breaker() {
        let bad_gateway = ClientError::Upstream {
            status_code: 502,
            message: "bad gateway".to_string(),
        };
        assert!(bad_gateway.counts_as_failure());
        assert!(ClientError::Timeout { url: "http://x".into() }.counts_as_failure());
        assert!(!ClientError::CircuitOpen { service: "x".into() }.counts_as_failure());
    }
}
