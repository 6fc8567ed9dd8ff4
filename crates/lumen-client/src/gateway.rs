use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig};
use crate::client::ServiceClient;
use crate::error::{ClientError, Result};

/// Pool and breaker settings shared by every client the gateway hands out.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Per-request timeout when the caller does not pick one.
    pub default_timeout: Duration,
    pub connect_timeout: Duration,
    /// Idle keep-alive connections retained per host.
    pub max_idle_per_host: usize,
    /// In-flight requests allowed per pooled client.
    pub max_connections: usize,
    /// How long an idle keep-alive connection survives.
    pub keep_alive: Duration,
    pub breaker: CircuitBreakerConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            max_idle_per_host: 20,
            max_connections: 100,
            keep_alive: Duration::from_secs(5),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn with_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }
}

/// Per-client knobs.
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    /// Overrides [`GatewayConfig::default_timeout`].
    pub timeout: Option<Duration>,
    /// Attach identity headers from the ambient [`crate::RequestContext`].
    /// Vendor clients turn this off so caller tokens never leave the network.
    pub propagate_identity: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            propagate_identity: true,
        }
    }
}

impl ClientOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn without_identity(mut self) -> Self {
        self.propagate_identity = false;
        self
    }
}

#[derive(Debug)]
pub(crate) struct PooledClient {
    pub(crate) http: reqwest::Client,
    pub(crate) permits: Arc<Semaphore>,
}

/// Process-wide owner of pooled HTTP clients and circuit breakers.
///
/// Construct once at startup and share behind an `Arc`.
pub struct NetworkGateway {
    config: GatewayConfig,
    pools: DashMap<(String, Duration), Arc<PooledClient>>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl NetworkGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            pools: DashMap::new(),
            breakers: DashMap::new(),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Client for `base_url` with default options.
    pub fn client(&self, base_url: &str) -> Result<ServiceClient> {
        self.client_with(base_url, ClientOptions::default())
    }

    pub fn client_with(&self, base_url: &str, options: ClientOptions) -> Result<ServiceClient> {
        let base_url = normalize_base_url(base_url)?;
        let timeout = options.timeout.unwrap_or(self.config.default_timeout);
        let pool = self.pooled(&base_url, timeout)?;
        let breaker = self.breaker(&base_url);

        Ok(ServiceClient::new(
            base_url,
            timeout,
            options.propagate_identity,
            pool,
            breaker,
        ))
    }

    /// Breaker guarding `base_url`, created closed on first use.
    pub fn breaker(&self, base_url: &str) -> Arc<CircuitBreaker> {
        let key = base_url.trim_end_matches('/').to_string();
        self.breakers
            .entry(key.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.config.breaker.clone())))
            .clone()
    }

    pub fn breaker_snapshots(&self) -> Vec<(String, BreakerSnapshot)> {
        let mut snapshots: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect();
        snapshots.sort_by(|a, b| a.0.cmp(&b.0));
        snapshots
    }

    /// Number of distinct pooled clients built so far.
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    fn pooled(&self, base_url: &str, timeout: Duration) -> Result<Arc<PooledClient>> {
        let key = (base_url.to_string(), timeout);
        if let Some(existing) = self.pools.get(&key) {
            return Ok(existing.clone());
        }

        // Total timeouts are applied per request so streamed bodies can outlive them.
        let http = reqwest::Client::builder()
            .connect_timeout(self.config.connect_timeout.min(timeout))
            .pool_max_idle_per_host(self.config.max_idle_per_host)
            .pool_idle_timeout(self.config.keep_alive)
            .build()
            .map_err(|e| ClientError::Setup(e.to_string()))?;

        let built = Arc::new(PooledClient {
            http,
            permits: Arc::new(Semaphore::new(self.config.max_connections.max(1))),
        });

        tracing::debug!(base_url, timeout_ms = timeout.as_millis() as u64, "created pooled client");

        // A concurrent caller may have won the race; keep whichever landed first.
        Ok(self.pools.entry(key).or_insert(built).clone())
    }
}

impl Default for NetworkGateway {
    fn default() -> Self {
        Self::new(GatewayConfig::default())
    }
}

fn normalize_base_url(base_url: &str) -> Result<String> {
    let trimmed = base_url.trim().trim_end_matches('/');
    reqwest::Url::parse(trimmed)
        .map_err(|e| ClientError::InvalidRequest(format!("invalid base url {base_url:?}: {e}")))?;
    Ok(trimmed.to_string())
}
