use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OwnedSemaphorePermit;

use crate::breaker::{Admission, CircuitBreaker};
use crate::context::RequestContext;
use crate::error::{ClientError, Result};
use crate::gateway::PooledClient;

/// Raw response body chunks from a streaming call.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Outbound request description, relative to a client's base URL.
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    method: Method,
    endpoint: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: Option<Value>,
}

impl ServiceRequest {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(Method::GET, endpoint)
    }

    pub fn post(endpoint: impl Into<String>) -> Self {
        Self::new(Method::POST, endpoint)
    }

    pub fn put(endpoint: impl Into<String>) -> Self {
        Self::new(Method::PUT, endpoint)
    }

    pub fn delete(endpoint: impl Into<String>) -> Self {
        Self::new(Method::DELETE, endpoint)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json_value(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn json<T: Serialize + ?Sized>(self, body: &T) -> Result<Self> {
        let value = serde_json::to_value(body)
            .map_err(|e| ClientError::InvalidRequest(format!("unserializable body: {e}")))?;
        Ok(self.json_value(value))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Fully buffered response.
#[derive(Debug, Clone)]
pub struct ServiceResponse {
    url: String,
    status: u16,
    body: String,
}

impl ServiceResponse {
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn text(&self) -> &str {
        &self.body
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body).map_err(|e| ClientError::Decode {
            url: self.url.clone(),
            message: e.to_string(),
        })
    }
}

/// Response whose body is consumed incrementally.
///
/// Holds a connection permit until the byte stream is dropped.
pub struct StreamingResponse {
    url: String,
    status: u16,
    response: reqwest::Response,
    permit: OwnedSemaphorePermit,
}

impl StreamingResponse {
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn into_byte_stream(self) -> ByteStream {
        let StreamingResponse {
            url,
            response,
            permit,
            ..
        } = self;

        Box::pin(response.bytes_stream().map(move |chunk| {
            let _held = &permit;
            chunk.map_err(|e| classify_transport(&url, e))
        }))
    }
}

/// Gives a half-open trial slot back if the call is dropped before the
/// breaker hears its outcome.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl TrialGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_trial();
        }
    }
}

/// Handle onto one downstream service.
///
/// Cheap to clone; all clones share the gateway's pooled connections and the
/// service's circuit breaker.
#[derive(Clone, Debug)]
pub struct ServiceClient {
    base_url: String,
    timeout: Duration,
    propagate_identity: bool,
    pool: Arc<PooledClient>,
    breaker: Arc<CircuitBreaker>,
}

impl ServiceClient {
    pub(crate) fn new(
        base_url: String,
        timeout: Duration,
        propagate_identity: bool,
        pool: Arc<PooledClient>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            base_url,
            timeout,
            propagate_identity,
            pool,
            breaker,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Issue `method endpoint` with an optional JSON body and extra headers.
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> Result<ServiceResponse> {
        let mut request = ServiceRequest::new(method, endpoint);
        if let Some(body) = body {
            request = request.json_value(body);
        }
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        self.send(request).await
    }

    pub async fn get(&self, endpoint: &str) -> Result<ServiceResponse> {
        self.send(ServiceRequest::get(endpoint)).await
    }

    pub async fn post<T: Serialize + ?Sized>(&self, endpoint: &str, body: &T) -> Result<ServiceResponse> {
        self.send(ServiceRequest::post(endpoint).json(body)?).await
    }

    pub async fn put<T: Serialize + ?Sized>(&self, endpoint: &str, body: &T) -> Result<ServiceResponse> {
        self.send(ServiceRequest::put(endpoint).json(body)?).await
    }

    pub async fn delete(&self, endpoint: &str) -> Result<ServiceResponse> {
        self.send(ServiceRequest::delete(endpoint)).await
    }

    /// Execute a request and buffer the whole body.
    ///
    /// 4xx responses surface as [`ClientError::Upstream`] without counting
    /// against the breaker; 5xx, timeouts and connection failures do.
    pub async fn send(&self, request: ServiceRequest) -> Result<ServiceResponse> {
        let url = self.url_for(request.endpoint());
        let method = request.method().clone();
        let trial = self.admit(&method, &url)?;
        let _permit = self.acquire_permit().await?;

        let started = Instant::now();
        let outcome = self.execute_buffered(&method, &url, request, started).await;
        self.settle(&method, &url, started, &outcome);
        trial.disarm();
        outcome
    }

    /// Execute a request and hand back the body as a byte stream.
    ///
    /// The breaker is settled once headers arrive; failures later in the
    /// body surface as stream items.
    pub async fn stream(&self, request: ServiceRequest) -> Result<StreamingResponse> {
        let url = self.url_for(request.endpoint());
        let method = request.method().clone();
        let trial = self.admit(&method, &url)?;
        let permit = self.acquire_permit().await?;

        let started = Instant::now();
        let outcome = self.execute_streaming(&method, &url, request, started).await;
        self.settle(&method, &url, started, &outcome);
        trial.disarm();

        let response = outcome?;
        Ok(StreamingResponse {
            status: response.status().as_u16(),
            url,
            response,
            permit,
        })
    }

    async fn execute_buffered(
        &self,
        method: &Method,
        url: &str,
        request: ServiceRequest,
        started: Instant,
    ) -> Result<ServiceResponse> {
        let response = self.dispatch(url, request, true).await?;
        let headers_ms = started.elapsed().as_millis() as u64;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| classify_transport(url, e))?;
        let total_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            method = %method,
            url,
            status,
            headers_ms,
            body_ms = total_ms.saturating_sub(headers_ms),
            total_ms,
            "downstream call completed"
        );

        if status >= 400 {
            return Err(ClientError::Upstream {
                status_code: status,
                message: extract_error_message(&body),
            });
        }
        Ok(ServiceResponse {
            url: url.to_string(),
            status,
            body,
        })
    }

    async fn execute_streaming(
        &self,
        method: &Method,
        url: &str,
        request: ServiceRequest,
        started: Instant,
    ) -> Result<reqwest::Response> {
        let response = self.dispatch(url, request, false).await?;
        let status = response.status().as_u16();
        tracing::info!(
            method = %method,
            url,
            status,
            headers_ms = started.elapsed().as_millis() as u64,
            "downstream stream opened"
        );

        if status >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Upstream {
                status_code: status,
                message: extract_error_message(&body),
            });
        }
        Ok(response)
    }

    fn admit(&self, method: &Method, url: &str) -> Result<TrialGuard<'_>> {
        let admission = self.breaker.acquire().inspect_err(|_| {
            tracing::warn!(method = %method, url, "circuit open, request rejected");
        })?;
        Ok(TrialGuard {
            breaker: &self.breaker,
            armed: admission == Admission::Trial,
        })
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        self.pool
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ClientError::Setup("connection pool closed".to_string()))
    }

    fn settle<T>(&self, method: &Method, url: &str, started: Instant, outcome: &Result<T>) {
        match outcome {
            Ok(_) => self.breaker.record_success(),
            Err(e) if e.counts_as_failure() => {
                self.breaker.record_failure();
                tracing::warn!(
                    method = %method,
                    url,
                    error = %e,
                    total_ms = started.elapsed().as_millis() as u64,
                    "downstream call failed"
                );
            }
            Err(e) => {
                self.breaker.record_success();
                tracing::debug!(method = %method, url, error = %e, "downstream call rejected");
            }
        }
    }

    /// Send the request and wait for response headers.
    ///
    /// With `bound_body` the client timeout also covers reading the body;
    /// otherwise it only covers the wait for headers.
    async fn dispatch(
        &self,
        url: &str,
        request: ServiceRequest,
        bound_body: bool,
    ) -> Result<reqwest::Response> {
        let ServiceRequest {
            method,
            query,
            headers,
            body,
            ..
        } = request;

        let mut builder = self.pool.http.request(method, url);
        if bound_body {
            builder = builder.timeout(self.timeout);
        }
        if !query.is_empty() {
            builder = builder.query(&query);
        }
        if self.propagate_identity {
            if let Some(ctx) = RequestContext::current() {
                for (name, value) in ctx.header_pairs() {
                    builder = builder.header(name, value);
                }
            }
        }
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        match tokio::time::timeout(self.timeout, builder.send()).await {
            Ok(sent) => sent.map_err(|e| classify_transport(url, e)),
            Err(_) => Err(ClientError::Timeout {
                url: url.to_string(),
            }),
        }
    }

    fn url_for(&self, endpoint: &str) -> String {
        if endpoint.is_empty() {
            return self.base_url.clone();
        }
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }
}

fn classify_transport(url: &str, err: reqwest::Error) -> ClientError {
    if err.is_timeout() {
        ClientError::Timeout {
            url: url.to_string(),
        }
    } else if err.is_builder() {
        ClientError::InvalidRequest(err.to_string())
    } else if err.is_decode() {
        ClientError::Decode {
            url: url.to_string(),
            message: err.to_string(),
        }
    } else {
        ClientError::Connection {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

/// Best human-readable message from an error body: JSON `detail`, then
/// `message`, then the raw text.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            ["detail", "message"]
                .iter()
                .find_map(|key| value.get(*key).and_then(Value::as_str).map(str::to_owned))
        })
        .unwrap_or_else(|| body.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_error_message_prefers_detail() {
        assert_eq!(
            extract_error_message(r#"{"detail":"quota exceeded","message":"other"}"#),
            "quota exceeded"
        );
        assert_eq!(extract_error_message(r#"{"message":"bad input"}"#), "bad input");
        assert_eq!(extract_error_message("plain failure\n"), "plain failure");
    }

    #[test]
    fn test_request_builder_collects_parts() {
        let request = ServiceRequest::get("messages/t-1")
            .query("skip", 0)
            .query("limit", 10)
            .header("x-trace", "abc");

        assert_eq!(request.method(), &Method::GET);
        assert_eq!(request.endpoint(), "messages/t-1");
        assert_eq!(request.query.len(), 2);
        assert_eq!(request.headers.len(), 1);
    }
}
