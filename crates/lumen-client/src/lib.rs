//! Resilient HTTP access to downstream services.
//!
//! A single [`NetworkGateway`] owns one pooled connection set per
//! `(base_url, timeout)` pair and one [`CircuitBreaker`] per base URL.
//! [`ServiceClient`] handles are cheap to clone and share those resources.
//! Identity headers are read from the ambient [`RequestContext`] on every call.

pub mod breaker;
pub mod client;
pub mod context;
pub mod error;
pub mod gateway;

pub use breaker::{Admission, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use client::{ByteStream, ServiceClient, ServiceRequest, ServiceResponse, StreamingResponse};
pub use context::RequestContext;
pub use error::{ClientError, Result};
pub use gateway::{ClientOptions, GatewayConfig, NetworkGateway};

pub use bytes::Bytes;
pub use reqwest::Method;
