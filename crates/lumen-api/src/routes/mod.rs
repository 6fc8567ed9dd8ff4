pub mod health;
pub mod messages;

use axum::{
    http::Method,
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::middleware::{context, logging};
use crate::state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    let timeout = Duration::from_secs(state.config.server.request_timeout_secs);

    let api_routes = Router::new()
        .route("/health", get(health::health_check))
        .route(
            "/bots/:bot_id/threads/:thread_id/messages",
            post(messages::send_message),
        );

    Router::new()
        .merge(api_routes)
        .layer(middleware::from_fn(context::request_context))
        .layer(middleware::from_fn(logging::log_request))
        .layer(TimeoutLayer::new(timeout))
        .layer(
            CorsLayer::new()
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers(Any)
                .allow_origin(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
