use axum::{extract::Request, http::HeaderMap, middleware::Next, response::Response};
use lumen_client::context::{AUTHORIZATION, PROJECT_HEADER, TENANT_HEADER, USER_HEADER};
use lumen_client::RequestContext;

/// Installs the caller's identity as the ambient [`RequestContext`] for the
/// rest of the request. Tokens are forwarded as-is; validating them is the
/// auth service's job.
pub async fn request_context(req: Request, next: Next) -> Response {
    let context = context_from_headers(req.headers());
    context.scope(next.run(req)).await
}

pub fn context_from_headers(headers: &HeaderMap) -> RequestContext {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let mut context = RequestContext::new();
    if let Some(token) = header(AUTHORIZATION)
        .as_deref()
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        context = context.with_bearer_token(token.trim());
    }
    if let Some(tenant_id) = header(TENANT_HEADER) {
        context = context.with_tenant_id(tenant_id);
    }
    if let Some(user_id) = header(USER_HEADER) {
        context = context.with_user_id(user_id);
    }
    if let Some(project_id) = header(PROJECT_HEADER) {
        context = context.with_project_id(project_id);
    }
    context
}
