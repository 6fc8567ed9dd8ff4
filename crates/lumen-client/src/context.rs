use std::fmt;
use std::future::Future;

tokio::task_local! {
    static CURRENT: RequestContext;
}

pub const AUTHORIZATION: &str = "authorization";
pub const TENANT_HEADER: &str = "x-tenant-id";
pub const USER_HEADER: &str = "x-user-id";
pub const PROJECT_HEADER: &str = "x-project-id";

/// Caller identity for the request being served.
///
/// Installed for the lifetime of a task with [`RequestContext::scope`] and
/// read back by [`crate::ServiceClient`] when it builds outbound headers, so
/// code between the HTTP surface and the gateway never threads it by hand.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub bearer_token: Option<String>,
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub project_id: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Run `fut` with this context installed as the ambient identity.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT.scope(self, fut).await
    }

    /// Ambient context of the running task, if one was installed.
    pub fn current() -> Option<RequestContext> {
        CURRENT.try_with(Clone::clone).ok()
    }

    /// Outbound headers for the populated fields.
    pub fn header_pairs(&self) -> Vec<(&'static str, String)> {
        let mut headers = Vec::with_capacity(4);
        if let Some(token) = &self.bearer_token {
            headers.push((AUTHORIZATION, format!("Bearer {token}")));
        }
        if let Some(tenant) = &self.tenant_id {
            headers.push((TENANT_HEADER, tenant.clone()));
        }
        if let Some(user) = &self.user_id {
            headers.push((USER_HEADER, user.clone()));
        }
        if let Some(project) = &self.project_id {
            headers.push((PROJECT_HEADER, project.clone()));
        }
        headers
    }

    pub fn is_empty(&self) -> bool {
        self.bearer_token.is_none()
            && self.tenant_id.is_none()
            && self.user_id.is_none()
            && self.project_id.is_none()
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "***"))
            .field("tenant_id", &self.tenant_id)
            .field("user_id", &self.user_id)
            .field("project_id", &self.project_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_context_visible_inside_scope_only() {
        assert!(RequestContext::current().is_none());

        let ctx = RequestContext::new().with_user_id("u-1").with_tenant_id("t-1");
        let seen = ctx.clone().scope(async { RequestContext::current() }).await;

        assert_eq!(seen, Some(ctx));
        assert!(RequestContext::current().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_scopes_are_isolated() {
        let a = tokio::spawn(
            RequestContext::new()
                .with_user_id("alice")
                .scope(async {
                    tokio::task::yield_now().await;
                    RequestContext::current().and_then(|c| c.user_id)
                }),
        );
        let b = tokio::spawn(
            RequestContext::new()
                .with_user_id("bob")
                .scope(async {
                    tokio::task::yield_now().await;
                    RequestContext::current().and_then(|c| c.user_id)
                }),
        );

        assert_eq!(a.await.unwrap().as_deref(), Some("alice"));
        assert_eq!(b.await.unwrap().as_deref(), Some("bob"));
    }

    #[test]
    fn test_header_pairs_skip_missing_fields() {
        let ctx = RequestContext::new().with_bearer_token("tok").with_project_id("p-9");
        let headers = ctx.header_pairs();

        assert_eq!(
            headers,
            vec![
                (AUTHORIZATION, "Bearer tok".to_string()),
                (PROJECT_HEADER, "p-9".to_string()),
            ]
        );
    }

    #[test]
    fn test_debug_redacts_token() {
        let ctx = RequestContext::new().with_bearer_token("secret-token");
        let rendered = format!("{ctx:?}");
        assert!(!rendered.contains("secret-token"));
    }
}
