use async_trait::async_trait;
use serde_json::Value;

use crate::context::{NodeContext, RouteDecision};

/// Picks a node's successor from its response.
#[async_trait]
pub trait Router: Send + Sync {
    async fn route(&self, response: &str, context: &NodeContext) -> anyhow::Result<RouteDecision>;

    /// Route ids this router can return, checked against the node's routes
    /// when it is built. `None` skips the check.
    fn declared_routes(&self) -> Option<Vec<String>> {
        None
    }
}

/// Adapts a synchronous closure into a [`Router`].
pub struct FnRouter<F> {
    route_fn: F,
    declared: Option<Vec<String>>,
}

impl<F> FnRouter<F>
where
    F: Fn(&str, &NodeContext) -> RouteDecision + Send + Sync,
{
    pub fn new(route_fn: F) -> Self {
        Self {
            route_fn,
            declared: None,
        }
    }

    pub fn declaring<I, S>(mut self, routes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.declared = Some(routes.into_iter().map(Into::into).collect());
        self
    }
}

#[async_trait]
impl<F> Router for FnRouter<F>
where
    F: Fn(&str, &NodeContext) -> RouteDecision + Send + Sync,
{
    async fn route(&self, response: &str, context: &NodeContext) -> anyhow::Result<RouteDecision> {
        Ok((self.route_fn)(response, context))
    }

    fn declared_routes(&self) -> Option<Vec<String>> {
        self.declared.clone()
    }
}

/// Reads a routing verdict the model wrote as JSON.
///
/// Expects `{"route_id": ..., "guidance"?: ..., "input"?: ..., ...}`,
/// optionally wrapped in a ```json fence. `guidance` becomes a system prompt
/// addition, `input` the successor's input, and every other field is
/// copied into the decision metadata. Unparseable output goes to the
/// fallback route.
pub struct JsonRouter {
    routes: Vec<String>,
    fallback: String,
}

impl JsonRouter {
    pub fn new<I, S>(routes: I, fallback: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            routes: routes.into_iter().map(Into::into).collect(),
            fallback: fallback.into(),
        }
    }

    fn parse(&self, response: &str) -> Option<RouteDecision> {
        let cleaned = strip_code_fence(response);
        let Value::Object(mut fields) = serde_json::from_str::<Value>(cleaned).ok()? else {
            return None;
        };
        let route_id = match fields.remove("route_id")? {
            Value::String(id) => id,
            _ => return None,
        };

        let mut decision = RouteDecision::to(route_id);
        if let Some(Value::String(guidance)) = fields.remove("guidance") {
            decision = decision.with_system_addition(format!("Additional context: {guidance}"));
        }
        if let Some(Value::String(input)) = fields.remove("input") {
            decision = decision.with_input(input);
        }
        decision.metadata.extend(fields);
        Some(decision)
    }
}

#[async_trait]
impl Router for JsonRouter {
    async fn route(&self, response: &str, _context: &NodeContext) -> anyhow::Result<RouteDecision> {
        match self.parse(response) {
            Some(decision) => Ok(decision),
            None => {
                tracing::debug!(fallback = %self.fallback, "routing response not parseable, using fallback");
                Ok(RouteDecision::to(self.fallback.clone()))
            }
        }
    }

    fn declared_routes(&self) -> Option<Vec<String>> {
        let mut routes = self.routes.clone();
        if !routes.contains(&self.fallback) {
            routes.push(self.fallback.clone());
        }
        Some(routes)
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(body) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = body.strip_prefix("json").unwrap_or(body);
    body.strip_suffix("```").unwrap_or(body).trim()
}
