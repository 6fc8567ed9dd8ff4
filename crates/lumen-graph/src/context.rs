use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// State shared by every node along one routed chain.
///
/// Created once per external call and threaded by `&mut` through each hop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeContext {
    pub original_input: String,
    pub current_input: String,
    #[serde(default)]
    pub system_prompt_additions: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// Routed transitions taken so far.
    #[serde(default)]
    pub hops: u32,
}

impl NodeContext {
    pub fn new(input: impl Into<String>) -> Self {
        let input = input.into();
        Self {
            current_input: input.clone(),
            original_input: input,
            ..Self::default()
        }
    }

    /// Fold a matched route into the context before handing it to the
    /// successor.
    pub fn apply(&mut self, decision: &RouteDecision) {
        if let Some(addition) = &decision.system_prompt_additions {
            self.system_prompt_additions.push(addition.clone());
        }
        self.current_input = decision
            .user_input_transform
            .clone()
            .unwrap_or_else(|| self.original_input.clone());
        self.metadata
            .extend(decision.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.hops += 1;
    }
}

/// A router's verdict on where the chain goes next.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub route_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_input_transform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_additions: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl RouteDecision {
    pub fn to(route_id: impl Into<String>) -> Self {
        Self {
            route_id: route_id.into(),
            ..Self::default()
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.user_input_transform = Some(input.into());
        self
    }

    pub fn with_system_addition(mut self, addition: impl Into<String>) -> Self {
        self.system_prompt_additions = Some(addition.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_updates_context() {
        let mut ctx = NodeContext::new("what is love?");
        let decision = RouteDecision::to("poet")
            .with_input("Write a poem about love")
            .with_system_addition("Rhyme.")
            .with_metadata("priority", "high");

        ctx.apply(&decision);

        assert_eq!(ctx.current_input, "Write a poem about love");
        assert_eq!(ctx.system_prompt_additions, vec!["Rhyme."]);
        assert_eq!(ctx.metadata["priority"], "high");
        assert_eq!(ctx.hops, 1);
    }

    #[test]
    fn test_apply_without_transform_restores_original_input() {
        let mut ctx = NodeContext::new("original");
        ctx.current_input = "rewritten".to_string();

        ctx.apply(&RouteDecision::to("next"));
        assert_eq!(ctx.current_input, "original");
    }
}
