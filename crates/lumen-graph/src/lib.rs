//! Conversation graph.
//!
//! A [`ConversationNode`] turns input into a prompt through its
//! [`PromptPolicy`], calls its provider, records the exchange in its own
//! history and then either stops, hands the context to a routed successor,
//! or chains its raw output into a single next node.

pub mod builder;
pub mod context;
pub mod node;
pub mod prompt;
pub mod router;
pub mod streaming;
pub mod transform;

pub use builder::NodeBuilder;
pub use context::{NodeContext, RouteDecision};
pub use node::{Condition, ConversationNode, NodeError, NodeResponse, ResponseMetadata, MAX_ROUTE_HOPS};
pub use prompt::{BuiltPrompt, InputType, PromptPolicy};
pub use router::{FnRouter, JsonRouter, Router};
pub use streaming::NodeStream;
pub use transform::{InputTransformer, JsonTransformer, TextNormalizer};
