mod message;
mod usage;

pub use message::{ConversationHistory, Message, Role};
pub use usage::{TokenUsage, UsageAccumulator, UsageReport};
