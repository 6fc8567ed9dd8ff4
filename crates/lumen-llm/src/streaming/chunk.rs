use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::types::TokenUsage;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// 1-based position of this chunk in its stream.
    #[serde(default)]
    pub chunk_index: u32,

    /// Characters emitted so far, this chunk included.
    #[serde(default)]
    pub total_length: usize,

    #[serde(default)]
    pub is_final: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,

    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// One unit of streamed text.
///
/// Exactly one chunk per stream has `done == true` and it is always the last.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub content: String,
    pub done: bool,
    #[serde(default)]
    pub metadata: ChunkMetadata,
}

impl StreamChunk {
    /// Terminal chunk reporting a failure.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: String::new(),
            done: true,
            metadata: ChunkMetadata {
                is_final: true,
                error: Some(message.into()),
                ..ChunkMetadata::default()
            },
        }
    }

    pub fn is_error(&self) -> bool {
        self.metadata.error.is_some()
    }

    pub fn usage(&self) -> Option<TokenUsage> {
        self.metadata.usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_chunk_is_terminal() {
        let chunk = StreamChunk::error("openai error: boom");
        assert!(chunk.done);
        assert!(chunk.metadata.is_final);
        assert!(chunk.is_error());
        assert!(chunk.content.is_empty());
    }

    #[test]
    fn test_metadata_serialization_skips_empty_fields() {
        let mut chunk = StreamChunk {
            content: "hi".to_string(),
            done: false,
            metadata: ChunkMetadata {
                chunk_index: 1,
                total_length: 2,
                ..ChunkMetadata::default()
            },
        };
        chunk
            .metadata
            .extra
            .insert("route_decision".to_string(), serde_json::json!("to_factual"));

        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "content": "hi",
                "done": false,
                "metadata": {
                    "chunk_index": 1,
                    "total_length": 2,
                    "is_final": false,
                    "route_decision": "to_factual"
                }
            })
        );
    }
}
