use futures::{Stream, StreamExt};
use lumen_llm::{ChunkMetadata, LlmError, StreamChunk};
use serde_json::Value;
use std::pin::Pin;

use crate::context::NodeContext;
use crate::node::{ConversationNode, Hop, NodeError};

/// Chunks of one streamed chain. Borrows the node (and the caller's
/// context) for as long as it is polled.
pub type NodeStream<'a> = Pin<Box<dyn Stream<Item = StreamChunk> + Send + 'a>>;

impl ConversationNode {
    /// Streaming form of [`ConversationNode::process`].
    ///
    /// Routed and chained successors are forwarded in order, so the whole
    /// chain reads as one stream with a single terminal chunk. Only the
    /// terminal chunk of the last node keeps `done == true`. Failures at any
    /// point end the stream with an error chunk. Dropping the stream stops
    /// the upstream request.
    pub fn process_stream<'a>(
        &'a self,
        input: impl Into<String>,
        context: Option<&'a mut NodeContext>,
    ) -> NodeStream<'a> {
        let input = input.into();

        Box::pin(async_stream::stream! {
            let mut owned = None;
            let mut context = match context {
                Some(ctx) => Some(ctx),
                None if self.router.is_some() => Some(owned.insert(NodeContext::new(input.as_str()))),
                None => None,
            };

            let request = match self.prepare_turn(input, context.as_deref_mut()).await {
                Ok(request) => request,
                Err(err) => {
                    yield self.error_chunk(&err, String::new());
                    return;
                }
            };

            let mut upstream = match self.provider.generate_stream(request).await {
                Ok(stream) => stream,
                Err(err) => {
                    yield self.error_chunk(&NodeError::Llm(LlmError::from(err)), String::new());
                    return;
                }
            };

            let mut full = String::new();
            let mut terminal = None;
            while let Some(chunk) = upstream.next().await {
                full.push_str(&chunk.content);
                if chunk.done {
                    terminal = Some(chunk);
                    break;
                }
                yield self.forward(chunk);
            }
            drop(upstream);

            let mut terminal = match terminal {
                Some(chunk) => chunk,
                None => StreamChunk::error(format!(
                    "{} stream ended without a terminal chunk",
                    self.provider.name()
                )),
            };

            if terminal.is_error() {
                tracing::warn!(
                    node = %self.name,
                    error = terminal.metadata.error.as_deref().unwrap_or_default(),
                    "stream failed, response not recorded"
                );
                yield self.forward(terminal);
                return;
            }

            self.record_assistant(&full);
            tracing::info!(node = %self.name, chars = full.len(), "node stream completed");

            match self.next_hop(&full, context.as_deref_mut()).await {
                Err(err) => {
                    yield self.error_chunk(&err, terminal.content);
                }
                Ok(Hop::Terminal(decision)) => {
                    if let Some(decision) = decision {
                        terminal
                            .metadata
                            .extra
                            .insert("route_decision".to_string(), Value::String(decision.route_id));
                    }
                    yield self.forward(terminal);
                }
                Ok(Hop::Routed(next)) => match context {
                    Some(ctx) => {
                        if let Some(handoff) = demote(terminal) {
                            yield self.forward(handoff);
                        }
                        let next_input = ctx.current_input.clone();
                        let mut successor = next.process_stream(next_input, Some(ctx));
                        while let Some(chunk) = successor.next().await {
                            yield self.forward(chunk);
                        }
                    }
                    None => {
                        yield self.forward(terminal);
                    }
                },
                Ok(Hop::Chained(next)) => {
                    if let Some(handoff) = demote(terminal) {
                        yield self.forward(handoff);
                    }
                    let mut successor = next.process_stream(full, None);
                    while let Some(chunk) = successor.next().await {
                        yield self.forward(chunk);
                    }
                }
            }
        })
    }

    /// Tag the chunk with this node and hand it to the stream callback.
    fn forward(&self, mut chunk: StreamChunk) -> StreamChunk {
        if chunk.metadata.node.is_none() {
            chunk.metadata.node = Some(self.name.clone());
        }
        if let Some(callback) = &self.stream_callback {
            if let Err(e) = callback(&chunk) {
                tracing::warn!(node = %self.name, error = %e, "stream callback failed");
            }
        }
        chunk
    }

    fn error_chunk(&self, err: &NodeError, content: String) -> StreamChunk {
        tracing::error!(node = %self.name, error_type = err.kind(), error = %err, "node stream failed");
        let mut metadata = ChunkMetadata {
            is_final: true,
            error: Some(err.to_string()),
            ..ChunkMetadata::default()
        };
        metadata
            .extra
            .insert("error_type".to_string(), Value::String(err.kind().to_string()));
        self.forward(StreamChunk {
            content,
            done: true,
            metadata,
        })
    }
}

/// Turn a node's terminal chunk into a mid-chain chunk. Dropped when it
/// carries neither text nor usage.
fn demote(mut chunk: StreamChunk) -> Option<StreamChunk> {
    if chunk.content.is_empty() && chunk.metadata.usage.is_none() {
        return None;
    }
    chunk.done = false;
    chunk.metadata.is_final = false;
    Some(chunk)
}
