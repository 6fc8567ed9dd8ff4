use std::mem;

use crate::config::StreamPolicy;
use crate::error::BufferOverflow;
use crate::streaming::{ChunkMetadata, StreamChunk};
use crate::types::TokenUsage;

/// Coalesces small provider deltas into chunks of roughly `chunk_size`
/// characters.
///
/// Pending content is drained whole on every emit, so concatenating the
/// emitted chunks plus whatever is still pending always reproduces the input.
pub struct StreamBuffer {
    policy: StreamPolicy,
    source: Option<String>,
    pending: String,
    pending_chars: usize,
    chunk_index: u32,
    total_length: usize,
}

impl StreamBuffer {
    pub fn new(policy: StreamPolicy) -> Self {
        Self {
            policy,
            source: None,
            pending: String::new(),
            pending_chars: 0,
            chunk_index: 0,
            total_length: 0,
        }
    }

    /// Tag emitted chunks with the producing provider.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Buffer `content`; emit a chunk once `chunk_size` characters are
    /// pending, or when `done` and anything is pending.
    pub fn process_chunk(
        &mut self,
        content: &str,
        done: bool,
    ) -> Result<Option<StreamChunk>, BufferOverflow> {
        let incoming = content.chars().count();
        let attempted = self.pending_chars + incoming;
        if attempted > self.policy.buffer_size {
            return Err(BufferOverflow {
                limit: self.policy.buffer_size,
                attempted,
            });
        }

        self.pending.push_str(content);
        self.pending_chars = attempted;

        if self.pending_chars >= self.policy.chunk_size || (done && self.pending_chars > 0) {
            Ok(Some(self.emit(done, None, None)))
        } else {
            Ok(None)
        }
    }

    /// Drain pending content as a non-final chunk.
    pub fn flush(&mut self) -> Option<StreamChunk> {
        (self.pending_chars > 0).then(|| self.emit(false, None, None))
    }

    /// Close the stream: drain pending content into the one final chunk.
    ///
    /// Emits even when nothing is pending so every stream ends with exactly
    /// one `done` chunk carrying the usage totals.
    pub fn finalize(&mut self, usage: Option<TokenUsage>) -> StreamChunk {
        self.emit(true, usage, None)
    }

    /// Close the stream with an error, keeping any pending content.
    pub fn fail(&mut self, message: impl Into<String>) -> StreamChunk {
        self.emit(true, None, Some(message.into()))
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.pending_chars = 0;
        self.chunk_index = 0;
        self.total_length = 0;
    }

    pub fn pending(&self) -> &str {
        &self.pending
    }

    pub fn chunks_emitted(&self) -> u32 {
        self.chunk_index
    }

    fn emit(&mut self, done: bool, usage: Option<TokenUsage>, error: Option<String>) -> StreamChunk {
        let content = mem::take(&mut self.pending);
        self.chunk_index += 1;
        self.total_length += self.pending_chars;
        self.pending_chars = 0;

        let chunk = StreamChunk {
            content,
            done,
            metadata: ChunkMetadata {
                chunk_index: self.chunk_index,
                total_length: self.total_length,
                is_final: done,
                usage,
                error,
                provider: self.source.clone(),
                ..ChunkMetadata::default()
            },
        };

        if let Some(callback) = &self.policy.callback {
            if let Err(e) = callback(&chunk) {
                tracing::warn!(error = %e, chunk_index = chunk.metadata.chunk_index, "stream callback failed");
            }
        }
        chunk
    }
}
