mod buffer;
mod chunk;

pub use buffer::StreamBuffer;
pub use chunk::{ChunkMetadata, StreamChunk};
