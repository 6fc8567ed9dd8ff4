//! Byte-level helpers for server-sent event streams.

pub mod buffering;
pub mod sse_parser;

pub use buffering::CircularLineBuffer;
pub use sse_parser::{parse_sse_stream, EventStream, ProviderEvent, SseEventParser, SseFrame};
