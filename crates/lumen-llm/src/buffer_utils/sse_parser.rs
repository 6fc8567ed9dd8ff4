use futures::{Stream, StreamExt};
use lumen_client::ByteStream;
use std::pin::Pin;

use super::buffering::CircularLineBuffer;
use crate::error::ProviderError;
use crate::types::UsageReport;

/// Vendor stream events, normalized.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    TextDelta(String),
    Usage(UsageReport),
    /// The vendor signalled a clean end of stream.
    Stop,
    /// The vendor reported an error inside the stream.
    Failed(String),
}

/// One dispatched server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Strategy for turning a vendor's SSE frames into [`ProviderEvent`]s.
pub trait SseEventParser: Send {
    fn parse_frame(&self, frame: &SseFrame) -> Result<Vec<ProviderEvent>, ProviderError>;

    /// Whether this data payload marks the end of the stream.
    fn is_done_marker(&self, data: &str) -> bool {
        data == "[DONE]"
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<ProviderEvent, ProviderError>> + Send>>;

/// Decode an SSE byte stream with `parser`.
///
/// Ends after a done marker, a [`ProviderEvent::Stop`], or the first error.
pub fn parse_sse_stream<P: SseEventParser + 'static>(
    provider: &'static str,
    bytes: ByteStream,
    parser: P,
) -> EventStream {
    Box::pin(async_stream::stream! {
        let mut bytes = bytes;
        let mut buffer = CircularLineBuffer::with_capacity(4096);
        let mut frame = SseFrame::default();
        let mut has_data = false;

        loop {
            let mut lines = Vec::new();
            let at_eof = match bytes.next().await {
                Some(Ok(chunk)) => {
                    buffer.extend(&chunk);
                    while let Some(line) = buffer.next_line() {
                        lines.push(line);
                    }
                    false
                }
                Some(Err(e)) => {
                    yield Err(ProviderError::from_client(provider, e));
                    return;
                }
                None => {
                    if let Some(line) = buffer.take_remainder() {
                        lines.push(line);
                    }
                    // Blank sentinel dispatches a frame left open at EOF.
                    lines.push(Ok(String::new()));
                    true
                }
            };

            for line in lines {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        yield Err(ProviderError::new(provider, format!("invalid UTF-8 in stream: {e}")));
                        return;
                    }
                };

                if line.is_empty() {
                    if !has_data {
                        frame.event = None;
                        continue;
                    }
                    let ready = std::mem::take(&mut frame);
                    has_data = false;

                    if parser.is_done_marker(&ready.data) {
                        yield Ok(ProviderEvent::Stop);
                        return;
                    }
                    match parser.parse_frame(&ready) {
                        Ok(events) => {
                            for event in events {
                                let terminal = matches!(event, ProviderEvent::Stop | ProviderEvent::Failed(_));
                                yield Ok(event);
                                if terminal {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                } else if line.starts_with(':') {
                    continue;
                } else if let Some(value) = field_value(&line, "event") {
                    frame.event = Some(value.to_string());
                } else if let Some(value) = field_value(&line, "data") {
                    if has_data {
                        frame.data.push('\n');
                    }
                    frame.data.push_str(value);
                    has_data = true;
                }
            }

            if at_eof {
                return;
            }
        }
    })
}

/// `field: value` or `field:value`.
fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}
