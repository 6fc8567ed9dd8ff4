use std::collections::VecDeque;

/// Line splitter for chunked byte streams.
///
/// Bytes are only decoded once a full line is available, so multi-byte
/// characters split across network reads come out intact.
pub struct CircularLineBuffer {
    buffer: VecDeque<u8>,
}

impl CircularLineBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity),
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend(bytes);
    }

    /// Next complete line without its terminator (`\n` or `\r\n`).
    pub fn next_line(&mut self) -> Option<Result<String, std::str::Utf8Error>> {
        let newline_pos = self.buffer.iter().position(|&b| b == b'\n')?;
        let line_bytes: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
        Some(decode_line(&line_bytes))
    }

    /// Whatever is left after the final newline, consumed.
    pub fn take_remainder(&mut self) -> Option<Result<String, std::str::Utf8Error>> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest: Vec<u8> = self.buffer.drain(..).collect();
        Some(decode_line(&rest))
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

fn decode_line(bytes: &[u8]) -> Result<String, std::str::Utf8Error> {
    std::str::from_utf8(bytes).map(|line| line.trim_end_matches(['\r', '\n']).to_string())
}
