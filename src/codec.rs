//! Line codec
//!
//! Every message on the wire is a single UTF-8 line terminated by `\n`.
//! Decoding works on raw bytes so a multi-byte character split across two
//! reads is reassembled before it is turned into text.

/// Wire delimiter between messages
pub const DELIMITER: u8 = b'\n';

/// Encode one line of text as a newline-terminated UTF-8 frame.
///
/// Embedded newlines are not escaped; a `text` containing `\n` turns into
/// several lines on the receiving side.
pub fn encode_line(text: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(text.len() + 1);
    frame.extend_from_slice(text.as_bytes());
    frame.push(DELIMITER);
    frame
}

/// Split a buffer into every complete line it contains plus the unconsumed tail.
///
/// Never fails: invalid UTF-8 inside a line is replaced, and a buffer without
/// any delimiter comes back untouched as the remainder.
pub fn split_lines(buffer: &[u8]) -> (Vec<String>, &[u8]) {
    let mut lines = Vec::new();
    let mut rest = buffer;

    while let Some(pos) = rest.iter().position(|&b| b == DELIMITER) {
        lines.push(String::from_utf8_lossy(&rest[..pos]).into_owned());
        rest = &rest[pos + 1..];
    }

    (lines, rest)
}

/// Pending bytes for one connection that have not yet formed a full line
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes
    pub fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Remove and return the oldest complete line, if one is buffered
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.pending.iter().position(|&b| b == DELIMITER)?;
        let line = String::from_utf8_lossy(&self.pending[..pos]).into_owned();
        self.pending.drain(..=pos);
        Some(line)
    }

    /// Remove and return every complete line, keeping the remainder
    pub fn drain_lines(&mut self) -> Vec<String> {
        let (lines, rest) = split_lines(&self.pending);
        let consumed = self.pending.len() - rest.len();
        self.pending.drain(..consumed);
        lines
    }

    pub fn remainder(&self) -> &[u8] {
        &self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
