//! Server-Sent Events framing.

/// `data: <payload>\n\n`
pub fn data(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(b"data: ");
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\n\n");
    out
}

/// `event: <name>\ndata: <payload>\n\n`
pub fn event(name: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + name.len() + 16);
    out.extend_from_slice(b"event: ");
    out.extend_from_slice(name.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(&data(payload));
    out
}

/// Incremental decoder for an upstream event stream. Bytes may arrive split
/// at arbitrary positions; complete events are returned as the joined value
/// of their `data:` lines.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<u8>,
    has_data: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            self.handle_line(&line, &mut events);
        }
        events
    }

    /// Flush an unterminated trailing event when the stream ends.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.handle_line(&line, &mut events);
        }
        self.handle_line(b"", &mut events);
        events.pop()
    }

    fn handle_line(&mut self, line: &[u8], events: &mut Vec<Vec<u8>>) {
        if line.is_empty() {
            if self.has_data {
                events.push(std::mem::take(&mut self.data));
                self.has_data = false;
            }
            return;
        }
        if let Some(rest) = line.strip_prefix(b"data:") {
            let rest = rest.strip_prefix(b" ").unwrap_or(rest);
            if self.has_data {
                self.data.push(b'\n');
            }
            self.data.extend_from_slice(rest);
            self.has_data = true;
        }
        // event:, id:, retry: and comments are not needed: every supported
        // provider repeats the event type inside the JSON payload.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames() {
        assert_eq!(data(b"[DONE]"), b"data: [DONE]\n\n".to_vec());
        assert_eq!(event("ping", b"{}"), b"event: ping\ndata: {}\n\n".to_vec());
    }

    #[test]
    fn decoder_handles_split_chunks() {
        let mut d = SseDecoder::new();
        assert!(d.feed(b"event: message_start\nda").is_empty());
        let events = d.feed(b"ta: {\"a\":1}\n\n: comment\ndata: x\r\n\r\ndata: tail");
        assert_eq!(events, vec![b"{\"a\":1}".to_vec(), b"x".to_vec()]);
        assert_eq!(d.finish(), Some(b"tail".to_vec()));
        assert_eq!(d.finish(), None);
    }

    #[test]
    fn multiline_data_is_joined() {
        let mut d = SseDecoder::new();
        let events = d.feed(b"data: a\ndata: b\n\n");
        assert_eq!(events, vec![b"a\nb".to_vec()]);
    }
}
