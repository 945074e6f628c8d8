use bytes::Bytes;

/// One server-sent event as decoded off the wire.
///
/// `id` carries the `Last-Event-ID` value when the upstream emits `id:` lines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            id: None,
            event: None,
            data: data.into(),
        }
    }

    /// The OpenAI-family terminal marker line.
    pub fn is_done_marker(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Incremental SSE decoder fed with raw body chunks.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    id: Option<String>,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<SseEvent> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);

            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                self.finish_event(&mut events);
                continue;
            }

            if line.starts_with(':') {
                continue;
            }

            self.consume_field(&line);
        }

        events
    }

    /// Flush whatever is buffered at end of stream.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.ends_with('\r') {
                line.pop();
            }
            self.consume_field(&line);
        }
        self.finish_event(&mut events);
        events
    }

    fn consume_field(&mut self, line: &str) {
        if let Some(value) = line.strip_prefix("event:") {
            let value = value.trim_start();
            self.event = if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            };
            return;
        }
        if line == "event" {
            self.event = None;
            return;
        }

        if let Some(value) = line.strip_prefix("data:") {
            self.data_lines.push(value.trim_start().to_string());
            return;
        }
        if line == "data" {
            self.data_lines.push(String::new());
            return;
        }

        if let Some(value) = line.strip_prefix("id:") {
            let value = value.trim_start();
            if !value.contains('\u{0}') {
                self.id = Some(value.to_string());
            }
        }
    }

    fn finish_event(&mut self, events: &mut Vec<SseEvent>) {
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        let data = self.data_lines.join("\n");
        events.push(SseEvent {
            id: self.id.take(),
            event: self.event.take(),
            data,
        });
        self.data_lines.clear();
    }
}

/// Encode a single event back to wire form.
pub fn encode_sse_event(event: &SseEvent) -> String {
    let mut out = String::new();
    if let Some(id) = &event.id {
        out.push_str("id: ");
        out.push_str(id);
        out.push('\n');
    }
    if let Some(name) = &event.event {
        out.push_str("event: ");
        out.push_str(name);
        out.push('\n');
    }
    for line in event.data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_event_data_pairs() {
        let mut parser = SseParser::new();
        let events =
            parser.push_str("event: message_start\ndata: {\"a\":1}\n\ndata: [DONE]\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"a\":1}");
        assert!(events[1].is_done_marker());
    }

    #[test]
    fn joins_multi_line_data() {
        let mut parser = SseParser::new();
        let events = parser.push_str("data: one\ndata: two\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "one\ntwo");
    }

    #[test]
    fn retains_last_event_id() {
        let mut parser = SseParser::new();
        let events = parser.push_str("id: 42\ndata: x\n\n");
        assert_eq!(events[0].id.as_deref(), Some("42"));
    }

    #[test]
    fn split_chunks_reassemble() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: par").is_empty());
        let events = parser.push_str("tial\n\n");
        assert_eq!(events[0].data, "partial");
    }

    #[test]
    fn finish_flushes_trailing_event() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: tail").is_empty());
        let events = parser.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "tail");
    }

    #[test]
    fn encode_round_trips() {
        let event = SseEvent {
            id: None,
            event: Some("content_block_delta".to_string()),
            data: "{}".to_string(),
        };
        let mut parser = SseParser::new();
        let decoded = parser.push_str(&encode_sse_event(&event));
        assert_eq!(decoded, vec![event]);
    }
}
