//! Incremental parser for text/event-stream bodies.
//!
//! Chunks arrive at arbitrary boundaries, so the parser carries the trailing
//! partial line between feeds and only dispatches an event once it sees the
//! blank separator line.

#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseParser {
    partial_line: String,
    event_type: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one chunk and return every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.partial_line.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(pos) = self.partial_line.find('\n') {
            let line = self.partial_line[..pos].trim_end_matches('\r').to_string();
            self.partial_line.drain(..=pos);
            self.take_line(&line, &mut events);
        }
        events
    }

    fn take_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            if !self.data_lines.is_empty() {
                events.push(SseEvent {
                    event: self
                        .event_type
                        .take()
                        .unwrap_or_else(|| "message".to_string()),
                    data: self.data_lines.join("\n"),
                });
                self.data_lines.clear();
            } else {
                // An event field with no data dispatches nothing.
                self.event_type = None;
            }
            return;
        }

        if line.starts_with(':') {
            // Comment line, typically a keep-alive ping.
            return;
        }

        if let Some(value) = line.strip_prefix("event:") {
            self.event_type = Some(value.strip_prefix(' ').unwrap_or(value).to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            self.data_lines
                .push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
        // id: and retry: fields are ignored.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_event() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"event: endpoint\ndata: /messages?sessionId=abc\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "endpoint");
        assert_eq!(events[0].data, "/messages?sessionId=abc");
    }

    #[test]
    fn test_default_event_type_is_message() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: {\"jsonrpc\":\"2.0\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message");
    }

    #[test]
    fn test_chunk_split_mid_line() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"event: mes").is_empty());
        assert!(parser.feed(b"sage\ndata: hel").is_empty());
        let events = parser.feed(b"lo\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn test_multiline_data_joined_with_newline() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: line one\ndata: line two\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "line one\nline two");
    }

    #[test]
    fn test_crlf_line_endings() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"event: endpoint\r\ndata: /messages?sessionId=x\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "/messages?sessionId=x");
    }

    #[test]
    fn test_comment_lines_skipped() {
        let mut parser = SseParser::new();
        let events = parser.feed(b": ping\n\ndata: real\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "real");
    }

    #[test]
    fn test_no_space_after_colon() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"event:endpoint\ndata:/messages?sessionId=y\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "endpoint");
        assert_eq!(events[0].data, "/messages?sessionId=y");
    }

    #[test]
    fn test_multiple_events_in_one_chunk() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: a\n\ndata: b\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "a");
        assert_eq!(events[1].data, "b");
    }

    #[test]
    fn test_event_without_data_dispatches_nothing() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"event: keepalive\n\n").is_empty());
        // The dangling event type must not leak into the next event.
        let events = parser.feed(b"data: payload\n\n");
        assert_eq!(events[0].event, "message");
    }
}
