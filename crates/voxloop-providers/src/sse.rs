//! Incremental SSE (Server-Sent Events) parser.
//!
//! The line-level state machine is a plain struct fed with arbitrary byte
//! chunks, so it can be tested without a network stream; [`sse_events`]
//! adapts it over a `reqwest::Response` body.

use futures::Stream;
use tokio_stream::StreamExt;

/// A dispatched SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Accumulates lines across chunk boundaries and dispatches events on
/// blank lines, per the SSE framing rules.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of the response body; returns every event completed
    /// by this chunk, in order.
    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line = self.buffer[..newline].trim_end_matches('\r').to_string();
            self.buffer.drain(..=newline);

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
            } else if line.starts_with(':') {
                // comment line
            } else if let Some(value) = line.strip_prefix("event:") {
                self.event = Some(value.trim_start().to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data.push(value.trim_start().to_string());
            }
            // other fields (id, retry) are not used here
        }

        events
    }

    /// Dispatch any event still buffered when the stream ends.
    pub fn finish(&mut self) -> Option<SseEvent> {
        self.dispatch()
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        Some(SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

/// Parse a streaming response body as a stream of SSE events.
pub fn sse_events(response: reqwest::Response) -> impl Stream<Item = anyhow::Result<SseEvent>> {
    struct State {
        body: std::pin::Pin<
            Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>,
        >,
        parser: SseParser,
        ready: std::collections::VecDeque<SseEvent>,
        done: bool,
    }

    let state = State {
        body: Box::pin(response.bytes_stream()),
        parser: SseParser::new(),
        ready: std::collections::VecDeque::new(),
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.ready.pop_front() {
                return Some((Ok(event), state));
            }
            if state.done {
                return None;
            }
            match state.body.next().await {
                Some(Ok(chunk)) => {
                    let text = String::from_utf8_lossy(&chunk).into_owned();
                    state.ready.extend(state.parser.push(&text));
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(anyhow::anyhow!("SSE stream error: {e}")), state));
                }
                None => {
                    state.done = true;
                    if let Some(event) = state.parser.finish() {
                        state.ready.push_back(event);
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_event() {
        let mut parser = SseParser::new();
        let events = parser.push("data: hello\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
        assert_eq!(events[0].event, None);
    }

    #[test]
    fn test_event_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push("data: hel").is_empty());
        assert!(parser.push("lo\n").is_empty());
        let events = parser.push("\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn test_multi_line_data_joined_with_newline() {
        let mut parser = SseParser::new();
        let events = parser.push("data: one\ndata: two\n\n");
        assert_eq!(events[0].data, "one\ntwo");
    }

    #[test]
    fn test_named_event_and_comment() {
        let mut parser = SseParser::new();
        let events = parser.push(": keepalive\nevent: delta\ndata: {}\n\n");
        assert_eq!(events[0].event.as_deref(), Some("delta"));
        assert_eq!(events[0].data, "{}");
    }

    #[test]
    fn test_crlf_lines() {
        let mut parser = SseParser::new();
        let events = parser.push("data: hi\r\n\r\n");
        assert_eq!(events[0].data, "hi");
    }

    #[test]
    fn test_blank_line_without_data_dispatches_nothing() {
        let mut parser = SseParser::new();
        assert!(parser.push("\n\n\n").is_empty());
    }

    #[test]
    fn test_finish_flushes_trailing_event() {
        let mut parser = SseParser::new();
        assert!(parser.push("data: tail\n").is_empty());
        let event = parser.finish().unwrap();
        assert_eq!(event.data, "tail");
        assert!(parser.finish().is_none());
    }

    #[test]
    fn test_multiple_events_in_one_chunk() {
        let mut parser = SseParser::new();
        let events = parser.push("data: a\n\ndata: b\n\ndata: [DONE]\n\n");
        let data: Vec<_> = events.iter().map(|e| e.data.as_str()).collect();
        assert_eq!(data, vec!["a", "b", "[DONE]"]);
    }
}
