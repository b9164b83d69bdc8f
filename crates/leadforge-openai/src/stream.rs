// SSE streaming for the Responses API
//
// The provider emits one JSON object per SSE event; `type` selects the
// shape. Unknown types are preserved as Other so callers can log them
// without the parser failing on provider additions.

use std::pin::Pin;
use std::time::{Duration, Instant};

use futures::Stream;
use serde_json::Value;

use leadforge_core::{Result, WorkerError};

use crate::types::Response;

pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Events surfaced from the provider's SSE stream
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental output text
    TextDelta(String),
    /// A new output item started (tool call lifecycle)
    OutputItemAdded(Value),
    /// An output item finished
    OutputItemDone(Value),
    /// Code interpreter stage transition (interpreting / completed)
    CodeInterpreterStage(String),
    /// Terminal: the full response object
    Completed(Response),
    /// Terminal: the provider reported failure
    Failed(String),
    /// Anything else
    Other(String),
}

impl StreamEvent {
    /// Parse one SSE data payload
    pub fn parse(data: &str) -> Result<StreamEvent> {
        let value: Value = serde_json::from_str(data)
            .map_err(|e| WorkerError::Connection(format!("Malformed stream event: {e}")))?;
        let event_type = value.get("type").and_then(Value::as_str).unwrap_or_default();

        Ok(match event_type {
            "response.output_text.delta" => StreamEvent::TextDelta(
                value
                    .get("delta")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            ),
            "response.output_item.added" => {
                StreamEvent::OutputItemAdded(value.get("item").cloned().unwrap_or(Value::Null))
            }
            "response.output_item.done" => {
                StreamEvent::OutputItemDone(value.get("item").cloned().unwrap_or(Value::Null))
            }
            "response.code_interpreter_call.interpreting"
            | "response.code_interpreter_call.in_progress"
            | "response.code_interpreter_call.completed" => StreamEvent::CodeInterpreterStage(
                event_type
                    .rsplit('.')
                    .next()
                    .unwrap_or_default()
                    .to_string(),
            ),
            "response.completed" => {
                let response = value.get("response").cloned().unwrap_or(Value::Null);
                let response: Response = serde_json::from_value(response).map_err(|e| {
                    WorkerError::Connection(format!("Malformed response.completed payload: {e}"))
                })?;
                StreamEvent::Completed(response)
            }
            "response.failed" | "error" => {
                let message = value
                    .get("response")
                    .and_then(|r| r.get("error"))
                    .or_else(|| value.get("error"))
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("Provider reported stream failure")
                    .to_string();
                StreamEvent::Failed(message)
            }
            other => StreamEvent::Other(other.to_string()),
        })
    }
}

/// Error produced when a stream ends without `response.completed`
pub fn incomplete_stream_error() -> WorkerError {
    WorkerError::Connection("did not receive response.completed".to_string())
}

/// True when the error is the truncated-stream case that warrants a retry
/// and then a non-streaming fallback
pub fn is_incomplete_stream_error(error: &WorkerError) -> bool {
    error
        .to_string()
        .contains("did not receive response.completed")
}

// ============================================================================
// Flush-on-boundary delta buffer
// ============================================================================

/// Accumulates text deltas and releases them on a boundary: a newline, 80
/// buffered bytes, or 200 ms since the last flush, whichever comes first.
pub struct FlushBuffer {
    buffer: String,
    last_flush: Instant,
    max_bytes: usize,
    max_age: Duration,
}

impl Default for FlushBuffer {
    fn default() -> Self {
        Self::new(80, Duration::from_millis(200))
    }
}

impl FlushBuffer {
    pub fn new(max_bytes: usize, max_age: Duration) -> Self {
        Self {
            buffer: String::new(),
            last_flush: Instant::now(),
            max_bytes,
            max_age,
        }
    }

    /// Add a delta; returns the buffered text when a boundary is crossed
    pub fn push(&mut self, delta: &str) -> Option<String> {
        if delta.is_empty() {
            return None;
        }
        self.buffer.push_str(delta);
        if self.buffer.contains('\n')
            || self.buffer.len() >= self.max_bytes
            || self.last_flush.elapsed() >= self.max_age
        {
            return Some(self.take());
        }
        None
    }

    /// Drain whatever remains
    pub fn flush(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    fn take(&mut self) -> String {
        self.last_flush = Instant::now();
        std::mem::take(&mut self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_text_delta() {
        let event = StreamEvent::parse(r#"{"type":"response.output_text.delta","delta":"Hel"}"#)
            .unwrap();
        assert!(matches!(event, StreamEvent::TextDelta(d) if d == "Hel"));
    }

    #[test]
    fn parses_completed_with_response() {
        let payload = json!({
            "type": "response.completed",
            "response": {"id": "resp_1", "output_text": "done", "output": []}
        });
        let event = StreamEvent::parse(&payload.to_string()).unwrap();
        match event {
            StreamEvent::Completed(response) => {
                assert_eq!(response.id.as_deref(), Some("resp_1"));
                assert_eq!(response.text(), "done");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_types_are_preserved() {
        let event = StreamEvent::parse(r#"{"type":"response.audio.delta"}"#).unwrap();
        assert!(matches!(event, StreamEvent::Other(t) if t == "response.audio.delta"));
    }

    #[test]
    fn flush_on_newline() {
        let mut buffer = FlushBuffer::default();
        assert!(buffer.push("partial").is_none());
        let flushed = buffer.push(" line\n").unwrap();
        assert_eq!(flushed, "partial line\n");
        assert!(buffer.flush().is_none());
    }

    #[test]
    fn flush_on_size() {
        let mut buffer = FlushBuffer::new(8, Duration::from_secs(60));
        assert!(buffer.push("1234").is_none());
        assert_eq!(buffer.push("5678").unwrap(), "12345678");
    }

    #[test]
    fn incomplete_stream_detection() {
        assert!(is_incomplete_stream_error(&incomplete_stream_error()));
        assert!(!is_incomplete_stream_error(&WorkerError::timeout("x")));
    }
}
