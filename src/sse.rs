use crate::constants::{
    FRAME_COMPLETE, FRAME_CONTENT, FRAME_ERROR, FRAME_QUEUE_INJECTED, FRAME_QUEUE_PROCESSING,
};
use crate::types::{EventOrdinal, QueueInjection};
use serde_json::Value;

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseFrame {
    pub id: Option<String>,
    pub event: String,
    pub data: String,
}

impl SseFrame {
    pub fn new(event: &str, data: impl Into<String>) -> Self {
        Self {
            id: None,
            event: event.to_string(),
            data: data.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn ordinal(&self) -> Option<EventOrdinal> {
        self.id.as_deref().and_then(EventOrdinal::parse)
    }
}

/// Line-oriented event-stream decoder. Feed it lines; it yields a frame on each blank line.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: String,
    id: Option<String>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn push_line(&mut self, line: &str) -> Option<SseFrame> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "id" => self.id = Some(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => tracing::trace!("[SSE] Ignoring field {}", field),
        }
        None
    }

    /// Feeds a block of text, returning every frame it completes.
    pub fn feed(&mut self, text: &str) -> Vec<SseFrame> {
        self.pending.push_str(text);
        let mut frames = Vec::new();
        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            if let Some(frame) = self.push_line(line.trim_end_matches('\n')) {
                frames.push(frame);
            }
        }
        frames
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        if self.data.is_empty() && self.event.is_none() {
            self.id = None;
            return None;
        }
        let event = self.event.take().unwrap_or_else(|| "message".to_string());
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame {
            id: self.id.take(),
            event,
            data,
        })
    }
}

/// Logical signal carried by a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamSignal {
    Content { event: Value },
    Error { message: String },
    Complete { status: Option<String> },
    QueueInjected(QueueInjection),
    Unknown(String),
}

impl StreamSignal {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Complete { .. })
    }
}

pub fn parse_signal(frame: &SseFrame) -> StreamSignal {
    match frame.event.as_str() {
        FRAME_CONTENT | "message" => match serde_json::from_str::<Value>(&frame.data) {
            Ok(mut value) => {
                let event = match value.get_mut("event").map(Value::take) {
                    Some(inner) => inner,
                    None => value,
                };
                StreamSignal::Content { event }
            }
            Err(e) => {
                tracing::debug!("[SSE] Undecodable content frame: {}", e);
                StreamSignal::Unknown(frame.event.clone())
            }
        },
        FRAME_ERROR => StreamSignal::Error {
            message: extract_error_message(&frame.data),
        },
        FRAME_COMPLETE => {
            let status = serde_json::from_str::<Value>(&frame.data)
                .ok()
                .and_then(|v| v.get("status").and_then(|s| s.as_str()).map(str::to_string));
            StreamSignal::Complete { status }
        }
        FRAME_QUEUE_PROCESSING | FRAME_QUEUE_INJECTED => {
            match serde_json::from_str::<QueueInjection>(&frame.data) {
                Ok(mut injection) => {
                    if frame.event == FRAME_QUEUE_INJECTED {
                        injection.injected_inline = true;
                    }
                    StreamSignal::QueueInjected(injection)
                }
                Err(e) => {
                    tracing::warn!("[SSE] Malformed {} payload: {}", frame.event, e);
                    StreamSignal::Unknown(frame.event.clone())
                }
            }
        }
        other => StreamSignal::Unknown(other.to_string()),
    }
}

/// Best-effort message from an error payload: a bare string, `{error: "..."}`,
/// `{error: {message: "..."}}`, or `{message: "..."}`.
pub fn extract_error_message(data: &str) -> String {
    let trimmed = data.trim();
    if trimmed.is_empty() {
        return "Unknown stream error".to_string();
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::String(s)) => s,
        Ok(Value::Object(map)) => {
            let from_error = map.get("error").and_then(|e| match e {
                Value::String(s) => Some(s.clone()),
                Value::Object(inner) => inner
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string),
                _ => None,
            });
            match from_error {
                Some(m) => m,
                None => match map.get("message").and_then(|m| m.as_str()) {
                    Some(m) => m.to_string(),
                    None => trimmed.to_string(),
                },
            }
        }
        _ => trimmed.to_string(),
    }
}
