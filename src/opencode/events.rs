//! Session lifecycle events from the OpenCode `/event` stream.

use serde_json::json;

/// Session events the task core reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session finished its turn.
    Idle { session_id: String },
    /// The session's turn ended with an error.
    Error {
        session_id: String,
        message: String,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Idle { session_id } | Self::Error { session_id, .. } => session_id,
        }
    }
}

/// Splits an SSE byte stream into frames.
///
/// Bytes are buffered until a blank line closes the frame, so a multi-byte
/// character split across network chunks decodes intact.
#[derive(Debug, Default)]
pub struct SseFrames {
    buffer: Vec<u8>,
}

impl SseFrames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let frame: Vec<u8> = self.buffer.drain(..pos + 2).take(pos).collect();
            frames.push(String::from_utf8_lossy(&frame).into_owned());
        }
        frames
    }
}

/// Parse one SSE frame into a [`SessionEvent`].
pub fn parse_sse_event(event_str: &str) -> Option<SessionEvent> {
    // SSE format: "data: {...json...}"
    let data_line = event_str.lines().find(|l| l.starts_with("data: "))?;
    let json_str = data_line.strip_prefix("data: ")?;

    let json: serde_json::Value = serde_json::from_str(json_str).ok()?;

    let event_type = json.get("type")?.as_str()?;
    let props = json.get("properties").cloned().unwrap_or(json!({}));

    let session_id = props
        .get("sessionID")
        .or_else(|| props.get("info").and_then(|v| v.get("sessionID")))
        .and_then(|v| v.as_str())?
        .to_string();

    match event_type {
        "session.idle" => Some(SessionEvent::Idle { session_id }),
        "session.status" => {
            let kind = props
                .get("status")
                .and_then(|s| s.get("type"))
                .and_then(|v| v.as_str())?;
            (kind == "idle").then_some(SessionEvent::Idle { session_id })
        }
        "session.error" => {
            let error = props.get("error");
            let message = error
                .and_then(|e| e.get("data"))
                .and_then(|d| d.get("message"))
                .or_else(|| error.and_then(|e| e.get("message")))
                .or_else(|| error.and_then(|e| e.get("name")))
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown error")
                .to_string();
            Some(SessionEvent::Error {
                session_id,
                message,
            })
        }
        _ => None,
    }
}
