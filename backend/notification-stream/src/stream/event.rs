/// Stream event envelope and its `text/event-stream` codec
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;

use crate::metrics;
use crate::models::Notification;

/// Event types understood by stream clients
///
/// `Custom` carries any producer-defined type string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    /// First frame on every stream
    Connected,
    Notification,
    /// Heartbeat written by the liveness monitor
    Ping,
    Error,
    Custom(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::Connected => "connected",
            EventType::Notification => "notification",
            EventType::Ping => "ping",
            EventType::Error => "error",
            EventType::Custom(name) => name.as_str(),
        }
    }

    /// Label used for metrics; custom types collapse into one bucket
    pub fn metric_label(&self) -> &'static str {
        match self {
            EventType::Connected => "connected",
            EventType::Notification => "notification",
            EventType::Ping => "ping",
            EventType::Error => "error",
            EventType::Custom(_) => "custom",
        }
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        match value {
            "connected" => EventType::Connected,
            "notification" => EventType::Notification,
            "ping" => EventType::Ping,
            "error" => EventType::Error,
            other => EventType::Custom(other.to_string()),
        }
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        EventType::from(value.as_str())
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire-level envelope written to a client stream
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationStreamEvent {
    pub event_type: EventType,
    pub data: Value,
    /// Event id, exposed to clients as the SSE `id:` field
    pub id: Option<String>,
    /// Reconnect delay hint in milliseconds
    pub retry: Option<u64>,
}

impl NotificationStreamEvent {
    pub fn new(event_type: impl Into<EventType>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            id: None,
            retry: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_retry(mut self, retry_ms: u64) -> Self {
        self.retry = Some(retry_ms);
        self
    }

    /// Create the confirmation written when a stream opens
    pub fn connected() -> Self {
        Self::new(
            EventType::Connected,
            json!({ "message": "Connected to notification stream" }),
        )
    }

    /// Create a heartbeat carrying the current timestamp
    pub fn ping() -> Self {
        Self::new(
            EventType::Ping,
            json!({ "timestamp": chrono::Utc::now().timestamp_millis() }),
        )
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventType::Error, json!({ "message": message.into() }))
    }

    /// Create a `notification` event; the notification id becomes the event id
    pub fn notification(notification: &Notification) -> Self {
        Self::custom(EventType::Notification, notification).with_id(notification.id.as_str())
    }

    /// Create an event from any serializable payload
    ///
    /// A payload that fails to serialize yields an `error` event instead.
    pub fn custom<T: Serialize + ?Sized>(event_type: impl Into<EventType>, payload: &T) -> Self {
        let event_type = event_type.into();
        match serde_json::to_value(payload) {
            Ok(data) => Self::new(event_type, data),
            Err(e) => {
                tracing::error!(
                    event_type = %event_type,
                    error = %e,
                    "Failed to serialize stream event payload"
                );
                metrics::record_encode_failure();
                error_envelope(&event_type, "payload is not serializable")
            }
        }
    }

    /// Encode into a `text/event-stream` frame
    pub fn encode(&self) -> String {
        encode(self)
    }
}

/// Encode an event into a wire frame
///
/// Field order is `event:`, `id:`, `retry:`, then one `data:` line per line of
/// the serialized payload, terminated by a blank line. Never fails: an event
/// that cannot be framed is replaced by an `error` event.
pub fn encode(event: &NotificationStreamEvent) -> String {
    match try_encode(event) {
        Ok(frame) => frame,
        Err(reason) => {
            tracing::error!(
                event_type = %event.event_type,
                reason,
                "Failed to encode stream event"
            );
            metrics::record_encode_failure();
            // The envelope is built from constants and always frames cleanly
            try_encode(&error_envelope(&event.event_type, reason))
                .unwrap_or_else(|_| FALLBACK_ERROR_FRAME.to_string())
        }
    }
}

const FALLBACK_ERROR_FRAME: &str = "event: error\ndata: {\"message\":\"Failed to encode event\"}\n\n";

fn error_envelope(event_type: &EventType, reason: &str) -> NotificationStreamEvent {
    // Echo the original type only when it is safe to put on the wire
    let original = if is_single_line(event_type.as_str()) {
        Value::String(event_type.as_str().to_string())
    } else {
        Value::Null
    };

    NotificationStreamEvent::new(
        EventType::Error,
        json!({
            "message": "Failed to encode event",
            "reason": reason,
            "originalType": original,
        }),
    )
}

fn try_encode(event: &NotificationStreamEvent) -> Result<String, &'static str> {
    let event_type = event.event_type.as_str();
    if event_type.is_empty() {
        return Err("event type is empty");
    }
    if !is_single_line(event_type) {
        return Err("event type contains a line break");
    }

    let data = serde_json::to_string(&event.data).map_err(|_| "payload is not serializable")?;

    let mut frame = String::with_capacity(data.len() + event_type.len() + 32);
    frame.push_str("event: ");
    frame.push_str(event_type);
    frame.push('\n');

    if let Some(id) = event.id.as_deref().filter(|id| !id.is_empty()) {
        if !is_single_line(id) {
            return Err("event id contains a line break");
        }
        frame.push_str("id: ");
        frame.push_str(id);
        frame.push('\n');
    }

    if let Some(retry) = event.retry {
        frame.push_str("retry: ");
        frame.push_str(&retry.to_string());
        frame.push('\n');
    }

    for line in data.lines() {
        frame.push_str("data: ");
        frame.push_str(line);
        frame.push('\n');
    }

    frame.push('\n');
    Ok(frame)
}

fn is_single_line(value: &str) -> bool {
    !value.contains(['\n', '\r'])
}
