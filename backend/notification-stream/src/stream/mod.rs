/// Real-time notification streams
///
/// Long-lived, server-initiated `text/event-stream` connections indexed by
/// user and organization.
///
/// Architecture:
/// 1. event: envelope type and wire codec
/// 2. connection: client connection record, sinks, HTTP body stream
/// 3. registry: the only source of truth for open connections
/// 4. dispatcher: per-user, per-organization and broadcast fan-out
/// 5. heartbeat: recurring ping + stale connection eviction
/// 6. service: façade composing the above
use thiserror::Error;

pub mod connection;
pub mod dispatcher;
pub mod event;
pub mod heartbeat;
pub mod registry;
pub mod service;

pub use connection::{
    ChannelSink, ClientConnection, ConnectionId, EventSink, NotificationStream, SinkError,
};
pub use dispatcher::{DeliveryReport, Dispatcher};
pub use event::{encode, EventType, NotificationStreamEvent};
pub use heartbeat::{HeartbeatHandle, HeartbeatMonitor, TickReport};
pub use registry::{ConnectionRegistry, RegistryError};
pub use service::StreamService;

/// Reasons a client stream cannot be opened
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("notification stream service is shutting down")]
    ShuttingDown,

    #[error("connection limit of {limit} reached")]
    CapacityExhausted { limit: usize },

    #[error("failed to open client stream: {0}")]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Registry(RegistryError),
}

impl StreamError {
    /// True when retrying later may succeed
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StreamError::ShuttingDown | StreamError::CapacityExhausted { .. }
        )
    }
}

impl From<RegistryError> for StreamError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Closed => StreamError::ShuttingDown,
            other => StreamError::Registry(other),
        }
    }
}
