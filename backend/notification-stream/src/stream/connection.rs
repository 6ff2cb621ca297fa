/// Client connections and the sinks they write to
use actix_web::web::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};
use tokio::time::Instant;
use uuid::Uuid;

use super::registry::ConnectionRegistry;

/// Frames a client may leave unread before writes to it are rejected
pub const DEFAULT_SEND_BUFFER: usize = 64;

/// Unique identifier for a client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("sink is closed")]
    Closed,

    #[error("peer disconnected")]
    Disconnected,

    #[error("send buffer is full")]
    Full,
}

/// Write endpoint for one client
///
/// Implementations must not block: a slow reader may buffer, never stall
/// the writer.
pub trait EventSink: Send + Sync {
    /// Queue one encoded frame for the client
    fn write(&self, frame: Bytes) -> Result<(), SinkError>;

    /// Close the sink. Returns `true` only for the call that closed it.
    fn close(&self) -> bool;

    fn is_closed(&self) -> bool;

    /// Frames written but not yet taken by the client
    fn backlog(&self) -> usize {
        0
    }
}

/// Sink backed by a bounded channel whose receiver feeds an HTTP body
///
/// A client that stops reading fills the buffer; later writes fail with
/// `SinkError::Full` instead of queueing without limit.
pub struct ChannelSink {
    tx: Mutex<Option<Sender<Bytes>>>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<Bytes>) {
        Self::with_capacity(DEFAULT_SEND_BUFFER)
    }

    pub fn with_capacity(capacity: usize) -> (Self, Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }
}

impl EventSink for ChannelSink {
    fn write(&self, frame: Bytes) -> Result<(), SinkError> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(SinkError::Closed)?;
        tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SinkError::Full,
            TrySendError::Closed(_) => SinkError::Disconnected,
        })
    }

    fn close(&self) -> bool {
        // Dropping the sender ends the body once queued frames are drained
        self.tx.lock().take().is_some()
    }

    fn is_closed(&self) -> bool {
        self.tx.lock().as_ref().map_or(true, |tx| tx.is_closed())
    }

    fn backlog(&self) -> usize {
        self.tx
            .lock()
            .as_ref()
            .map_or(0, |tx| tx.max_capacity() - tx.capacity())
    }
}

/// One open client stream plus its ownership metadata
///
/// Values handed out by the registry are snapshots; `last_liveness_at` is
/// only authoritative inside the registry.
#[derive(Clone)]
pub struct ClientConnection {
    id: ConnectionId,
    user_id: String,
    organization_id: Option<String>,
    sink: Arc<dyn EventSink>,
    connected_at: DateTime<Utc>,
    last_liveness_at: Instant,
}

impl ClientConnection {
    pub fn new(
        user_id: impl Into<String>,
        organization_id: Option<String>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            id: ConnectionId::new(),
            user_id: user_id.into(),
            organization_id,
            sink,
            connected_at: Utc::now(),
            last_liveness_at: Instant::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn organization_id(&self) -> Option<&str> {
        self.organization_id.as_deref()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn last_liveness_at(&self) -> Instant {
        self.last_liveness_at
    }

    pub fn send(&self, frame: Bytes) -> Result<(), SinkError> {
        self.sink.write(frame)
    }

    pub fn close(&self) -> bool {
        self.sink.close()
    }

    pub fn is_closed(&self) -> bool {
        self.sink.is_closed()
    }

    pub fn backlog(&self) -> usize {
        self.sink.backlog()
    }

    pub(crate) fn refresh_liveness(&mut self, at: Instant) {
        // Never move liveness backwards if refreshes race
        if at > self.last_liveness_at {
            self.last_liveness_at = at;
        }
    }

    /// True when no liveness evidence arrived within `timeout` of `now`
    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_liveness_at) > timeout
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("organization_id", &self.organization_id)
            .field("connected_at", &self.connected_at)
            .field("closed", &self.sink.is_closed())
            .finish()
    }
}

/// Deregisters a connection when its transport goes away
pub(crate) struct ConnectionGuard {
    id: ConnectionId,
    registry: Weak<RwLock<ConnectionRegistry>>,
}

impl ConnectionGuard {
    pub(crate) fn new(id: ConnectionId, registry: &Arc<RwLock<ConnectionRegistry>>) -> Self {
        Self {
            id,
            registry: Arc::downgrade(registry),
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };

        let removed = registry.write().remove(&self.id);

        // Already gone if it was evicted, disconnected or shut down
        if let Some(connection) = removed {
            connection.close();
            tracing::debug!(
                connection_id = %self.id,
                user_id = %connection.user_id(),
                "Client stream dropped, connection removed"
            );
        }
    }
}

/// Body half of a client stream, suitable for `HttpResponse::streaming`
///
/// Ends once the sink is closed and every queued frame has been read.
/// Dropping it removes the connection from the registry.
pub struct NotificationStream {
    rx: Receiver<Bytes>,
    guard: ConnectionGuard,
}

impl NotificationStream {
    pub(crate) fn new(rx: Receiver<Bytes>, guard: ConnectionGuard) -> Self {
        Self { rx, guard }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.guard.id
    }
}

impl Stream for NotificationStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|frame| frame.map(Ok))
    }
}
