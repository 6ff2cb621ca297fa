/// Notification stream service
///
/// Composes the registry, dispatcher and heartbeat monitor behind one handle.
/// Cloning is cheap; all clones share the same registry and timer.
use actix_web::web::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::time::Instant;

use super::connection::{
    ChannelSink, ClientConnection, ConnectionGuard, ConnectionId, EventSink, NotificationStream,
};
use super::dispatcher::{DeliveryReport, Dispatcher};
use super::event::NotificationStreamEvent;
use super::heartbeat::{HeartbeatHandle, HeartbeatMonitor, TickReport};
use super::registry::ConnectionRegistry;
use super::StreamError;
use crate::config::StreamSettings;
use crate::metrics;
use crate::models::Notification;

#[derive(Clone)]
pub struct StreamService {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<RwLock<ConnectionRegistry>>,
    dispatcher: Dispatcher,
    settings: StreamSettings,
    heartbeat: Mutex<Option<HeartbeatHandle>>,
}

impl StreamService {
    /// Create the service and start its heartbeat timer
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(settings: StreamSettings) -> Self {
        let registry = Arc::new(RwLock::new(ConnectionRegistry::new()));
        let heartbeat = HeartbeatMonitor::new(
            registry.clone(),
            settings.ping_interval,
            settings.liveness_timeout,
        )
        .spawn();

        Self {
            inner: Arc::new(Inner {
                dispatcher: Dispatcher::new(registry.clone()),
                registry,
                settings,
                heartbeat: Mutex::new(Some(heartbeat)),
            }),
        }
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.inner.settings
    }

    /// Open a stream for an authenticated user
    ///
    /// The returned body yields encoded frames, starting with `connected`.
    /// Dropping the body deregisters the connection.
    pub fn create_stream(
        &self,
        user_id: &str,
        organization_id: Option<&str>,
    ) -> Result<(ClientConnection, NotificationStream), StreamError> {
        let (sink, rx) = ChannelSink::with_capacity(self.inner.settings.send_buffer);
        let connection = self.attach_sink(user_id, organization_id, Arc::new(sink))?;
        let body = NotificationStream::new(
            rx,
            ConnectionGuard::new(connection.id(), &self.inner.registry),
        );
        Ok((connection, body))
    }

    /// Register a caller-supplied sink
    ///
    /// The `connected` event is written before the connection is indexed, so
    /// it is always the first frame on the sink. On any error the sink is
    /// closed and nothing is registered.
    pub fn attach_sink(
        &self,
        user_id: &str,
        organization_id: Option<&str>,
        sink: Arc<dyn EventSink>,
    ) -> Result<ClientConnection, StreamError> {
        let admitted = {
            let registry = self.inner.registry.read();
            if registry.is_closed() {
                Err(StreamError::ShuttingDown)
            } else {
                self.check_capacity(&registry)
            }
        };
        if let Err(e) = admitted {
            sink.close();
            return Err(e);
        }

        let organization_id = organization_id.filter(|id| !id.is_empty());
        let connection = ClientConnection::new(user_id, organization_id.map(String::from), sink);

        if let Err(e) = connection.send(Bytes::from(self.connected_event().encode())) {
            connection.close();
            tracing::warn!(
                user_id = %user_id,
                error = %e,
                "Failed to open notification stream"
            );
            return Err(StreamError::Sink(e));
        }

        let registered = {
            let mut registry = self.inner.registry.write();
            self.check_capacity(&registry)
                .and_then(|()| registry.add(connection.clone()).map_err(StreamError::from))
                .map(|()| registry.count_all())
        };

        let total = match registered {
            Ok(total) => total,
            Err(e) => {
                connection.close();
                return Err(e);
            }
        };

        metrics::record_deliveries("connected", 1, 0);
        tracing::info!(
            connection_id = %connection.id(),
            user_id = %connection.user_id(),
            organization_id = connection.organization_id().unwrap_or("-"),
            total_connections = total,
            "Notification stream opened"
        );

        Ok(connection)
    }

    pub fn send_notification_to_user(
        &self,
        user_id: &str,
        notification: &Notification,
    ) -> DeliveryReport {
        self.inner
            .dispatcher
            .send_notification_to_user(user_id, notification)
    }

    pub fn send_notification_to_organization(
        &self,
        organization_id: &str,
        notification: &Notification,
    ) -> DeliveryReport {
        self.inner
            .dispatcher
            .send_notification_to_organization(organization_id, notification)
    }

    pub fn broadcast_notification(&self, notification: &Notification) -> DeliveryReport {
        self.inner.dispatcher.broadcast_notification(notification)
    }

    pub fn send_event_to_user(
        &self,
        user_id: &str,
        event: &NotificationStreamEvent,
    ) -> DeliveryReport {
        self.inner.dispatcher.send_event_to_user(user_id, event)
    }

    /// Ping one user's connections now; accepted pings count as liveness
    pub fn ping_user(&self, user_id: &str) -> DeliveryReport {
        let (report, alive) = self.inner.dispatcher.ping_user(user_id);
        self.inner
            .registry
            .write()
            .refresh_liveness(&alive, Instant::now());
        report
    }

    /// Record transport-level liveness evidence (e.g. a pong)
    pub fn record_liveness(&self, connection_id: ConnectionId) -> bool {
        let mut registry = self.inner.registry.write();
        if registry.get(&connection_id).is_none() {
            return false;
        }
        registry.refresh_liveness([&connection_id], Instant::now());
        true
    }

    /// Run one heartbeat pass immediately, outside the timer schedule
    pub fn run_heartbeat(&self) -> TickReport {
        HeartbeatMonitor::new(
            self.inner.registry.clone(),
            self.inner.settings.ping_interval,
            self.inner.settings.liveness_timeout,
        )
        .tick(Instant::now())
    }

    pub fn connected_clients_count(&self) -> usize {
        self.inner.registry.read().count_all()
    }

    pub fn user_clients_count(&self, user_id: &str) -> usize {
        self.inner.registry.read().count_for_user(user_id)
    }

    pub fn organization_clients_count(&self, organization_id: &str) -> usize {
        self.inner
            .registry
            .read()
            .count_for_organization(organization_id)
    }

    /// Ids of users with at least one open stream, sorted
    pub fn connected_user_ids(&self) -> Vec<String> {
        self.inner
            .registry
            .read()
            .connected_user_ids()
            .into_iter()
            .collect()
    }

    /// Close and deregister every connection of a user
    ///
    /// Returns the number of connections closed.
    pub fn disconnect_user(&self, user_id: &str) -> usize {
        let removed = self.inner.registry.write().remove_user(user_id);

        for connection in &removed {
            connection.close();
        }

        if !removed.is_empty() {
            tracing::info!(
                user_id = %user_id,
                closed = removed.len(),
                "Disconnected user notification streams"
            );
        }
        removed.len()
    }

    /// Close every connection and stop the heartbeat timer
    ///
    /// Idempotent; later calls and later `create_stream` calls are no-ops /
    /// `ShuttingDown` errors respectively.
    pub fn shutdown(&self) {
        let heartbeat = self.inner.heartbeat.lock().take();
        let drained = self.inner.registry.write().close();

        for connection in &drained {
            connection.close();
        }

        if let Some(heartbeat) = heartbeat {
            drop(heartbeat);
            tracing::info!(
                closed = drained.len(),
                "Notification stream service shut down"
            );
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.registry.read().is_closed()
    }

    pub fn heartbeat_running(&self) -> bool {
        self.inner
            .heartbeat
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn connected_event(&self) -> NotificationStreamEvent {
        let event = NotificationStreamEvent::connected();
        match self.inner.settings.retry_ms {
            Some(retry_ms) => event.with_retry(retry_ms),
            None => event,
        }
    }

    fn check_capacity(&self, registry: &ConnectionRegistry) -> Result<(), StreamError> {
        match self.inner.settings.max_connections {
            Some(limit) if registry.count_all() >= limit => {
                Err(StreamError::CapacityExhausted { limit })
            }
            _ => Ok(()),
        }
    }
}
