/// Fan-out of stream events to registered connections
///
/// Delivery is best effort per recipient: a sink that rejects a write is
/// logged and skipped, the rest of the audience still receives the event, and
/// the failed connection is left for the heartbeat monitor to evict.
use actix_web::web::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

use super::connection::{ClientConnection, ConnectionId};
use super::event::NotificationStreamEvent;
use super::registry::ConnectionRegistry;
use crate::metrics;
use crate::models::Notification;

/// Outcome of a single dispatch call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    /// Connections that matched the audience
    pub matched: usize,
    pub delivered: usize,
    pub failed: usize,
}

impl DeliveryReport {
    pub fn is_fully_successful(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<RwLock<ConnectionRegistry>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<RwLock<ConnectionRegistry>>) -> Self {
        Self { registry }
    }

    /// Send a notification to every connection of one user
    pub fn send_notification_to_user(
        &self,
        user_id: &str,
        notification: &Notification,
    ) -> DeliveryReport {
        let targets = self.registry.read().by_user(user_id);
        self.deliver(&targets, &NotificationStreamEvent::notification(notification))
            .0
    }

    /// Send a notification to every connection scoped to an organization
    pub fn send_notification_to_organization(
        &self,
        organization_id: &str,
        notification: &Notification,
    ) -> DeliveryReport {
        let targets = self.registry.read().by_organization(organization_id);
        self.deliver(&targets, &NotificationStreamEvent::notification(notification))
            .0
    }

    /// Send a notification to every registered connection
    pub fn broadcast_notification(&self, notification: &Notification) -> DeliveryReport {
        let targets = self.registry.read().all();
        self.deliver(&targets, &NotificationStreamEvent::notification(notification))
            .0
    }

    /// Send a caller-built event to every connection of one user
    pub fn send_event_to_user(
        &self,
        user_id: &str,
        event: &NotificationStreamEvent,
    ) -> DeliveryReport {
        let targets = self.registry.read().by_user(user_id);
        self.deliver(&targets, event).0
    }

    /// Write a heartbeat to every connection
    ///
    /// Returns the ids that count as alive: the sink accepted the ping and
    /// the client had read everything queued before it.
    pub(crate) fn ping_all(&self) -> (DeliveryReport, Vec<ConnectionId>) {
        let targets = self.registry.read().all();
        self.ping(&targets)
    }

    /// Write a heartbeat to one user's connections
    pub(crate) fn ping_user(&self, user_id: &str) -> (DeliveryReport, Vec<ConnectionId>) {
        let targets = self.registry.read().by_user(user_id);
        self.ping(&targets)
    }

    fn ping(&self, targets: &[ClientConnection]) -> (DeliveryReport, Vec<ConnectionId>) {
        // A ping landing on an unread queue proves nothing about the reader
        let drained: HashSet<ConnectionId> = targets
            .iter()
            .filter(|connection| connection.backlog() == 0)
            .map(ClientConnection::id)
            .collect();

        let (report, accepted) = self.deliver(targets, &NotificationStreamEvent::ping());
        let alive = accepted
            .into_iter()
            .filter(|id| drained.contains(id))
            .collect();
        (report, alive)
    }

    /// Encode once and write to each target
    ///
    /// Runs outside the registry lock so a slow sink never holds up
    /// registrations.
    fn deliver(
        &self,
        targets: &[ClientConnection],
        event: &NotificationStreamEvent,
    ) -> (DeliveryReport, Vec<ConnectionId>) {
        let mut report = DeliveryReport {
            matched: targets.len(),
            ..DeliveryReport::default()
        };
        if targets.is_empty() {
            return (report, Vec::new());
        }

        let frame = Bytes::from(event.encode());
        let mut delivered_to = Vec::with_capacity(targets.len());

        for connection in targets {
            match connection.send(frame.clone()) {
                Ok(()) => {
                    report.delivered += 1;
                    delivered_to.push(connection.id());
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        connection_id = %connection.id(),
                        user_id = %connection.user_id(),
                        event_type = %event.event_type,
                        error = %e,
                        "Failed to write stream event, leaving connection for eviction"
                    );
                }
            }
        }

        metrics::record_deliveries(
            event.event_type.metric_label(),
            report.delivered,
            report.failed,
        );

        (report, delivered_to)
    }
}
