/// Connection Registry
///
/// In-memory index of every open client connection, keyed three ways:
/// - by connection id (owns the `ClientConnection`)
/// - by user id
/// - by organization id, with organization-less connections in their own set
///
/// The registry is plain data; the stream service wraps it in one lock so
/// every `add`/`remove` updates all three indexes together. Each mutation
/// also publishes the active-connections gauge while that lock is held.
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use super::connection::{ClientConnection, ConnectionId};
use crate::metrics;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),

    #[error("registry is closed")]
    Closed,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, ClientConnection>,
    by_user: HashMap<String, HashSet<ConnectionId>>,
    by_organization: HashMap<String, HashSet<ConnectionId>>,
    unscoped: HashSet<ConnectionId>,
    closed: bool,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection in all indexes
    pub fn add(&mut self, connection: ClientConnection) -> Result<(), RegistryError> {
        if self.closed {
            return Err(RegistryError::Closed);
        }

        let id = connection.id();
        if self.connections.contains_key(&id) {
            return Err(RegistryError::DuplicateConnection(id));
        }

        self.by_user
            .entry(connection.user_id().to_string())
            .or_default()
            .insert(id);

        match connection.organization_id() {
            Some(organization_id) => {
                self.by_organization
                    .entry(organization_id.to_string())
                    .or_default()
                    .insert(id);
            }
            None => {
                self.unscoped.insert(id);
            }
        }

        self.connections.insert(id, connection);
        self.publish_count();
        Ok(())
    }

    /// Remove a connection from all indexes
    ///
    /// Returns the removed connection so the caller can close its sink.
    /// Removing an unknown id is a no-op.
    pub fn remove(&mut self, id: &ConnectionId) -> Option<ClientConnection> {
        let connection = self.connections.remove(id)?;

        remove_from_index(&mut self.by_user, connection.user_id(), id);
        match connection.organization_id() {
            Some(organization_id) => {
                remove_from_index(&mut self.by_organization, organization_id, id)
            }
            None => {
                self.unscoped.remove(id);
            }
        }

        self.publish_count();
        Some(connection)
    }

    /// Remove every connection belonging to a user
    pub fn remove_user(&mut self, user_id: &str) -> Vec<ClientConnection> {
        let ids: Vec<ConnectionId> = self
            .by_user
            .get(user_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();

        ids.iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Remove connections with no liveness evidence within `timeout` of `now`
    pub fn remove_stale(&mut self, now: Instant, timeout: Duration) -> Vec<ClientConnection> {
        let stale: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|connection| connection.is_stale(now, timeout))
            .map(ClientConnection::id)
            .collect();

        stale.iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Empty the registry and refuse further registrations
    pub fn close(&mut self) -> Vec<ClientConnection> {
        self.closed = true;
        self.by_user.clear();
        self.by_organization.clear();
        self.unscoped.clear();
        let drained: Vec<ClientConnection> = self
            .connections
            .drain()
            .map(|(_, connection)| connection)
            .collect();
        self.publish_count();
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn publish_count(&self) {
        metrics::set_active_connections(self.connections.len());
    }

    /// Record liveness evidence for the given connections
    pub fn refresh_liveness<'a>(
        &mut self,
        ids: impl IntoIterator<Item = &'a ConnectionId>,
        at: Instant,
    ) {
        for id in ids {
            if let Some(connection) = self.connections.get_mut(id) {
                connection.refresh_liveness(at);
            }
        }
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&ClientConnection> {
        self.connections.get(id)
    }

    pub fn by_user(&self, user_id: &str) -> Vec<ClientConnection> {
        self.collect_index(self.by_user.get(user_id))
    }

    /// Connections scoped to an organization; unscoped ones never match
    pub fn by_organization(&self, organization_id: &str) -> Vec<ClientConnection> {
        self.collect_index(self.by_organization.get(organization_id))
    }

    pub fn all(&self) -> Vec<ClientConnection> {
        self.connections.values().cloned().collect()
    }

    pub fn count_all(&self) -> usize {
        self.connections.len()
    }

    pub fn count_for_user(&self, user_id: &str) -> usize {
        self.by_user.get(user_id).map_or(0, HashSet::len)
    }

    pub fn count_for_organization(&self, organization_id: &str) -> usize {
        self.by_organization
            .get(organization_id)
            .map_or(0, HashSet::len)
    }

    /// Deduplicated ids of users with at least one open connection
    pub fn connected_user_ids(&self) -> BTreeSet<String> {
        self.by_user.keys().cloned().collect()
    }

    fn collect_index(&self, ids: Option<&HashSet<ConnectionId>>) -> Vec<ClientConnection> {
        ids.map(|ids| {
            ids.iter()
                .filter_map(|id| self.connections.get(id))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
    }

    /// Check that all indexes agree with the primary map
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let indexed_by_user: usize = self.by_user.values().map(HashSet::len).sum();
        let indexed_by_org: usize =
            self.by_organization.values().map(HashSet::len).sum::<usize>() + self.unscoped.len();
        assert_eq!(indexed_by_user, self.connections.len());
        assert_eq!(indexed_by_org, self.connections.len());

        for (user_id, ids) in &self.by_user {
            assert!(!ids.is_empty(), "empty user bucket for {}", user_id);
            for id in ids {
                assert_eq!(self.connections[id].user_id(), user_id);
            }
        }
        for (organization_id, ids) in &self.by_organization {
            assert!(!ids.is_empty(), "empty org bucket for {}", organization_id);
            for id in ids {
                assert_eq!(
                    self.connections[id].organization_id(),
                    Some(organization_id.as_str())
                );
            }
        }
        for id in &self.unscoped {
            assert_eq!(self.connections[id].organization_id(), None);
        }
    }
}

fn remove_from_index(index: &mut HashMap<String, HashSet<ConnectionId>>, key: &str, id: &ConnectionId) {
    if let Some(ids) = index.get_mut(key) {
        ids.remove(id);
        // Drop empty buckets so user/org listings stay accurate
        if ids.is_empty() {
            index.remove(key);
        }
    }
}
