//! Group membership for one hub.

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;
use tracing::debug;

use hubwire_core::ConnectionId;

#[derive(Debug, Default)]
struct Memberships {
    groups: HashMap<String, HashSet<ConnectionId>>,
    /// Reverse index used to clean up when a connection goes away.
    by_connection: HashMap<ConnectionId, HashSet<String>>,
}

/// Maps group names to the connections in them.
///
/// Broadcasts work on a snapshot of the membership taken at dispatch time; a
/// connection leaving concurrently may or may not receive that message.
#[derive(Debug)]
pub struct GroupRegistry {
    inner: RwLock<Memberships>,
    reap_empty: bool,
}

impl Default for GroupRegistry {
    fn default() -> Self {
        Self::new(true)
    }
}

impl GroupRegistry {
    /// With `reap_empty` unset, groups outlive their last member.
    pub fn new(reap_empty: bool) -> Self {
        Self {
            inner: RwLock::new(Memberships::default()),
            reap_empty,
        }
    }

    /// Adds a connection to a group, creating the group on first join.
    ///
    /// Returns `false` if the connection was already a member.
    pub async fn join(&self, group: &str, connection_id: &ConnectionId) -> bool {
        let mut inner = self.inner.write().await;
        let added = inner
            .groups
            .entry(group.to_string())
            .or_default()
            .insert(connection_id.clone());
        if added {
            inner
                .by_connection
                .entry(connection_id.clone())
                .or_default()
                .insert(group.to_string());
            debug!(group, connection_id = %connection_id, "Joined group");
        }
        added
    }

    /// Removes a connection from a group.
    ///
    /// Returns `false` if it was not a member.
    pub async fn leave(&self, group: &str, connection_id: &ConnectionId) -> bool {
        let mut inner = self.inner.write().await;
        let removed = match inner.groups.get_mut(group) {
            Some(members) => members.remove(connection_id),
            None => false,
        };
        if !removed {
            return false;
        }

        if let Some(groups) = inner.by_connection.get_mut(connection_id) {
            groups.remove(group);
            if groups.is_empty() {
                inner.by_connection.remove(connection_id);
            }
        }
        if self.reap_empty && inner.groups.get(group).is_some_and(HashSet::is_empty) {
            inner.groups.remove(group);
            debug!(group, "Reaped empty group");
        }
        debug!(group, connection_id = %connection_id, "Left group");
        true
    }

    /// Removes a connection from every group it belongs to.
    ///
    /// Returns the groups it was removed from.
    pub async fn remove_connection(&self, connection_id: &ConnectionId) -> Vec<String> {
        let mut inner = self.inner.write().await;
        let Some(groups) = inner.by_connection.remove(connection_id) else {
            return Vec::new();
        };

        for group in &groups {
            let now_empty = match inner.groups.get_mut(group) {
                Some(members) => {
                    members.remove(connection_id);
                    members.is_empty()
                }
                None => false,
            };
            if now_empty && self.reap_empty {
                inner.groups.remove(group);
            }
        }
        let mut groups: Vec<_> = groups.into_iter().collect();
        groups.sort();
        groups
    }

    /// Snapshot of a group's members.
    pub async fn members(&self, group: &str) -> Vec<ConnectionId> {
        let inner = self.inner.read().await;
        inner
            .groups
            .get(group)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Groups a connection belongs to, sorted by name.
    pub async fn groups_of(&self, connection_id: &ConnectionId) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut groups: Vec<_> = inner
            .by_connection
            .get(connection_id)
            .map(|groups| groups.iter().cloned().collect())
            .unwrap_or_default();
        groups.sort();
        groups
    }

    pub async fn contains_group(&self, group: &str) -> bool {
        self.inner.read().await.groups.contains_key(group)
    }

    pub async fn group_count(&self) -> usize {
        self.inner.read().await.groups.len()
    }
}
