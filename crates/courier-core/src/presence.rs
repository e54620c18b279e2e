//! Presence tracking for Courier.
//!
//! The registry is the single authority on which users are currently
//! reachable. It owns its map outright; callers interact only through
//! id-based operations, never through references into the map, and all
//! mutations share one mutual-exclusion domain.

use chrono::{DateTime, Utc};
use courier_protocol::{OnlineUser, RoleClass, UserId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;
use tracing::debug;

/// Unique identifier for a transport connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        Self(format!("conn_{timestamp:x}"))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Presence state for one user.
///
/// An entry exists iff its connection set is non-empty; the last
/// connection closing deletes the entry atomically.
#[derive(Debug)]
struct PresenceEntry {
    connections: HashSet<ConnectionId>,
    role: RoleClass,
    chatting_with: Option<UserId>,
    last_active: DateTime<Utc>,
}

/// Owned snapshot of a user's presence entry, returned to callers
/// instead of a reference into the map.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceSnapshot {
    pub user_id: UserId,
    pub connections: HashSet<ConnectionId>,
    pub role: RoleClass,
    pub chatting_with: Option<UserId>,
    pub last_active: DateTime<Utc>,
}

/// Authoritative in-memory map of online users, multi-device aware.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    entries: Mutex<HashMap<UserId, PresenceEntry>>,
}

impl PresenceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a user's entry, creating the entry if absent.
    ///
    /// Idempotent: re-adding a known connection only refreshes
    /// `last_active`. Returns a snapshot of the entry after the add.
    pub fn add_connection(
        &self,
        user_id: UserId,
        conn_id: ConnectionId,
        role: RoleClass,
    ) -> PresenceSnapshot {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.entry(user_id).or_insert_with(|| {
            debug!(user = %user_id, "Presence: user online");
            PresenceEntry {
                connections: HashSet::new(),
                role,
                chatting_with: None,
                last_active: Utc::now(),
            }
        });

        entry.connections.insert(conn_id);
        entry.role = role;
        entry.last_active = Utc::now();

        PresenceSnapshot {
            user_id,
            connections: entry.connections.clone(),
            role: entry.role,
            chatting_with: entry.chatting_with,
            last_active: entry.last_active,
        }
    }

    /// Remove one connection from a user's entry.
    ///
    /// Returns `true` if the user is now fully offline (the set became
    /// empty and the entry was deleted), so callers can decide whether
    /// to broadcast an offline transition. Removing an unknown
    /// connection id is a no-op.
    pub fn remove_connection(&self, user_id: UserId, conn_id: &ConnectionId) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = entries.get_mut(&user_id) else {
            return false;
        };

        entry.connections.remove(conn_id);
        if entry.connections.is_empty() {
            entries.remove(&user_id);
            debug!(user = %user_id, "Presence: user offline");
            true
        } else {
            false
        }
    }

    /// Record which peer the user currently has a chat pane open with.
    /// Ephemeral, never persisted.
    pub fn set_chatting_with(&self, user_id: UserId, peer: Option<UserId>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(&user_id) {
            entry.chatting_with = peer;
            entry.last_active = Utc::now();
        }
    }

    /// Refresh a user's activity timestamp (heartbeat).
    pub fn touch(&self, user_id: UserId) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(&user_id) {
            entry.last_active = Utc::now();
        }
    }

    /// Whether the user has at least one active connection.
    #[must_use]
    pub fn is_online(&self, user_id: UserId) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(&user_id)
    }

    /// The user's active connection ids, if any.
    #[must_use]
    pub fn connections(&self, user_id: UserId) -> HashSet<ConnectionId> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&user_id)
            .map(|e| e.connections.clone())
            .unwrap_or_default()
    }

    /// Ids of online provider-capable users, for catalog filtering and
    /// the anonymous feed.
    #[must_use]
    pub fn online_provider_ids(&self) -> Vec<UserId> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<UserId> = entries
            .iter()
            .filter(|(_, e)| e.role.is_provider())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Snapshot of all online users for the authenticated presence
    /// broadcast.
    #[must_use]
    pub fn online_users(&self) -> Vec<OnlineUser> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut users: Vec<OnlineUser> = entries
            .iter()
            .map(|(id, e)| OnlineUser {
                user_id: *id,
                role: e.role,
                last_active: e.last_active,
            })
            .collect();
        users.sort_by_key(|u| u.user_id);
        users
    }

    /// Number of online users.
    #[must_use]
    pub fn online_count(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::new(id)
    }

    #[test]
    fn test_online_iff_connected() {
        let registry = PresenceRegistry::new();
        let user = UserId::generate();

        assert!(!registry.is_online(user));

        registry.add_connection(user, conn("c1"), RoleClass::RequesterOnly);
        assert!(registry.is_online(user));

        registry.add_connection(user, conn("c2"), RoleClass::RequesterOnly);
        assert_eq!(registry.connections(user).len(), 2);

        // First removal leaves the user online.
        assert!(!registry.remove_connection(user, &conn("c1")));
        assert!(registry.is_online(user));

        // Last removal reports exactly one offline transition.
        assert!(registry.remove_connection(user, &conn("c2")));
        assert!(!registry.is_online(user));
        assert_eq!(registry.online_count(), 0);
    }

    #[test]
    fn test_add_connection_idempotent() {
        let registry = PresenceRegistry::new();
        let user = UserId::generate();

        registry.add_connection(user, conn("c1"), RoleClass::ProviderCapable);
        let snapshot = registry.add_connection(user, conn("c1"), RoleClass::ProviderCapable);
        assert_eq!(snapshot.connections.len(), 1);
    }

    #[test]
    fn test_remove_unknown_connection_is_noop() {
        let registry = PresenceRegistry::new();
        let user = UserId::generate();

        assert!(!registry.remove_connection(user, &conn("ghost")));

        registry.add_connection(user, conn("c1"), RoleClass::RequesterOnly);
        assert!(!registry.remove_connection(user, &conn("ghost")));
        assert!(registry.is_online(user));
    }

    #[test]
    fn test_provider_filter() {
        let registry = PresenceRegistry::new();
        let provider = UserId::generate();
        let requester = UserId::generate();

        registry.add_connection(provider, conn("p1"), RoleClass::ProviderCapable);
        registry.add_connection(requester, conn("r1"), RoleClass::RequesterOnly);

        assert_eq!(registry.online_provider_ids(), vec![provider]);
        assert_eq!(registry.online_users().len(), 2);
    }

    #[test]
    fn test_chatting_with() {
        let registry = PresenceRegistry::new();
        let user = UserId::generate();
        let peer = UserId::generate();

        // Not online: silently ignored.
        registry.set_chatting_with(user, Some(peer));

        registry.add_connection(user, conn("c1"), RoleClass::RequesterOnly);
        registry.set_chatting_with(user, Some(peer));

        let snapshot = registry.add_connection(user, conn("c2"), RoleClass::RequesterOnly);
        assert_eq!(snapshot.chatting_with, Some(peer));

        registry.set_chatting_with(user, None);
        let snapshot = registry.add_connection(user, conn("c3"), RoleClass::RequesterOnly);
        assert_eq!(snapshot.chatting_with, None);
    }
}
