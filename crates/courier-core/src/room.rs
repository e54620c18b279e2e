//! Room index for Courier.
//!
//! A room is a named broadcast group (personal, conversation, topic,
//! presence, anonymous feed) that connections join and leave; delivery
//! is fan-out to all currently joined connections with no queuing or
//! replay for absent sessions.

use crate::presence::ConnectionId;
use courier_protocol::{ConversationId, TopicKind, UserId};
use dashmap::DashMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Default broadcast capacity per room.
const DEFAULT_ROOM_CAPACITY: usize = 256;

/// Key identifying a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoomKey {
    /// A user's personal room; every authenticated connection of that
    /// user is a member.
    User(UserId),
    /// A conversation room; open while a participant is viewing it.
    Conversation(ConversationId),
    /// Order/dispute rooms fed by external marketplace services.
    Topic(TopicKind, String),
    /// All authenticated sessions; carries presence snapshots.
    Presence,
    /// Anonymous viewers; carries provider ids only.
    Feed,
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomKey::User(id) => write!(f, "user:{id}"),
            RoomKey::Conversation(id) => write!(f, "conversation:{id}"),
            RoomKey::Topic(kind, id) => write!(f, "{kind}:{id}"),
            RoomKey::Presence => write!(f, "presence"),
            RoomKey::Feed => write!(f, "feed"),
        }
    }
}

static ENVELOPE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A pre-encoded event traveling through a room.
///
/// The payload is encoded once at publish time and shared across all
/// receiving connections.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Sequence number, unique within this process.
    pub seq: u64,
    /// Room the envelope was published to.
    pub room: RoomKey,
    /// Encoded JSON text frame.
    pub payload: Arc<String>,
    /// Connection that must not receive this envelope (typing relay
    /// excludes the sender).
    pub exclude: Option<ConnectionId>,
}

impl Envelope {
    /// Create an envelope for a room.
    #[must_use]
    pub fn new(room: RoomKey, payload: impl Into<String>) -> Self {
        Self {
            seq: ENVELOPE_COUNTER.fetch_add(1, Ordering::Relaxed),
            room,
            payload: Arc::new(payload.into()),
            exclude: None,
        }
    }

    /// Exclude one connection from delivery.
    #[must_use]
    pub fn excluding(mut self, conn: ConnectionId) -> Self {
        self.exclude = Some(conn);
        self
    }
}

struct RoomEntry {
    sender: broadcast::Sender<Arc<Envelope>>,
    members: HashSet<ConnectionId>,
}

impl RoomEntry {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            members: HashSet::new(),
        }
    }
}

/// Room index configuration.
#[derive(Debug, Clone)]
pub struct RoomsConfig {
    /// Broadcast capacity per room.
    pub room_capacity: usize,
    /// Maximum rooms a single connection may join.
    pub max_rooms_per_connection: usize,
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            room_capacity: DEFAULT_ROOM_CAPACITY,
            max_rooms_per_connection: 64,
        }
    }
}

/// Outcome of joining a room.
pub struct Membership {
    /// Receiver for envelopes published to the room.
    pub receiver: broadcast::Receiver<Arc<Envelope>>,
    /// False when the connection was already a member (idempotent join).
    pub newly_joined: bool,
}

/// The room index: membership plus fan-out.
///
/// Rooms are created on first join and deleted when their last member
/// leaves.
pub struct Rooms {
    rooms: DashMap<RoomKey, RoomEntry>,
    /// Rooms joined per connection, for disconnect cleanup.
    memberships: DashMap<ConnectionId, HashSet<RoomKey>>,
    config: RoomsConfig,
}

impl Rooms {
    /// Create a room index with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RoomsConfig::default())
    }

    /// Create a room index with custom configuration.
    #[must_use]
    pub fn with_config(config: RoomsConfig) -> Self {
        Self {
            rooms: DashMap::new(),
            memberships: DashMap::new(),
            config,
        }
    }

    /// Join a connection to a room, creating the room if absent.
    ///
    /// Idempotent: a second join returns a fresh receiver without
    /// changing membership. Returns `None` if the connection is at its
    /// room limit.
    pub fn join(&self, conn: &ConnectionId, key: RoomKey) -> Option<Membership> {
        let mut member_rooms = self.memberships.entry(conn.clone()).or_default();
        let already = member_rooms.contains(&key);
        if !already && member_rooms.len() >= self.config.max_rooms_per_connection {
            return None;
        }

        let mut entry = self.rooms.entry(key.clone()).or_insert_with(|| {
            debug!(room = %key, "Creating room");
            RoomEntry::new(self.config.room_capacity)
        });

        entry.members.insert(conn.clone());
        let receiver = entry.sender.subscribe();
        drop(entry);

        member_rooms.insert(key.clone());
        if !already {
            debug!(room = %key, connection = %conn, "Joined room");
        }

        Some(Membership {
            receiver,
            newly_joined: !already,
        })
    }

    /// Remove a connection from a room.
    ///
    /// Returns `true` if the connection was a member. Leaving a room one
    /// never joined is a no-op. Empty rooms are deleted.
    pub fn leave(&self, conn: &ConnectionId, key: &RoomKey) -> bool {
        let was_member = self
            .memberships
            .get_mut(conn)
            .map(|mut rooms| rooms.remove(key))
            .unwrap_or(false);

        if let Some(mut entry) = self.rooms.get_mut(key) {
            entry.members.remove(conn);
            debug!(room = %key, connection = %conn, members = entry.members.len(), "Left room");

            if entry.members.is_empty() {
                drop(entry);
                self.rooms.remove(key);
                debug!(room = %key, "Deleted empty room");
            }
        }

        was_member
    }

    /// Remove a connection from every room it joined.
    pub fn leave_all(&self, conn: &ConnectionId) {
        if let Some((_, rooms)) = self.memberships.remove(conn) {
            for key in rooms {
                if let Some(mut entry) = self.rooms.get_mut(&key) {
                    entry.members.remove(conn);
                    if entry.members.is_empty() {
                        drop(entry);
                        self.rooms.remove(&key);
                    }
                }
            }
        }
        debug!(connection = %conn, "Left all rooms");
    }

    /// Publish an envelope to its room.
    ///
    /// Returns the number of member connections at publish time; absent
    /// rooms swallow the envelope (no queuing, no replay).
    pub fn publish(&self, envelope: Envelope) -> usize {
        let Some(entry) = self.rooms.get(&envelope.room) else {
            trace!(room = %envelope.room, "Publish to empty room");
            return 0;
        };
        let members = entry.members.len();
        trace!(room = %envelope.room, recipients = members, "Publishing");
        let _ = entry.sender.send(Arc::new(envelope));
        members
    }

    /// Whether a connection is a member of a room.
    #[must_use]
    pub fn is_member(&self, conn: &ConnectionId, key: &RoomKey) -> bool {
        self.rooms
            .get(key)
            .map(|e| e.members.contains(conn))
            .unwrap_or(false)
    }

    /// Whether any of the given connections is a member of a room.
    ///
    /// Used by the dispatcher to decide "room open" for a multi-device
    /// recipient.
    #[must_use]
    pub fn any_member(&self, conns: &HashSet<ConnectionId>, key: &RoomKey) -> bool {
        self.rooms
            .get(key)
            .map(|e| conns.iter().any(|c| e.members.contains(c)))
            .unwrap_or(false)
    }

    /// Number of members in a room.
    #[must_use]
    pub fn member_count(&self, key: &RoomKey) -> usize {
        self.rooms.get(key).map(|e| e.members.len()).unwrap_or(0)
    }

    /// Number of live rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

impl Default for Rooms {
    fn default() -> Self {
        Self::new()
    }
}
