//! Connection gateway.
//!
//! Turns an inbound transport connection plus a bearer credential into
//! an authenticated session: verifies the credential, registers the
//! connection with the presence registry, joins the personal and
//! presence rooms, and pushes presence snapshots. Also owns the
//! unauthenticated provider feed.

use crate::broadcast::EventBroadcaster;
use crate::error::ChatError;
use crate::presence::{ConnectionId, PresenceRegistry};
use crate::room::{Envelope, RoomKey, Rooms};
use crate::store::{ChatStore, TokenVerifier};
use chrono::Utc;
use courier_protocol::{FeedEvent, OnlineUser, RoleClass, ServerEvent, UserId};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// An authenticated session, returned once the credential verified.
///
/// The caller owns the receivers; dropping them leaves the rooms via
/// [`ConnectionGateway::disconnect`].
pub struct Session {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub role: RoleClass,
    /// Snapshot of the *other* online users, for the initial
    /// `presence_connected` push to just this connection.
    pub snapshot: Vec<OnlineUser>,
    /// Receiver for the user's personal room.
    pub personal: broadcast::Receiver<Arc<Envelope>>,
    /// Receiver for the shared authenticated-presence room.
    pub presence: broadcast::Receiver<Arc<Envelope>>,
    /// Background retroactive-delivery task, present on the user's
    /// online transition. Callers may ignore it; it runs to completion
    /// or fails into a log.
    pub delivery_catchup: Option<JoinHandle<()>>,
}

/// An anonymous feed subscription.
pub struct FeedSubscription {
    pub connection_id: ConnectionId,
    /// Initial snapshot for this viewer.
    pub snapshot: FeedEvent,
    pub receiver: broadcast::Receiver<Arc<Envelope>>,
}

/// Authenticates connections and maintains presence-driven broadcasts.
pub struct ConnectionGateway {
    registry: Arc<PresenceRegistry>,
    rooms: Arc<Rooms>,
    broadcaster: EventBroadcaster,
    verifier: Arc<dyn TokenVerifier>,
    store: Arc<dyn ChatStore>,
}

impl ConnectionGateway {
    /// Create a gateway.
    #[must_use]
    pub fn new(
        registry: Arc<PresenceRegistry>,
        rooms: Arc<Rooms>,
        broadcaster: EventBroadcaster,
        verifier: Arc<dyn TokenVerifier>,
        store: Arc<dyn ChatStore>,
    ) -> Self {
        Self {
            registry,
            rooms,
            broadcaster,
            verifier,
            store,
        }
    }

    /// Authenticate a connection and create a session.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::AuthenticationFailed`] for a bad credential;
    /// no partial state is left behind on failure.
    pub async fn connect(
        &self,
        conn_id: ConnectionId,
        token: &str,
    ) -> Result<Session, ChatError> {
        let identity = self.verifier.verify(token).await?;
        let was_online = self.registry.is_online(identity.user_id);

        self.registry
            .add_connection(identity.user_id, conn_id.clone(), identity.role);

        let personal = match self.rooms.join(&conn_id, RoomKey::User(identity.user_id)) {
            Some(m) => m.receiver,
            None => {
                self.registry.remove_connection(identity.user_id, &conn_id);
                return Err(ChatError::store("room limit reached at connect"));
            }
        };
        let presence = match self.rooms.join(&conn_id, RoomKey::Presence) {
            Some(m) => m.receiver,
            None => {
                self.rooms.leave_all(&conn_id);
                self.registry.remove_connection(identity.user_id, &conn_id);
                return Err(ChatError::store("room limit reached at connect"));
            }
        };

        let snapshot = self
            .registry
            .online_users()
            .into_iter()
            .filter(|u| u.user_id != identity.user_id)
            .collect();

        // Messages that arrived while this user was offline get their
        // delivery timestamp on the online transition.
        let delivery_catchup = if was_online {
            None
        } else {
            let store = Arc::clone(&self.store);
            let user_id = identity.user_id;
            Some(tokio::spawn(async move {
                match store.mark_delivered_for_recipient(user_id, Utc::now()).await {
                    Ok(0) => {}
                    Ok(n) => debug!(user = %user_id, count = n, "Retroactively marked delivered"),
                    Err(e) => warn!(user = %user_id, error = %e, "Retroactive delivery failed"),
                }
            }))
        };

        info!(user = %identity.user_id, connection = %conn_id, "Session established");
        self.broadcast_presence();

        Ok(Session {
            connection_id: conn_id,
            user_id: identity.user_id,
            role: identity.role,
            snapshot,
            personal,
            presence,
            delivery_catchup,
        })
    }

    /// Tear down a connection: leave every room, drop it from the
    /// registry, and re-broadcast presence.
    pub fn disconnect(&self, user_id: UserId, conn_id: &ConnectionId) {
        self.rooms.leave_all(conn_id);
        let now_offline = self.registry.remove_connection(user_id, conn_id);
        if now_offline {
            info!(user = %user_id, "User offline");
        }
        self.broadcast_presence();
    }

    /// Subscribe an anonymous viewer to the provider feed.
    ///
    /// The feed only ever carries online provider ids.
    #[must_use]
    pub fn watch_feed(&self, conn_id: ConnectionId) -> Option<FeedSubscription> {
        let membership = self.rooms.join(&conn_id, RoomKey::Feed)?;
        Some(FeedSubscription {
            connection_id: conn_id,
            snapshot: FeedEvent::PresenceConnected {
                online_provider_ids: self.registry.online_provider_ids(),
            },
            receiver: membership.receiver,
        })
    }

    /// Drop an anonymous viewer.
    pub fn drop_feed(&self, conn_id: &ConnectionId) {
        self.rooms.leave(conn_id, &RoomKey::Feed);
    }

    /// Heartbeat: refresh the user's activity timestamp.
    pub fn heartbeat(&self, user_id: UserId) {
        self.registry.touch(user_id);
    }

    /// The user opened a chat pane with a peer.
    pub fn chat_focus(&self, user_id: UserId, peer_id: UserId) {
        self.registry.set_chatting_with(user_id, Some(peer_id));
    }

    /// The user closed the chat pane.
    pub fn chat_blur(&self, user_id: UserId) {
        self.registry.set_chatting_with(user_id, None);
    }

    /// Authenticated snapshot first, reduced anonymous list second.
    fn broadcast_presence(&self) {
        self.broadcaster.to_presence(&ServerEvent::PresenceUpdate {
            online_users: self.registry.online_users(),
        });
        self.broadcaster.to_anonymous_feed(&FeedEvent::PresenceUpdate {
            online_provider_ids: self.registry.online_provider_ids(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryStore, StaticTokenVerifier};
    use crate::store::NewMessage;
    use courier_protocol::MessageKind;

    struct Fixture {
        gateway: ConnectionGateway,
        registry: Arc<PresenceRegistry>,
        store: Arc<MemoryStore>,
        provider: UserId,
        requester: UserId,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(PresenceRegistry::new());
        let rooms = Arc::new(Rooms::new());
        let broadcaster = EventBroadcaster::new(rooms.clone());
        let store = Arc::new(MemoryStore::new());
        let provider = UserId::generate();
        let requester = UserId::generate();
        let verifier = Arc::new(
            StaticTokenVerifier::new()
                .with_token("provider-token", provider, RoleClass::ProviderCapable)
                .with_token("requester-token", requester, RoleClass::RequesterOnly),
        );
        let gateway = ConnectionGateway::new(
            registry.clone(),
            rooms,
            broadcaster,
            verifier,
            store.clone(),
        );
        Fixture {
            gateway,
            registry,
            store,
            provider,
            requester,
        }
    }

    #[tokio::test]
    async fn test_bad_credential_creates_no_state() {
        let f = fixture();
        let result = f
            .gateway
            .connect(ConnectionId::new("c1"), "wrong")
            .await;
        assert!(matches!(result, Err(ChatError::AuthenticationFailed)));
        assert_eq!(f.registry.online_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_snapshot_excludes_self() {
        let f = fixture();
        let _first = f
            .gateway
            .connect(ConnectionId::new("c1"), "provider-token")
            .await
            .unwrap();

        let second = f
            .gateway
            .connect(ConnectionId::new("c2"), "requester-token")
            .await
            .unwrap();

        assert_eq!(second.snapshot.len(), 1);
        assert_eq!(second.snapshot[0].user_id, f.provider);
    }

    #[tokio::test]
    async fn test_presence_rebroadcast_on_connect_and_disconnect() {
        let f = fixture();
        let mut first = f
            .gateway
            .connect(ConnectionId::new("c1"), "provider-token")
            .await
            .unwrap();

        let second = f
            .gateway
            .connect(ConnectionId::new("c2"), "requester-token")
            .await
            .unwrap();

        // The earlier session sees the update through the presence room.
        let envelope = first.presence.recv().await.unwrap();
        let event: ServerEvent = serde_json::from_str(&envelope.payload).unwrap();
        match event {
            ServerEvent::PresenceUpdate { online_users } => {
                assert_eq!(online_users.len(), 2);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        f.gateway.disconnect(second.user_id, &second.connection_id);
        let envelope = first.presence.recv().await.unwrap();
        let event: ServerEvent = serde_json::from_str(&envelope.payload).unwrap();
        match event {
            ServerEvent::PresenceUpdate { online_users } => {
                assert_eq!(online_users.len(), 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_feed_sees_provider_ids_only() {
        let f = fixture();
        let feed = f.gateway.watch_feed(ConnectionId::new("anon")).unwrap();
        match feed.snapshot {
            FeedEvent::PresenceConnected { online_provider_ids } => {
                assert!(online_provider_ids.is_empty());
            }
            other => panic!("unexpected snapshot: {other:?}"),
        }

        let mut receiver = feed.receiver;
        let _session = f
            .gateway
            .connect(ConnectionId::new("c1"), "provider-token")
            .await
            .unwrap();

        let envelope = receiver.recv().await.unwrap();
        // Reduced payload: provider ids, nothing else.
        assert!(envelope.payload.contains("online_provider_ids"));
        assert!(!envelope.payload.contains("role"));
        assert!(!envelope.payload.contains("chatting_with"));
        assert!(envelope.payload.contains(&f.provider.to_string()));

        // Requesters never appear on the feed.
        let _other = f
            .gateway
            .connect(ConnectionId::new("c2"), "requester-token")
            .await
            .unwrap();
        let envelope = receiver.recv().await.unwrap();
        assert!(!envelope.payload.contains(&f.requester.to_string()));
    }

    #[tokio::test]
    async fn test_retroactive_delivery_on_reconnect() {
        let f = fixture();
        let conversation = f
            .store
            .create_conversation(f.provider, f.requester)
            .await
            .unwrap();
        f.store
            .insert_message(NewMessage {
                conversation_id: conversation.id,
                sender_id: f.provider,
                kind: MessageKind::Text,
                content: Some("while you were away".into()),
                attachment_url: None,
                attachment_name: None,
                reference_id: None,
                delivered_at: None,
                seen_at: None,
            })
            .await
            .unwrap();

        let session = f
            .gateway
            .connect(ConnectionId::new("c1"), "requester-token")
            .await
            .unwrap();
        session.delivery_catchup.unwrap().await.unwrap();

        let messages = f.store.conversation_messages(conversation.id);
        assert!(messages[0].delivered_at.is_some());
        assert!(messages[0].seen_at.is_none());
    }

    #[tokio::test]
    async fn test_second_device_skips_delivery_catchup() {
        let f = fixture();
        let first = f
            .gateway
            .connect(ConnectionId::new("c1"), "provider-token")
            .await
            .unwrap();
        assert!(first.delivery_catchup.is_some());

        let second = f
            .gateway
            .connect(ConnectionId::new("c2"), "provider-token")
            .await
            .unwrap();
        assert!(second.delivery_catchup.is_none());
    }
}
