//! Typed publish primitives.
//!
//! The broadcaster is the stateless publish surface shared by the
//! dispatcher and by external marketplace services (order, offer,
//! dispute) that push state changes after their own persistence
//! commits. Delivery is at-least-once to currently subscribed sessions
//! only; there is no queuing or replay.

use crate::presence::ConnectionId;
use crate::room::{Envelope, RoomKey, Rooms};
use courier_protocol::{codec, ConversationId, FeedEvent, ServerEvent, TopicKind, UserId};
use std::sync::Arc;
use tracing::warn;

/// Stateless publish surface over the room index.
#[derive(Clone)]
pub struct EventBroadcaster {
    rooms: Arc<Rooms>,
}

impl EventBroadcaster {
    /// Create a broadcaster over a room index.
    #[must_use]
    pub fn new(rooms: Arc<Rooms>) -> Self {
        Self { rooms }
    }

    /// The underlying room index.
    #[must_use]
    pub fn rooms(&self) -> &Arc<Rooms> {
        &self.rooms
    }

    fn publish_server(&self, room: RoomKey, event: &ServerEvent) -> usize {
        match codec::encode_server(event) {
            Ok(payload) => self.rooms.publish(Envelope::new(room, payload)),
            Err(e) => {
                warn!(room = %room, error = %e, "Failed to encode event");
                0
            }
        }
    }

    /// Publish to a user's personal room (every device of that user).
    pub fn to_user(&self, user_id: UserId, event: &ServerEvent) -> usize {
        self.publish_server(RoomKey::User(user_id), event)
    }

    /// Publish to a conversation room.
    pub fn to_conversation(&self, conversation_id: ConversationId, event: &ServerEvent) -> usize {
        self.publish_server(RoomKey::Conversation(conversation_id), event)
    }

    /// Publish to a conversation room, excluding one connection.
    pub fn to_conversation_excluding(
        &self,
        conversation_id: ConversationId,
        event: &ServerEvent,
        exclude: &ConnectionId,
    ) -> usize {
        let room = RoomKey::Conversation(conversation_id);
        match codec::encode_server(event) {
            Ok(payload) => self
                .rooms
                .publish(Envelope::new(room, payload).excluding(exclude.clone())),
            Err(e) => {
                warn!(room = %room, error = %e, "Failed to encode event");
                0
            }
        }
    }

    /// Publish to an order/dispute topic room.
    pub fn to_topic(&self, kind: TopicKind, topic_id: &str, event: &ServerEvent) -> usize {
        self.publish_server(RoomKey::Topic(kind, topic_id.to_string()), event)
    }

    /// Publish to every authenticated session.
    pub fn to_presence(&self, event: &ServerEvent) -> usize {
        self.publish_server(RoomKey::Presence, event)
    }

    /// Publish to the anonymous feed (provider ids only).
    pub fn to_anonymous_feed(&self, event: &FeedEvent) -> usize {
        match codec::encode_feed(event) {
            Ok(payload) => self.rooms.publish(Envelope::new(RoomKey::Feed, payload)),
            Err(e) => {
                warn!(error = %e, "Failed to encode feed event");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_to_user_reaches_all_devices() {
        let rooms = Arc::new(Rooms::new());
        let broadcaster = EventBroadcaster::new(rooms.clone());
        let user = UserId::generate();

        let mut phone = rooms
            .join(&ConnectionId::new("phone"), RoomKey::User(user))
            .unwrap();
        let mut laptop = rooms
            .join(&ConnectionId::new("laptop"), RoomKey::User(user))
            .unwrap();

        let count = broadcaster.to_user(user, &ServerEvent::error("test"));
        assert_eq!(count, 2);

        let envelope = phone.receiver.recv().await.unwrap();
        assert!(envelope.payload.contains("\"event\":\"error\""));
        assert!(laptop.receiver.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_excluded_connection_marked() {
        let rooms = Arc::new(Rooms::new());
        let broadcaster = EventBroadcaster::new(rooms.clone());
        let conversation = ConversationId::generate();
        let sender_conn = ConnectionId::new("sender");

        let mut membership = rooms
            .join(&sender_conn, RoomKey::Conversation(conversation))
            .unwrap();

        broadcaster.to_conversation_excluding(
            conversation,
            &ServerEvent::UserTyping {
                conversation_id: conversation,
                user_id: UserId::generate(),
                is_typing: true,
            },
            &sender_conn,
        );

        // The envelope still reaches the broadcast channel; the
        // connection task is responsible for honoring `exclude`.
        let envelope = membership.receiver.recv().await.unwrap();
        assert_eq!(envelope.exclude.as_ref(), Some(&sender_conn));
    }

    #[tokio::test]
    async fn test_topic_rooms_carry_external_updates() {
        let rooms = Arc::new(Rooms::new());
        let broadcaster = EventBroadcaster::new(rooms.clone());
        let key = RoomKey::Topic(TopicKind::Order, "order-7".into());

        let mut membership = rooms.join(&ConnectionId::new("c1"), key).unwrap();

        // An order service pushes a state change after its own commit.
        let count = broadcaster.to_topic(
            TopicKind::Order,
            "order-7",
            &ServerEvent::TopicUpdate {
                kind: TopicKind::Order,
                id: "order-7".into(),
                payload: serde_json::json!({"status": "completed"}),
            },
        );
        assert_eq!(count, 1);

        let envelope = membership.receiver.recv().await.unwrap();
        assert!(envelope.payload.contains("topic_update"));
        assert!(envelope.payload.contains("completed"));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let broadcaster = EventBroadcaster::new(Arc::new(Rooms::new()));
        assert_eq!(
            broadcaster.to_user(UserId::generate(), &ServerEvent::error("nobody home")),
            0
        );
        assert_eq!(
            broadcaster.to_anonymous_feed(&FeedEvent::PresenceUpdate {
                online_provider_ids: vec![],
            }),
            0
        );
    }
}
