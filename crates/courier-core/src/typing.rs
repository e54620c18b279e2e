//! Typing indicator relay.
//!
//! Typing signals are ephemeral: nothing is persisted, the server does
//! no debouncing, and expiry is a client-side timeout. The signal is
//! relayed to the rest of the conversation room, never back to the
//! sender.

use crate::broadcast::EventBroadcaster;
use crate::error::ChatError;
use crate::presence::ConnectionId;
use crate::store::ChatStore;
use courier_protocol::{ConversationId, ServerEvent, UserId};
use std::sync::Arc;

/// Relays typing signals between conversation participants.
#[derive(Clone)]
pub struct TypingIndicatorRelay {
    store: Arc<dyn ChatStore>,
    broadcaster: EventBroadcaster,
}

impl TypingIndicatorRelay {
    /// Create a relay.
    #[must_use]
    pub fn new(store: Arc<dyn ChatStore>, broadcaster: EventBroadcaster) -> Self {
        Self { store, broadcaster }
    }

    /// Relay a typing signal, last-write-wins.
    ///
    /// # Errors
    ///
    /// [`ChatError::NotParticipant`] if the user does not belong to the
    /// conversation; [`ChatError::ConversationNotFound`] for an unknown
    /// conversation.
    pub async fn set_typing(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        is_typing: bool,
        conn_id: &ConnectionId,
    ) -> Result<(), ChatError> {
        let conversation = self
            .store
            .conversation(conversation_id)
            .await?
            .ok_or(ChatError::ConversationNotFound)?;
        if !conversation.has_participant(user_id) {
            return Err(ChatError::NotParticipant);
        }

        self.broadcaster.to_conversation_excluding(
            conversation_id,
            &ServerEvent::UserTyping {
                conversation_id,
                user_id,
                is_typing,
            },
            conn_id,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::room::{RoomKey, Rooms};

    #[tokio::test]
    async fn test_typing_relayed_excluding_sender() {
        let store = Arc::new(MemoryStore::new());
        let rooms = Arc::new(Rooms::new());
        let broadcaster = EventBroadcaster::new(rooms.clone());
        let relay = TypingIndicatorRelay::new(store.clone(), broadcaster);

        let a = UserId::generate();
        let b = UserId::generate();
        let conversation = store.create_conversation(a, b).await.unwrap().id;

        let conn_a = ConnectionId::new("a1");
        let conn_b = ConnectionId::new("b1");
        let room = RoomKey::Conversation(conversation);
        let mut a_rx = rooms.join(&conn_a, room.clone()).unwrap().receiver;
        let mut b_rx = rooms.join(&conn_b, room).unwrap().receiver;

        relay.set_typing(a, conversation, true, &conn_a).await.unwrap();

        let envelope = b_rx.recv().await.unwrap();
        assert_eq!(envelope.exclude.as_ref(), Some(&conn_a));
        let event: ServerEvent = serde_json::from_str(&envelope.payload).unwrap();
        match event {
            ServerEvent::UserTyping { user_id, is_typing, .. } => {
                assert_eq!(user_id, a);
                assert!(is_typing);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // The broadcast reaches the sender's receiver too; the
        // connection task drops it based on `exclude`.
        let own = a_rx.recv().await.unwrap();
        assert_eq!(own.exclude.as_ref(), Some(&conn_a));
    }

    #[tokio::test]
    async fn test_typing_requires_participant() {
        let store = Arc::new(MemoryStore::new());
        let rooms = Arc::new(Rooms::new());
        let relay = TypingIndicatorRelay::new(store.clone(), EventBroadcaster::new(rooms));

        let a = UserId::generate();
        let b = UserId::generate();
        let conversation = store.create_conversation(a, b).await.unwrap().id;

        let result = relay
            .set_typing(UserId::generate(), conversation, true, &ConnectionId::new("x"))
            .await;
        assert!(matches!(result, Err(ChatError::NotParticipant)));

        let result = relay
            .set_typing(a, ConversationId::generate(), true, &ConnectionId::new("x"))
            .await;
        assert!(matches!(result, Err(ChatError::ConversationNotFound)));
    }
}
