//! Conversation room membership and read catch-up.
//!
//! A (user, conversation) pair is either not-joined or joined. Joining
//! is gated on the stored participant list and triggers background
//! bookkeeping: bulk delivery marking, watermark advance, unread reset,
//! and bulk seen marking. The join itself returns immediately so the
//! user sees their history without waiting on read-receipt bookkeeping.

use crate::broadcast::EventBroadcaster;
use crate::error::ChatError;
use crate::presence::ConnectionId;
use crate::room::{Envelope, RoomKey, Rooms};
use crate::store::ChatStore;
use chrono::Utc;
use courier_protocol::{ConversationId, ServerEvent, UserId};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Outcome of joining a conversation room.
pub struct JoinedRoom {
    /// Receiver for events published to the conversation room.
    pub receiver: broadcast::Receiver<Arc<Envelope>>,
    /// False when the connection was already in the room.
    pub newly_joined: bool,
    /// Background catch-up task. Callers may ignore it; it runs to
    /// completion or fails into a log.
    pub catchup: JoinHandle<()>,
}

/// Enforces room membership against stored participant lists and keeps
/// read cursors and unread counters correct.
#[derive(Clone)]
pub struct ConversationRoomManager {
    store: Arc<dyn ChatStore>,
    rooms: Arc<Rooms>,
    broadcaster: EventBroadcaster,
}

impl ConversationRoomManager {
    /// Create a room manager.
    #[must_use]
    pub fn new(
        store: Arc<dyn ChatStore>,
        rooms: Arc<Rooms>,
        broadcaster: EventBroadcaster,
    ) -> Self {
        Self {
            store,
            rooms,
            broadcaster,
        }
    }

    /// Join a user's connection to a conversation room.
    ///
    /// Idempotent: a repeated join yields the same membership and the
    /// catch-up settles to the same state. Bookkeeping runs in the
    /// background and never blocks the caller.
    ///
    /// # Errors
    ///
    /// [`ChatError::ConversationNotFound`] for an unknown conversation,
    /// [`ChatError::NotParticipant`] if the user is not stored as a
    /// participant.
    pub async fn join(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        conn_id: &ConnectionId,
    ) -> Result<JoinedRoom, ChatError> {
        let conversation = self
            .store
            .conversation(conversation_id)
            .await?
            .ok_or(ChatError::ConversationNotFound)?;
        if !conversation.has_participant(user_id) {
            return Err(ChatError::NotParticipant);
        }

        let membership = self
            .rooms
            .join(conn_id, RoomKey::Conversation(conversation_id))
            .ok_or_else(|| ChatError::store("room limit reached"))?;

        debug!(user = %user_id, conversation = %conversation_id, "Joined conversation room");

        let manager = self.clone();
        let catchup = tokio::spawn(async move {
            if let Err(e) = manager.catch_up(user_id, conversation_id).await {
                warn!(
                    user = %user_id,
                    conversation = %conversation_id,
                    error = %e,
                    "Read catch-up failed"
                );
            }
        });

        Ok(JoinedRoom {
            receiver: membership.receiver,
            newly_joined: membership.newly_joined,
            catchup,
        })
    }

    /// Remove a connection from a conversation room. No state mutation.
    pub fn leave(&self, conversation_id: ConversationId, conn_id: &ConnectionId) {
        self.rooms
            .leave(conn_id, &RoomKey::Conversation(conversation_id));
    }

    /// Bulk bookkeeping after a join: deliver, advance the watermark,
    /// zero the unread counter, mark seen, then tell the other
    /// participants their messages were read.
    async fn catch_up(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<(), ChatError> {
        let now = Utc::now();

        self.store
            .mark_delivered(conversation_id, user_id, now)
            .await?;

        let watermark = self
            .store
            .latest_message_at(conversation_id)
            .await?
            .unwrap_or(now);

        self.store
            .reset_unread(conversation_id, user_id, watermark)
            .await?;

        let seen = self
            .store
            .mark_seen_up_to(conversation_id, user_id, watermark, now)
            .await?;

        if !seen.is_empty() {
            self.broadcaster.to_conversation(
                conversation_id,
                &ServerEvent::MessagesRead {
                    conversation_id,
                    reader_id: user_id,
                    read_at: watermark,
                },
            );
            debug!(
                user = %user_id,
                conversation = %conversation_id,
                seen = seen.len(),
                "Read catch-up complete"
            );
        }

        Ok(())
    }
}
