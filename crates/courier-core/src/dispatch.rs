//! Message dispatch.
//!
//! `send` creates the message record, computes its delivery state from
//! live presence and room membership, updates the conversation summary
//! and per-participant unread counters, and fans out events. Steps that
//! touch counters run under a per-conversation lock so concurrent sends
//! in the same conversation cannot lose updates; ordering across
//! conversations is not sequenced.

use crate::broadcast::EventBroadcaster;
use crate::error::ChatError;
use crate::presence::PresenceRegistry;
use crate::room::{RoomKey, Rooms};
use crate::store::{ChatStore, NewMessage, Notifier};
use chrono::Utc;
use courier_protocol::{ChatMessage, ConversationId, MessageDraft, ServerEvent, UserId};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Creates message records and drives the sent/delivered/seen state
/// machine.
#[derive(Clone)]
pub struct MessageDispatcher {
    store: Arc<dyn ChatStore>,
    registry: Arc<PresenceRegistry>,
    rooms: Arc<Rooms>,
    broadcaster: EventBroadcaster,
    notifier: Arc<dyn Notifier>,
    /// Per-conversation send serialization.
    locks: Arc<DashMap<ConversationId, Arc<Mutex<()>>>>,
}

impl MessageDispatcher {
    /// Create a dispatcher.
    #[must_use]
    pub fn new(
        store: Arc<dyn ChatStore>,
        registry: Arc<PresenceRegistry>,
        rooms: Arc<Rooms>,
        broadcaster: EventBroadcaster,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            registry,
            rooms,
            broadcaster,
            notifier,
            locks: Arc::new(DashMap::new()),
        }
    }

    fn conversation_lock(&self, conversation_id: ConversationId) -> Arc<Mutex<()>> {
        self.locks
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Send a message into a conversation.
    ///
    /// On success the persisted record is returned and a `new_message`
    /// event plus per-recipient `conversation_updated` events have been
    /// published. Unread notifications run in the background and never
    /// fail the send.
    ///
    /// # Errors
    ///
    /// [`ChatError::NotParticipant`], [`ChatError::ConversationNotFound`],
    /// or [`ChatError::InvalidPayload`]; all are checked before any
    /// write, so a failed send leaves no partial state.
    pub async fn send(
        &self,
        sender_id: UserId,
        conversation_id: ConversationId,
        draft: MessageDraft,
    ) -> Result<ChatMessage, ChatError> {
        let conversation = self
            .store
            .conversation(conversation_id)
            .await?
            .ok_or(ChatError::ConversationNotFound)?;
        if !conversation.has_participant(sender_id) {
            return Err(ChatError::NotParticipant);
        }
        if !draft.has_substance() {
            return Err(ChatError::InvalidPayload(
                "message needs text, an attachment, or an object reference",
            ));
        }

        let recipients: Vec<UserId> = conversation
            .participants
            .iter()
            .copied()
            .filter(|p| *p != sender_id)
            .collect();

        let lock = self.conversation_lock(conversation_id);
        let _guard = lock.lock().await;

        // Delivery state is decided from the recipient's live status at
        // this instant; later reconnects are handled by the gateway's
        // retroactive catch-up.
        let room = RoomKey::Conversation(conversation_id);
        let now = Utc::now();
        let mut any_online = false;
        let mut any_room_open = false;
        let mut recipient_room_open = Vec::with_capacity(recipients.len());
        for recipient in &recipients {
            let conns = self.registry.connections(*recipient);
            let online = !conns.is_empty();
            let open = online && self.rooms.any_member(&conns, &room);
            any_online |= online;
            any_room_open |= open;
            recipient_room_open.push((*recipient, open));
        }

        let message = self
            .store
            .insert_message(NewMessage {
                conversation_id,
                sender_id,
                kind: draft.kind,
                content: draft.content,
                attachment_url: draft.attachment_url,
                attachment_name: draft.attachment_name,
                reference_id: draft.reference_id,
                delivered_at: any_online.then_some(now),
                seen_at: any_room_open.then_some(now),
            })
            .await?;

        let summary_text = message
            .content
            .clone()
            .or_else(|| message.attachment_name.clone());
        self.store
            .update_summary(
                conversation_id,
                summary_text.clone(),
                message.created_at,
                sender_id,
            )
            .await?;

        // The sender has, by definition, read everything up to their
        // own message.
        self.store
            .reset_unread(conversation_id, sender_id, message.created_at)
            .await?;

        let mut recipient_counts = Vec::with_capacity(recipient_room_open.len());
        for (recipient, open) in recipient_room_open {
            let count = if open {
                self.store
                    .reset_unread(conversation_id, recipient, message.created_at)
                    .await?;
                0
            } else {
                self.store
                    .increment_unread(conversation_id, recipient)
                    .await?
            };
            recipient_counts.push((recipient, count));
        }

        self.broadcaster.to_conversation(
            conversation_id,
            &ServerEvent::NewMessage {
                message: message.clone(),
            },
        );

        let summary_update = |unread_count: u32| ServerEvent::ConversationUpdated {
            conversation_id,
            last_message_text: summary_text.clone(),
            last_message_at: message.created_at,
            last_sender_id: sender_id,
            unread_count,
        };
        self.broadcaster.to_user(sender_id, &summary_update(0));
        for (recipient, count) in &recipient_counts {
            self.broadcaster.to_user(*recipient, &summary_update(*count));
        }

        debug!(
            conversation = %conversation_id,
            message = %message.id,
            delivered = message.delivered_at.is_some(),
            seen = message.seen_at.is_some(),
            "Message dispatched"
        );

        for (recipient, count) in recipient_counts {
            if count > 0 {
                let notifier = Arc::clone(&self.notifier);
                let record = message.clone();
                tokio::spawn(async move {
                    if let Err(e) = notifier
                        .notify_unread(recipient, conversation_id, &record, count)
                        .await
                    {
                        warn!(user = %recipient, error = %e, "Unread notification failed");
                    }
                });
            }
        }

        Ok(message)
    }
}
