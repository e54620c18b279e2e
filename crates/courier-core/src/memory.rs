//! In-memory collaborator implementations.
//!
//! Used by the engine's tests and by the single-process server when no
//! external store is wired in. Not durable.

use crate::error::ChatError;
use crate::store::{ChatStore, Identity, NewMessage, Notifier, TokenVerifier};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_protocol::{
    ChatMessage, Conversation, ConversationId, ConversationOverview, MessageId, ParticipantState,
    RoleClass, UserId,
};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

#[derive(Default)]
struct StoreInner {
    conversations: HashMap<ConversationId, Conversation>,
    participants: HashMap<(ConversationId, UserId), ParticipantState>,
    messages: Vec<ChatMessage>,
}

/// In-memory [`ChatStore`].
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fetch one message by id. Test helper.
    #[must_use]
    pub fn message(&self, id: MessageId) -> Option<ChatMessage> {
        self.lock().messages.iter().find(|m| m.id == id).cloned()
    }

    /// All messages of a conversation, oldest first. Test helper.
    #[must_use]
    pub fn conversation_messages(&self, id: ConversationId) -> Vec<ChatMessage> {
        self.lock()
            .messages
            .iter()
            .filter(|m| m.conversation_id == id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn conversation(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, ChatError> {
        Ok(self.lock().conversations.get(&id).cloned())
    }

    async fn conversations_for(
        &self,
        user_id: UserId,
    ) -> Result<Vec<ConversationOverview>, ChatError> {
        let inner = self.lock();
        let mut overviews: Vec<ConversationOverview> = inner
            .conversations
            .values()
            .filter(|c| c.has_participant(user_id))
            .map(|c| ConversationOverview {
                conversation: c.clone(),
                unread_count: inner
                    .participants
                    .get(&(c.id, user_id))
                    .map(|p| p.unread_count)
                    .unwrap_or(0),
            })
            .collect();
        overviews.sort_by(|a, b| {
            let at = a.conversation.last_message_at.unwrap_or(a.conversation.created_at);
            let bt = b.conversation.last_message_at.unwrap_or(b.conversation.created_at);
            bt.cmp(&at)
        });
        Ok(overviews)
    }

    async fn conversation_between(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<Option<Conversation>, ChatError> {
        Ok(self
            .lock()
            .conversations
            .values()
            .find(|c| c.has_participant(a) && c.has_participant(b))
            .cloned())
    }

    async fn create_conversation(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<Conversation, ChatError> {
        let now = Utc::now();
        let conversation = Conversation {
            id: ConversationId::generate(),
            participants: vec![a, b],
            created_at: now,
            last_message_text: None,
            last_message_at: None,
            last_sender_id: None,
        };

        let mut inner = self.lock();
        for user in [a, b] {
            inner.participants.insert(
                (conversation.id, user),
                ParticipantState {
                    unread_count: 0,
                    last_read_at: now,
                },
            );
        }
        inner
            .conversations
            .insert(conversation.id, conversation.clone());
        debug!(conversation = %conversation.id, "Created conversation");
        Ok(conversation)
    }

    async fn participant_state(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<ParticipantState>, ChatError> {
        Ok(self
            .lock()
            .participants
            .get(&(conversation_id, user_id))
            .copied())
    }

    async fn insert_message(&self, message: NewMessage) -> Result<ChatMessage, ChatError> {
        let record = ChatMessage {
            id: MessageId::generate(),
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            kind: message.kind,
            content: message.content,
            attachment_url: message.attachment_url,
            attachment_name: message.attachment_name,
            reference_id: message.reference_id,
            created_at: Utc::now(),
            delivered_at: message.delivered_at,
            seen_at: message.seen_at,
        };
        self.lock().messages.push(record.clone());
        Ok(record)
    }

    async fn messages_page(
        &self,
        conversation_id: ConversationId,
        page: u32,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        let inner = self.lock();
        let mut messages: Vec<ChatMessage> = inner
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        // Newest page first, oldest first within the page.
        messages.reverse();
        let start = (page as usize).saturating_mul(limit as usize);
        let mut page: Vec<ChatMessage> =
            messages.into_iter().skip(start).take(limit as usize).collect();
        page.reverse();
        Ok(page)
    }

    async fn latest_message_at(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<DateTime<Utc>>, ChatError> {
        Ok(self
            .lock()
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .map(|m| m.created_at)
            .max())
    }

    async fn update_summary(
        &self,
        conversation_id: ConversationId,
        last_message_text: Option<String>,
        last_message_at: DateTime<Utc>,
        last_sender_id: UserId,
    ) -> Result<(), ChatError> {
        let mut inner = self.lock();
        let conversation = inner
            .conversations
            .get_mut(&conversation_id)
            .ok_or(ChatError::ConversationNotFound)?;
        conversation.last_message_text = last_message_text;
        conversation.last_message_at = Some(last_message_at);
        conversation.last_sender_id = Some(last_sender_id);
        Ok(())
    }

    async fn reset_unread(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        read_at: DateTime<Utc>,
    ) -> Result<(), ChatError> {
        let mut inner = self.lock();
        if let Some(state) = inner.participants.get_mut(&(conversation_id, user_id)) {
            state.unread_count = 0;
            if read_at > state.last_read_at {
                state.last_read_at = read_at;
            }
        }
        Ok(())
    }

    async fn increment_unread(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<u32, ChatError> {
        let mut inner = self.lock();
        let state = inner
            .participants
            .get_mut(&(conversation_id, user_id))
            .ok_or(ChatError::NotParticipant)?;
        state.unread_count += 1;
        Ok(state.unread_count)
    }

    async fn mark_delivered(
        &self,
        conversation_id: ConversationId,
        reader: UserId,
        at: DateTime<Utc>,
    ) -> Result<usize, ChatError> {
        let mut inner = self.lock();
        let mut marked = 0;
        for message in inner.messages.iter_mut().filter(|m| {
            m.conversation_id == conversation_id
                && m.sender_id != reader
                && m.delivered_at.is_none()
        }) {
            message.delivered_at = Some(at);
            marked += 1;
        }
        Ok(marked)
    }

    async fn mark_seen_up_to(
        &self,
        conversation_id: ConversationId,
        reader: UserId,
        watermark: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<Vec<MessageId>, ChatError> {
        let mut inner = self.lock();
        let mut seen = Vec::new();
        for message in inner.messages.iter_mut().filter(|m| {
            m.conversation_id == conversation_id
                && m.sender_id != reader
                && m.seen_at.is_none()
                && m.created_at <= watermark
        }) {
            message.seen_at = Some(at);
            seen.push(message.id);
        }
        Ok(seen)
    }

    async fn mark_delivered_for_recipient(
        &self,
        recipient: UserId,
        at: DateTime<Utc>,
    ) -> Result<usize, ChatError> {
        let mut inner = self.lock();
        let recipient_conversations: Vec<ConversationId> = inner
            .conversations
            .values()
            .filter(|c| c.has_participant(recipient))
            .map(|c| c.id)
            .collect();

        let mut marked = 0;
        for message in inner.messages.iter_mut().filter(|m| {
            recipient_conversations.contains(&m.conversation_id)
                && m.sender_id != recipient
                && m.delivered_at.is_none()
        }) {
            message.delivered_at = Some(at);
            marked += 1;
        }
        Ok(marked)
    }
}

/// Token verifier backed by a fixed token table.
#[derive(Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenVerifier {
    /// Create an empty verifier (rejects everything).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token for a user.
    pub fn insert(&mut self, token: impl Into<String>, user_id: UserId, role: RoleClass) {
        self.tokens.insert(token.into(), Identity { user_id, role });
    }

    /// Builder-style registration.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, user_id: UserId, role: RoleClass) -> Self {
        self.insert(token, user_id, role);
        self
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, ChatError> {
        self.tokens
            .get(token)
            .copied()
            .ok_or(ChatError::AuthenticationFailed)
    }
}

/// Notifier that logs and does nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify_unread(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        _message: &ChatMessage,
        unread_count: u32,
    ) -> Result<(), ChatError> {
        debug!(user = %user_id, conversation = %conversation_id, unread = unread_count, "Unread notification");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_protocol::MessageKind;

    fn draft(conversation_id: ConversationId, sender_id: UserId, text: &str) -> NewMessage {
        NewMessage {
            conversation_id,
            sender_id,
            kind: MessageKind::Text,
            content: Some(text.into()),
            attachment_url: None,
            attachment_name: None,
            reference_id: None,
            delivered_at: None,
            seen_at: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_list_conversations() {
        let store = MemoryStore::new();
        let a = UserId::generate();
        let b = UserId::generate();

        let conversation = store.create_conversation(a, b).await.unwrap();
        assert!(store
            .conversation_between(a, b)
            .await
            .unwrap()
            .is_some());

        let overviews = store.conversations_for(a).await.unwrap();
        assert_eq!(overviews.len(), 1);
        assert_eq!(overviews[0].conversation.id, conversation.id);
        assert_eq!(overviews[0].unread_count, 0);

        let state = store
            .participant_state(conversation.id, b)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.unread_count, 0);
    }

    #[tokio::test]
    async fn test_unread_counters() {
        let store = MemoryStore::new();
        let a = UserId::generate();
        let b = UserId::generate();
        let conversation = store.create_conversation(a, b).await.unwrap();

        assert_eq!(store.increment_unread(conversation.id, b).await.unwrap(), 1);
        assert_eq!(store.increment_unread(conversation.id, b).await.unwrap(), 2);

        store
            .reset_unread(conversation.id, b, Utc::now())
            .await
            .unwrap();
        let state = store
            .participant_state(conversation.id, b)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.unread_count, 0);
    }

    #[tokio::test]
    async fn test_bulk_delivery_and_seen() {
        let store = MemoryStore::new();
        let a = UserId::generate();
        let b = UserId::generate();
        let conversation = store.create_conversation(a, b).await.unwrap();

        for i in 0..3 {
            store
                .insert_message(draft(conversation.id, a, &format!("m{i}")))
                .await
                .unwrap();
        }

        let now = Utc::now();
        assert_eq!(store.mark_delivered(conversation.id, b, now).await.unwrap(), 3);

        let watermark = store
            .latest_message_at(conversation.id)
            .await
            .unwrap()
            .unwrap();
        let seen = store
            .mark_seen_up_to(conversation.id, b, watermark, now)
            .await
            .unwrap();
        assert_eq!(seen.len(), 3);

        for message in store.conversation_messages(conversation.id) {
            assert!(message.delivered_at.is_some());
            assert!(message.seen_at.is_some());
        }

        // Second pass marks nothing.
        assert_eq!(store.mark_delivered(conversation.id, b, now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_messages_page() {
        let store = MemoryStore::new();
        let a = UserId::generate();
        let b = UserId::generate();
        let conversation = store.create_conversation(a, b).await.unwrap();

        for i in 0..5 {
            store
                .insert_message(draft(conversation.id, a, &format!("m{i}")))
                .await
                .unwrap();
        }

        let first = store.messages_page(conversation.id, 0, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].content.as_deref(), Some("m3"));
        assert_eq!(first[1].content.as_deref(), Some("m4"));

        let last = store.messages_page(conversation.id, 2, 2).await.unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].content.as_deref(), Some("m0"));
    }

    #[tokio::test]
    async fn test_retroactive_delivery() {
        let store = MemoryStore::new();
        let a = UserId::generate();
        let b = UserId::generate();
        let conversation = store.create_conversation(a, b).await.unwrap();

        store
            .insert_message(draft(conversation.id, a, "offline message"))
            .await
            .unwrap();

        let marked = store
            .mark_delivered_for_recipient(b, Utc::now())
            .await
            .unwrap();
        assert_eq!(marked, 1);

        // Sender's own messages never count as deliveries to them.
        assert_eq!(
            store.mark_delivered_for_recipient(a, Utc::now()).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_static_verifier() {
        let user = UserId::generate();
        let verifier =
            StaticTokenVerifier::new().with_token("good", user, RoleClass::ProviderCapable);

        let identity = verifier.verify("good").await.unwrap();
        assert_eq!(identity.user_id, user);
        assert!(matches!(
            verifier.verify("bad").await,
            Err(ChatError::AuthenticationFailed)
        ));
    }
}
