//! Event vocabulary for the Courier protocol.
//!
//! Every WebSocket frame is one JSON object tagged by `event`, with the
//! variant payload under `data`.

use crate::model::{
    ChatMessage, Conversation, ConversationId, ConversationOverview, MessageDraft, OnlineUser,
    TopicKind, UserId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Handshake: must be the first event on an authenticated socket.
    Connect { token: String },
    /// Keepalive; refreshes the presence `last_active` timestamp.
    Heartbeat,
    /// The client opened the chat pane with a peer.
    ChatFocus { peer_id: UserId },
    /// The client closed the chat pane.
    ChatBlur,
    JoinConversation { conversation_id: ConversationId },
    LeaveConversation { conversation_id: ConversationId },
    FetchMessages {
        conversation_id: ConversationId,
        #[serde(default)]
        page: u32,
        #[serde(default = "default_page_limit")]
        limit: u32,
    },
    GetConversations,
    GetConversation { conversation_id: ConversationId },
    CreateConversation { other_user_id: UserId },
    SendMessage {
        conversation_id: ConversationId,
        #[serde(flatten)]
        draft: MessageDraft,
    },
    Typing {
        conversation_id: ConversationId,
        is_typing: bool,
    },
    SubscribeTopic { kind: TopicKind, id: String },
    UnsubscribeTopic { kind: TopicKind, id: String },
}

fn default_page_limit() -> u32 {
    50
}

/// Events sent to authenticated sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// First event after a successful handshake: snapshot of the other
    /// online users.
    PresenceConnected { online_users: Vec<OnlineUser> },
    /// The set of online users changed.
    PresenceUpdate { online_users: Vec<OnlineUser> },
    MessagesFetched {
        conversation_id: ConversationId,
        messages: Vec<ChatMessage>,
        page: u32,
    },
    ConversationsFetched {
        conversations: Vec<ConversationOverview>,
    },
    ConversationFetched { conversation: Conversation },
    ConversationCreated { conversation: Conversation },
    /// Per-recipient summary refresh; `unread_count` is always the
    /// receiving participant's own counter.
    ConversationUpdated {
        conversation_id: ConversationId,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_message_text: Option<String>,
        last_message_at: DateTime<Utc>,
        last_sender_id: UserId,
        unread_count: u32,
    },
    NewMessage { message: ChatMessage },
    JoinedConversation { conversation_id: ConversationId },
    LeftConversation { conversation_id: ConversationId },
    /// A participant advanced their read watermark; every message at or
    /// before `read_at` is now seen.
    MessagesRead {
        conversation_id: ConversationId,
        reader_id: UserId,
        read_at: DateTime<Utc>,
    },
    UserTyping {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },
    /// External marketplace state change pushed into a topic or
    /// personal room.
    TopicUpdate {
        kind: TopicKind,
        id: String,
        payload: serde_json::Value,
    },
    Error { message: String },
}

impl ServerEvent {
    /// A generic error event for the acting connection.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }
}

/// Events visible on the anonymous feed.
///
/// Deliberately reduced: provider ids only, never presence records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum FeedEvent {
    PresenceConnected { online_provider_ids: Vec<UserId> },
    PresenceUpdate { online_provider_ids: Vec<UserId> },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageKind;

    #[test]
    fn test_client_event_tagging() {
        let event = ClientEvent::Connect {
            token: "tok".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event":"connect""#));

        let back: ClientEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn test_unit_variant_omits_data() {
        let json = serde_json::to_string(&ClientEvent::Heartbeat).unwrap();
        assert_eq!(json, r#"{"event":"heartbeat"}"#);

        let back: ClientEvent = serde_json::from_str(r#"{"event":"heartbeat"}"#).unwrap();
        assert_eq!(back, ClientEvent::Heartbeat);
    }

    #[test]
    fn test_send_message_flattens_draft() {
        let text = r#"{
            "event": "send_message",
            "data": {
                "conversation_id": "6a4f2c2c-98f9-4f0a-8f5e-000000000001",
                "content": "hello there",
                "kind": "text"
            }
        }"#;

        let event: ClientEvent = serde_json::from_str(text).unwrap();
        match event {
            ClientEvent::SendMessage { draft, .. } => {
                assert_eq!(draft.content.as_deref(), Some("hello there"));
                assert_eq!(draft.kind, MessageKind::Text);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_fetch_defaults() {
        let text = r#"{
            "event": "fetch_messages",
            "data": { "conversation_id": "6a4f2c2c-98f9-4f0a-8f5e-000000000001" }
        }"#;

        let event: ClientEvent = serde_json::from_str(text).unwrap();
        match event {
            ClientEvent::FetchMessages { page, limit, .. } => {
                assert_eq!(page, 0);
                assert_eq!(limit, 50);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_feed_event_is_ids_only() {
        let event = FeedEvent::PresenceUpdate {
            online_provider_ids: vec![UserId::generate()],
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("online_provider_ids"));
        assert!(!json.contains("role"));
        assert!(!json.contains("last_active"));
    }
}
