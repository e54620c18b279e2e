//! # courier-protocol
//!
//! Wire protocol definitions for the Courier realtime chat engine.
//!
//! This crate defines the JSON event vocabulary exchanged between chat
//! clients and the server over WebSocket, the shared wire records
//! (messages, conversations, presence), and a codec with size limits.
//!
//! ## Event vocabulary
//!
//! - [`ClientEvent`] - everything a client may send (`connect`,
//!   `join_conversation`, `send_message`, `typing`, ...)
//! - [`ServerEvent`] - everything an authenticated session may receive
//!   (`new_message`, `conversation_updated`, `presence_update`, ...)
//! - [`FeedEvent`] - the reduced vocabulary of the anonymous feed
//!   (online provider ids only)
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::{codec, ClientEvent};
//!
//! let text = r#"{"event":"heartbeat"}"#;
//! let event = codec::decode_client(text).unwrap();
//! assert!(matches!(event, ClientEvent::Heartbeat));
//! ```

pub mod codec;
pub mod events;
pub mod model;

pub use codec::{decode_client, encode_feed, encode_server, ProtocolError};
pub use events::{ClientEvent, FeedEvent, ServerEvent};
pub use model::{
    ChatMessage, Conversation, ConversationId, ConversationOverview, MessageDraft, MessageId,
    MessageKind, OnlineUser, ParticipantState, RoleClass, TopicKind, UserId,
};
