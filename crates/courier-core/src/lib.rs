//! # courier-core
//!
//! Presence registry, room index, and message delivery engine for the
//! Courier realtime chat service.
//!
//! This crate provides the engine components:
//!
//! - **PresenceRegistry** - authoritative map of online users, multi-device aware
//! - **Rooms / EventBroadcaster** - named broadcast groups and typed publish primitives
//! - **ConnectionGateway** - authenticated sessions and the anonymous provider feed
//! - **ConversationRoomManager** - room membership, read watermarks, unread catch-up
//! - **MessageDispatcher** - message creation and the sent/delivered/seen state machine
//! - **TypingIndicatorRelay** - ephemeral typing signals
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐    ┌──────────────────┐    ┌─────────────────┐
//! │ Connection │───▶│ ConnectionGateway│───▶│ PresenceRegistry│
//! └────────────┘    └──────────────────┘    └─────────────────┘
//!        │                                           │
//!        ▼                                           ▼
//! ┌──────────────────────┐   ┌───────────────┐   ┌────────┐
//! │ConversationRoomMgr / │──▶│EventBroadcaster│──▶│ Rooms │
//! │  MessageDispatcher   │   └───────────────┘   └────────┘
//! └──────────────────────┘
//!          │
//!          ▼
//!   ChatStore / Notifier (external collaborators)
//! ```

pub mod broadcast;
pub mod conversation;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod memory;
pub mod presence;
pub mod room;
pub mod store;
pub mod typing;

pub use broadcast::EventBroadcaster;
pub use conversation::{ConversationRoomManager, JoinedRoom};
pub use dispatch::MessageDispatcher;
pub use error::ChatError;
pub use gateway::{ConnectionGateway, FeedSubscription, Session};
pub use memory::{MemoryStore, NullNotifier, StaticTokenVerifier};
pub use presence::{ConnectionId, PresenceRegistry, PresenceSnapshot};
pub use room::{Envelope, Membership, RoomKey, Rooms, RoomsConfig};
pub use store::{ChatStore, Identity, NewMessage, Notifier, TokenVerifier};
pub use typing::TypingIndicatorRelay;
