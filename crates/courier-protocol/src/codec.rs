//! Codec for encoding and decoding Courier events.
//!
//! Events travel as JSON text frames over WebSocket; framing is provided
//! by the transport, so the codec only handles serialization and size
//! limits.

use thiserror::Error;

use crate::events::{ClientEvent, FeedEvent, ServerEvent};

/// Maximum encoded event size (256 KiB).
pub const MAX_EVENT_SIZE: usize = 256 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Event exceeds maximum size.
    #[error("Event size {0} exceeds maximum {MAX_EVENT_SIZE}")]
    EventTooLarge(usize),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode a client event from a text frame.
///
/// # Errors
///
/// Returns an error if the frame is too large or is not a valid event.
pub fn decode_client(text: &str) -> Result<ClientEvent, ProtocolError> {
    if text.len() > MAX_EVENT_SIZE {
        return Err(ProtocolError::EventTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

/// Encode a server event to a text frame.
///
/// # Errors
///
/// Returns an error if the event is too large or serialization fails.
pub fn encode_server(event: &ServerEvent) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(event)?;
    if text.len() > MAX_EVENT_SIZE {
        return Err(ProtocolError::EventTooLarge(text.len()));
    }
    Ok(text)
}

/// Encode an anonymous feed event to a text frame.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_feed(event: &FeedEvent) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(event)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UserId;

    #[test]
    fn test_decode_client() {
        let event = decode_client(r#"{"event":"get_conversations"}"#).unwrap();
        assert_eq!(event, ClientEvent::GetConversations);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_client("not json").is_err());
        assert!(decode_client(r#"{"event":"no_such_event"}"#).is_err());
    }

    #[test]
    fn test_decode_rejects_oversized() {
        let padding = "x".repeat(MAX_EVENT_SIZE + 1);
        let err = decode_client(&padding).unwrap_err();
        assert!(matches!(err, ProtocolError::EventTooLarge(_)));
    }

    #[test]
    fn test_encode_server_roundtrip() {
        let event = ServerEvent::error("nope");
        let text = encode_server(&event).unwrap();
        let back: ServerEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn test_encode_feed() {
        let event = FeedEvent::PresenceConnected {
            online_provider_ids: vec![UserId::generate()],
        };
        let text = encode_feed(&event).unwrap();
        assert!(text.contains("presence_connected"));
    }
}
