//! Typed event vocabulary for the realtime channel.
//!
//! Every frame on the wire is a JSON object tagged by event name:
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ { "event": "send_message",                  │
//! │   "data":  { "toUserId": "...", ... } }     │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! The event names and payload field names are load-bearing: the mobile
//! app and the admin dashboard already speak this vocabulary, so inbound
//! and outbound shapes here are kept exactly as the clients expect
//! (snake_case event names, camelCase payload fields).
//!
//! Frames are decoded into [`ClientEvent`] once, at the transport
//! boundary, before anything reaches the router. A frame that does not
//! decode never makes it past this module.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

use crate::call::CallStatus;

/// Milliseconds since the Unix epoch. All timestamps in the protocol
/// and the delay store use this representation.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ───────────────────────────────────────────────────────────────────
// Identity
// ───────────────────────────────────────────────────────────────────

/// The three account roles the marketplace knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Customer,
    Provider,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Provider => "provider",
            Role::Admin => "admin",
        }
    }

    /// Parse a wire role string. Returns `None` for anything unknown.
    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "customer" => Some(Role::Customer),
            "provider" => Some(Role::Provider),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Chat messages
// ───────────────────────────────────────────────────────────────────

/// A chat message as it travels between two users.
///
/// The id and timestamp are assigned server-side when the message is
/// routed; durable storage belongs to the message repository outside
/// this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub from_user_id: String,
    pub to_user_id: String,
    pub body: String,
    /// Free-form kind tag ("text", "image", "quote", …) — treated
    /// opaquely by the router.
    pub kind: String,
    /// Milliseconds since epoch, assigned on routing.
    pub timestamp: u64,
    pub read_flag: bool,
}

// ───────────────────────────────────────────────────────────────────
// Inbound events (client → server)
// ───────────────────────────────────────────────────────────────────

/// Everything a client may send over its live connection.
///
/// One variant per event name; payload shapes are validated by serde
/// at decode time, so the router only ever sees well-formed events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    /// First frame on every connection: `{userId, role}`.
    Authenticate { user_id: String, role: Role },

    /// Join a named room (conversation rooms, mostly).
    JoinRoom { room: String },

    /// Leave a previously joined room.
    LeaveRoom { room: String },

    /// Send a chat message to another user.
    SendMessage {
        to_user_id: String,
        body: String,
        kind: String,
        conversation_id: Option<String>,
    },

    /// Typing indicator on.
    TypingStart { conversation_id: String },

    /// Typing indicator off.
    TypingStop { conversation_id: String },

    /// Customer starts a call to a provider.
    CallInitiated {
        provider_id: String,
        service_request_id: Option<String>,
    },

    /// Clean disconnect (the socket closing works too).
    Disconnect,
}

impl ClientEvent {
    /// Decode a JSON text frame into a typed event.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    /// The wire event name for this variant.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Authenticate { .. } => "authenticate",
            ClientEvent::JoinRoom { .. } => "join_room",
            ClientEvent::LeaveRoom { .. } => "leave_room",
            ClientEvent::SendMessage { .. } => "send_message",
            ClientEvent::TypingStart { .. } => "typing_start",
            ClientEvent::TypingStop { .. } => "typing_stop",
            ClientEvent::CallInitiated { .. } => "call_initiated",
            ClientEvent::Disconnect => "disconnect",
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Outbound events (server → client)
// ───────────────────────────────────────────────────────────────────

/// Everything the server may emit to a connected client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// A chat message addressed to this user.
    MessageReceived { message: Message },

    /// Echo back to the sender once a message has been routed.
    MessageSent { message: Message },

    /// Someone in a shared conversation started or stopped typing.
    UserTyping {
        user_id: String,
        conversation_id: String,
        typing: bool,
    },

    /// A call involving this user changed status.
    CallStatusChanged {
        call_id: Uuid,
        status: CallStatus,
        customer_id: String,
        provider_id: String,
    },

    /// Generic templated notification delivered over the live channel.
    Notification {
        template_id: String,
        payload: serde_json::Value,
    },

    /// A request from this connection was rejected.
    Error { code: String, message: String },
}

impl ServerEvent {
    /// Encode to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// The wire event name for this variant.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::MessageReceived { .. } => "message_received",
            ServerEvent::MessageSent { .. } => "message_sent",
            ServerEvent::UserTyping { .. } => "user_typing",
            ServerEvent::CallStatusChanged { .. } => "call_status_changed",
            ServerEvent::Notification { .. } => "notification",
            ServerEvent::Error { .. } => "error",
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    /// Frame is not valid JSON or does not match any event shape.
    Decode(String),
    /// Outbound event failed to serialize.
    Encode(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Decode(e) => write!(f, "Malformed event frame: {e}"),
            ProtocolError::Encode(e) => write!(f, "Event serialization failed: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

// ===================================================================
// Tests
// ===================================================================
