//! Event router: one dispatch point for everything a connection sends.
//!
//! ```text
//! frame ──► ClientEvent::decode ──► EventRouter::handle_event
//!                                        │
//!            ┌───────────────┬───────────┼──────────────┐
//!            ▼               ▼           ▼              ▼
//!       RoomManager    CallSignaling  Dispatcher   (reject with
//!       join/leave/    initiate     enqueue only   RouterError,
//!       fan-out        transition   — never await  sender informed)
//!                                     gateway I/O
//! ```
//!
//! Ordering: the server's per-connection read loop awaits each
//! `handle_event` before decoding the next frame, so one connection's
//! events apply strictly in arrival order. Different connections
//! interleave freely — there is no cross-user ordering.
//!
//! A handler may hand work to the dispatcher's background queue but
//! never waits on an external channel itself.

use std::sync::Arc;
use uuid::Uuid;

use crate::call::{CallError, CallSignaling};
use crate::dispatch::{
    Channel, NotificationDispatcher, NotificationEnvelope, TEMPLATE_NEW_MESSAGE,
};
use crate::protocol::{now_millis, ClientEvent, Message, Role, ServerEvent};
use crate::registry::{ConnectionHandle, ConnectionId};
use crate::rooms::{RoomId, RoomManager};

/// Routing errors, reported to the sending connection only.
#[derive(Debug, Clone)]
pub enum RouterError {
    /// The connection has not completed the `authenticate` handshake.
    NotAuthenticated,
    /// The event decoded but fails semantic validation.
    Validation(String),
    /// A call operation failed.
    Call(CallError),
}

impl RouterError {
    /// Stable error code carried in the `error` frame.
    pub fn code(&self) -> &'static str {
        match self {
            RouterError::NotAuthenticated => "not_authenticated",
            RouterError::Validation(_) => "validation",
            RouterError::Call(CallError::NotFound(_)) => "not_found",
            RouterError::Call(CallError::InvalidTransition { .. }) => "invalid_transition",
            RouterError::Call(CallError::Validation(_)) => "validation",
            RouterError::Call(CallError::Repository(_)) => "internal",
        }
    }
}

impl std::fmt::Display for RouterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouterError::NotAuthenticated => write!(f, "Connection is not authenticated"),
            RouterError::Validation(e) => write!(f, "Invalid request: {e}"),
            RouterError::Call(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RouterError {}

impl From<CallError> for RouterError {
    fn from(e: CallError) -> Self {
        RouterError::Call(e)
    }
}

/// The dispatch table over [`ClientEvent`].
pub struct EventRouter {
    rooms: Arc<RoomManager>,
    calls: Arc<CallSignaling>,
    dispatcher: Arc<NotificationDispatcher>,
}

impl EventRouter {
    pub fn new(
        rooms: Arc<RoomManager>,
        calls: Arc<CallSignaling>,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> Self {
        Self {
            rooms,
            calls,
            dispatcher,
        }
    }

    /// Handshake: register the connection and perform its implicit
    /// room joins. Returns the connection id the transport uses for
    /// every subsequent event.
    pub async fn authenticate(
        &self,
        user_id: &str,
        role: Role,
        handle: ConnectionHandle,
    ) -> Result<ConnectionId, RouterError> {
        if user_id.is_empty() {
            return Err(RouterError::Validation("userId must be non-empty".into()));
        }
        let connection_id = self.rooms.connect(user_id, role, handle).await;
        log::info!("User {user_id} ({}) authenticated as {connection_id}", role.as_str());
        Ok(connection_id)
    }

    /// Route one event from an authenticated connection.
    pub async fn handle_event(
        &self,
        connection_id: ConnectionId,
        event: ClientEvent,
    ) -> Result<(), RouterError> {
        log::trace!("Event {} from {connection_id}", event.name());
        match event {
            ClientEvent::Authenticate { .. } => Err(RouterError::Validation(
                "connection is already authenticated".into(),
            )),

            ClientEvent::JoinRoom { room } => {
                let room = Self::parse_room(&room)?;
                let (user_id, _) = self.identity(connection_id).await?;
                if let RoomId::Private(owner) = &room {
                    if owner != &user_id {
                        return Err(RouterError::Validation(
                            "cannot join another user's private room".into(),
                        ));
                    }
                }
                self.rooms.join(connection_id, room).await;
                Ok(())
            }

            ClientEvent::LeaveRoom { room } => {
                let room = Self::parse_room(&room)?;
                let (user_id, _) = self.identity(connection_id).await?;
                if room == RoomId::Private(user_id) {
                    return Err(RouterError::Validation(
                        "cannot leave your own private room".into(),
                    ));
                }
                self.rooms.leave(connection_id, &room).await;
                Ok(())
            }

            ClientEvent::SendMessage {
                to_user_id,
                body,
                kind,
                conversation_id,
            } => {
                let (from_user_id, _) = self.identity(connection_id).await?;
                let message = self
                    .send_message(&from_user_id, &to_user_id, &body, &kind, conversation_id)
                    .await?;
                // Echo to every device of the sender so all of them
                // show the thread consistently.
                self.rooms
                    .unicast(&from_user_id, &ServerEvent::MessageSent { message })
                    .await;
                Ok(())
            }

            ClientEvent::TypingStart { conversation_id } => {
                self.typing(connection_id, conversation_id, true).await
            }
            ClientEvent::TypingStop { conversation_id } => {
                self.typing(connection_id, conversation_id, false).await
            }

            ClientEvent::CallInitiated {
                provider_id,
                service_request_id,
            } => {
                let (user_id, _) = self.identity(connection_id).await?;
                self.calls
                    .initiate(user_id, provider_id, service_request_id)
                    .await?;
                Ok(())
            }

            ClientEvent::Disconnect => {
                self.disconnect(connection_id).await;
                Ok(())
            }
        }
    }

    /// Build and route a chat message. Live delivery goes to the
    /// recipient's devices; an offline recipient gets a new-message
    /// fallback handed to the background dispatcher. The sender always
    /// receives an explicit outcome — this method never silently drops.
    pub async fn send_message(
        &self,
        from_user_id: &str,
        to_user_id: &str,
        body: &str,
        kind: &str,
        conversation_id: Option<String>,
    ) -> Result<Message, RouterError> {
        if to_user_id.is_empty() {
            return Err(RouterError::Validation("toUserId must be non-empty".into()));
        }
        if body.is_empty() {
            return Err(RouterError::Validation("message body must be non-empty".into()));
        }

        let message = Message {
            id: Uuid::new_v4(),
            from_user_id: from_user_id.to_string(),
            to_user_id: to_user_id.to_string(),
            body: body.to_string(),
            kind: if kind.is_empty() { "text".to_string() } else { kind.to_string() },
            timestamp: now_millis(),
            read_flag: false,
        };

        let delivered = self
            .rooms
            .unicast(
                to_user_id,
                &ServerEvent::MessageReceived {
                    message: message.clone(),
                },
            )
            .await;

        if !delivered {
            let envelope = NotificationEnvelope::new(
                to_user_id,
                TEMPLATE_NEW_MESSAGE,
                serde_json::json!({
                    "messageId": message.id,
                    "fromUserId": message.from_user_id,
                    "kind": message.kind,
                    "preview": message.body,
                    "conversationId": conversation_id,
                }),
                vec![Channel::Push, Channel::Email],
            );
            if let Err(e) = self.dispatcher.enqueue(envelope) {
                // Fallback loss is recorded, never raised: the message
                // itself was accepted.
                log::error!("New-message fallback for {to_user_id} not queued: {e}");
            }
        }
        Ok(message)
    }

    /// Remove a connection from all rooms and the registry. Safe to
    /// call any number of times, from the disconnect event or the
    /// transport close racing each other.
    pub async fn disconnect(&self, connection_id: ConnectionId) {
        self.rooms.disconnect(connection_id).await;
    }

    async fn typing(
        &self,
        connection_id: ConnectionId,
        conversation_id: String,
        typing: bool,
    ) -> Result<(), RouterError> {
        if conversation_id.is_empty() {
            return Err(RouterError::Validation(
                "conversationId must be non-empty".into(),
            ));
        }
        let (user_id, _) = self.identity(connection_id).await?;
        let event = ServerEvent::UserTyping {
            user_id,
            conversation_id: conversation_id.clone(),
            typing,
        };
        if let Err(e) = self
            .rooms
            .broadcast_except(
                &RoomId::Conversation(conversation_id),
                Some(connection_id),
                &event,
            )
            .await
        {
            log::error!("Typing broadcast failed: {e}");
        }
        Ok(())
    }

    async fn identity(&self, connection_id: ConnectionId) -> Result<(String, Role), RouterError> {
        self.rooms
            .registry()
            .identity_of(connection_id)
            .await
            .ok_or(RouterError::NotAuthenticated)
    }

    fn parse_room(name: &str) -> Result<RoomId, RouterError> {
        RoomId::parse_wire(name)
            .ok_or_else(|| RouterError::Validation(format!("unknown room name: {name}")))
    }
}

// ===================================================================
// Tests
// ===================================================================
