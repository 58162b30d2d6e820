//! Room membership and fan-out.
//!
//! A room is a named set of connections that receive the same
//! broadcast. Three kinds exist:
//!
//! ```text
//! Private(user)         — one per user, joined implicitly on connect
//! RoleBroadcast(role)   — all customers / providers / admins
//! Conversation(id)      — the two (or more) parties of a chat thread
//! ```
//!
//! The legacy clients address rooms by convention strings
//! (`user_{id}`, `{role}s`, `conversation_{id}`). That convention is
//! isolated here: [`RoomId::wire_name`] and [`RoomId::parse_wire`] are
//! the only places it exists.
//!
//! Fan-out encodes each event once and `try_send`s the shared frame to
//! every member; a slow or dead member drops its copy and never stalls
//! or aborts delivery to the rest.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::protocol::{ProtocolError, Role, ServerEvent};
use crate::registry::{ConnectionHandle, ConnectionId, ConnectionRegistry};

/// Typed room identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoomId {
    /// A single user's personal room; every device of that user.
    Private(String),
    /// Everyone holding a given role.
    RoleBroadcast(Role),
    /// One conversation thread.
    Conversation(String),
}

impl RoomId {
    /// The convention string the clients use for this room.
    pub fn wire_name(&self) -> String {
        match self {
            RoomId::Private(user_id) => format!("user_{user_id}"),
            RoomId::RoleBroadcast(role) => format!("{}s", role.as_str()),
            RoomId::Conversation(id) => format!("conversation_{id}"),
        }
    }

    /// Parse a convention string back into a typed room id.
    /// Returns `None` for names that match no convention.
    pub fn parse_wire(name: &str) -> Option<RoomId> {
        if let Some(user_id) = name.strip_prefix("user_") {
            if user_id.is_empty() {
                return None;
            }
            return Some(RoomId::Private(user_id.to_string()));
        }
        if let Some(id) = name.strip_prefix("conversation_") {
            if id.is_empty() {
                return None;
            }
            return Some(RoomId::Conversation(id.to_string()));
        }
        match name {
            "customers" => Some(RoomId::RoleBroadcast(Role::Customer)),
            "providers" => Some(RoomId::RoleBroadcast(Role::Provider)),
            "admins" => Some(RoomId::RoleBroadcast(Role::Admin)),
            _ => None,
        }
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.wire_name())
    }
}

/// Fan-out statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutStats {
    pub events_sent: u64,
    pub events_dropped: u64,
}

/// Atomic counters — lock-free on the fan-out hot path.
struct AtomicFanoutStats {
    events_sent: AtomicU64,
    events_dropped: AtomicU64,
}

impl AtomicFanoutStats {
    fn new() -> Self {
        Self {
            events_sent: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
        }
    }
}

/// Room membership tables plus broadcast/unicast delivery.
///
/// Rooms are created implicitly on first join and removed when the
/// last member leaves.
pub struct RoomManager {
    registry: Arc<ConnectionRegistry>,
    rooms: RwLock<HashMap<RoomId, HashSet<ConnectionId>>>,
    stats: AtomicFanoutStats,
}

impl RoomManager {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            rooms: RwLock::new(HashMap::new()),
            stats: AtomicFanoutStats::new(),
        }
    }

    /// Register an authenticated connection and perform the implicit
    /// joins: the user's own private room and their role's broadcast
    /// room.
    pub async fn connect(
        &self,
        user_id: impl Into<String>,
        role: Role,
        handle: ConnectionHandle,
    ) -> ConnectionId {
        let user_id = user_id.into();
        let connection_id = self.registry.register(user_id.clone(), role, handle).await;
        self.join(connection_id, RoomId::Private(user_id)).await;
        self.join(connection_id, RoomId::RoleBroadcast(role)).await;
        connection_id
    }

    /// Tear down a connection: remove it from every room it joined,
    /// then unregister it. Idempotent, and safe to race with in-flight
    /// events for the same connection — whichever caller gets the
    /// registry entry performs the cleanup, later callers no-op.
    pub async fn disconnect(&self, connection_id: ConnectionId) {
        let Some(connection) = self.registry.unregister(connection_id).await else {
            return;
        };
        let mut rooms = self.rooms.write().await;
        for room in &connection.joined_rooms {
            if let Some(members) = rooms.get_mut(room) {
                members.remove(&connection_id);
                if members.is_empty() {
                    rooms.remove(room);
                }
            }
        }
        log::debug!(
            "Connection {connection_id} of user {} removed from {} rooms",
            connection.user_id,
            connection.joined_rooms.len()
        );
    }

    /// Add a connection to a room. Returns `false` if the connection
    /// is not registered (already disconnected).
    pub async fn join(&self, connection_id: ConnectionId, room: RoomId) -> bool {
        if !self.registry.note_join(connection_id, room.clone()).await {
            return false;
        }
        let mut rooms = self.rooms.write().await;
        rooms.entry(room).or_default().insert(connection_id);
        true
    }

    /// Remove a connection from a room. Empty rooms are dropped.
    pub async fn leave(&self, connection_id: ConnectionId, room: &RoomId) {
        self.registry.note_leave(connection_id, room).await;
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(room) {
            members.remove(&connection_id);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }

    /// Current members of a room. Empty set for unknown rooms.
    pub async fn members_of(&self, room: &RoomId) -> HashSet<ConnectionId> {
        self.rooms
            .read()
            .await
            .get(room)
            .cloned()
            .unwrap_or_default()
    }

    /// Fan an event out to every current member of a room.
    ///
    /// Encodes once; returns the number of members whose queue
    /// accepted the frame. A member that drops its copy never affects
    /// the others.
    pub async fn broadcast(&self, room: &RoomId, event: &ServerEvent) -> Result<usize, ProtocolError> {
        self.broadcast_except(room, None, event).await
    }

    /// Like [`broadcast`](Self::broadcast) but skipping one member,
    /// typically the sender of the event being echoed.
    pub async fn broadcast_except(
        &self,
        room: &RoomId,
        except: Option<ConnectionId>,
        event: &ServerEvent,
    ) -> Result<usize, ProtocolError> {
        let frame = Arc::new(event.encode()?);
        let members = self.members_of(room).await;

        let mut delivered = 0;
        for member in members {
            if Some(member) == except {
                continue;
            }
            match self.registry.handle_of(member).await {
                Some(handle) if handle.try_deliver(&frame) => delivered += 1,
                _ => {
                    self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        self.stats
            .events_sent
            .fetch_add(delivered as u64, Ordering::Relaxed);
        Ok(delivered)
    }

    /// Deliver an event to every live connection of one user.
    ///
    /// Returns `false` — without error — when the user is offline or
    /// no device accepted the frame; the caller decides whether a
    /// fallback channel is warranted. No retry happens here.
    pub async fn unicast(&self, user_id: &str, event: &ServerEvent) -> bool {
        let handles = self.registry.resolve(user_id).await;
        if handles.is_empty() {
            return false;
        }
        let frame = match event.encode() {
            Ok(frame) => Arc::new(frame),
            Err(e) => {
                log::error!("Dropping unicast to {user_id}: {e}");
                return false;
            }
        };

        let mut delivered = 0u64;
        for handle in &handles {
            if handle.try_deliver(&frame) {
                delivered += 1;
            } else {
                self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.stats.events_sent.fetch_add(delivered, Ordering::Relaxed);
        delivered > 0
    }

    /// Number of rooms with at least one member.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Fan-out statistics (lock-free snapshot).
    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            events_sent: self.stats.events_sent.load(Ordering::Relaxed),
            events_dropped: self.stats.events_dropped.load(Ordering::Relaxed),
        }
    }

    /// The registry backing this manager.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn manager() -> RoomManager {
        RoomManager::new(Arc::new(ConnectionRegistry::new()))
    }

    fn handle(capacity: usize) -> (ConnectionHandle, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (ConnectionHandle::new(tx), rx)
    }

    // ── RoomId wire mapping ──────────────────────────────────────

    #[test]
    fn test_wire_name_conventions() {
        assert_eq!(RoomId::Private("u-9".into()).wire_name(), "user_u-9");
        assert_eq!(RoomId::RoleBroadcast(Role::Provider).wire_name(), "providers");
        assert_eq!(
            RoomId::Conversation("conv-3".into()).wire_name(),
            "conversation_conv-3"
        );
    }

    #[test]
    fn test_parse_wire_roundtrip() {
        for room in [
            RoomId::Private("u-1".into()),
            RoomId::RoleBroadcast(Role::Customer),
            RoomId::RoleBroadcast(Role::Admin),
            RoomId::Conversation("c-42".into()),
        ] {
            assert_eq!(RoomId::parse_wire(&room.wire_name()), Some(room));
        }
    }

    #[test]
    fn test_parse_wire_rejects_malformed() {
        assert_eq!(RoomId::parse_wire("user_"), None);
        assert_eq!(RoomId::parse_wire("conversation_"), None);
        assert_eq!(RoomId::parse_wire("plumbers"), None);
        assert_eq!(RoomId::parse_wire(""), None);
    }

    // ── Membership ───────────────────────────────────────────────

    #[tokio::test]
    async fn test_connect_joins_private_and_role_rooms() {
        let manager = manager();
        let (h, _rx) = handle(8);
        let id = manager.connect("u-1", Role::Customer, h).await;

        let private = manager.members_of(&RoomId::Private("u-1".into())).await;
        let role = manager
            .members_of(&RoomId::RoleBroadcast(Role::Customer))
            .await;
        assert!(private.contains(&id));
        assert!(role.contains(&id));
        assert_eq!(manager.room_count().await, 2);
    }

    #[tokio::test]
    async fn test_disconnect_removes_from_every_room() {
        let manager = manager();
        let (h, _rx) = handle(8);
        let id = manager.connect("u-1", Role::Provider, h).await;
        let conversation = RoomId::Conversation("conv-1".into());
        manager.join(id, conversation.clone()).await;

        manager.disconnect(id).await;

        assert!(manager.members_of(&conversation).await.is_empty());
        assert!(manager
            .members_of(&RoomId::Private("u-1".into()))
            .await
            .is_empty());
        assert_eq!(manager.room_count().await, 0, "empty rooms collected");
        assert!(!manager.registry().is_online("u-1").await);
    }

    #[tokio::test]
    async fn test_disconnect_twice_is_harmless() {
        let manager = manager();
        let (h, _rx) = handle(8);
        let id = manager.connect("u-1", Role::Customer, h).await;
        manager.disconnect(id).await;
        manager.disconnect(id).await;
        assert_eq!(manager.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_join_after_disconnect_is_rejected() {
        let manager = manager();
        let (h, _rx) = handle(8);
        let id = manager.connect("u-1", Role::Customer, h).await;
        manager.disconnect(id).await;

        assert!(!manager.join(id, RoomId::Conversation("c".into())).await);
        assert_eq!(manager.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_leave_drops_empty_room() {
        let manager = manager();
        let (h, _rx) = handle(8);
        let id = manager.connect("u-1", Role::Customer, h).await;
        let conversation = RoomId::Conversation("conv-1".into());
        manager.join(id, conversation.clone()).await;
        assert_eq!(manager.room_count().await, 3);

        manager.leave(id, &conversation).await;
        assert_eq!(manager.room_count().await, 2);
        assert!(manager.members_of(&conversation).await.is_empty());
    }

    // ── Delivery ─────────────────────────────────────────────────

    fn typing_event() -> ServerEvent {
        ServerEvent::UserTyping {
            user_id: "u-1".into(),
            conversation_id: "conv-1".into(),
            typing: true,
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_members() {
        let manager = manager();
        let (h1, mut rx1) = handle(8);
        let (h2, mut rx2) = handle(8);
        let a = manager.connect("u-1", Role::Customer, h1).await;
        let b = manager.connect("u-2", Role::Provider, h2).await;
        let conversation = RoomId::Conversation("conv-1".into());
        manager.join(a, conversation.clone()).await;
        manager.join(b, conversation.clone()).await;

        let delivered = manager.broadcast(&conversation, &typing_event()).await.unwrap();
        assert_eq!(delivered, 2);
        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_broadcast_except_skips_sender() {
        let manager = manager();
        let (h1, mut rx1) = handle(8);
        let (h2, mut rx2) = handle(8);
        let a = manager.connect("u-1", Role::Customer, h1).await;
        let b = manager.connect("u-2", Role::Provider, h2).await;
        let conversation = RoomId::Conversation("conv-1".into());
        manager.join(a, conversation.clone()).await;
        manager.join(b, conversation.clone()).await;

        let delivered = manager
            .broadcast_except(&conversation, Some(a), &typing_event())
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert!(rx2.recv().await.is_some());
        assert!(rx1.try_recv().is_err(), "sender must not hear its own typing");
    }

    #[tokio::test]
    async fn test_broadcast_survives_one_full_queue() {
        let manager = manager();
        let (h1, _rx1) = handle(1);
        let (h2, mut rx2) = handle(8);
        let a = manager.connect("u-1", Role::Customer, h1).await;
        let b = manager.connect("u-2", Role::Provider, h2).await;
        let conversation = RoomId::Conversation("conv-1".into());
        manager.join(a, conversation.clone()).await;
        manager.join(b, conversation.clone()).await;

        // Fill u-1's queue so the next frame to it drops.
        let handles = manager.registry().resolve("u-1").await;
        assert!(handles[0].try_deliver(&Arc::new("fill".to_string())));

        let delivered = manager.broadcast(&conversation, &typing_event()).await.unwrap();
        assert_eq!(delivered, 1, "the healthy member still gets its copy");
        assert!(rx2.recv().await.is_some());
        assert_eq!(manager.stats().events_dropped, 1);
    }

    #[tokio::test]
    async fn test_unicast_offline_returns_false() {
        let manager = manager();
        assert!(!manager.unicast("ghost", &typing_event()).await);
    }

    #[tokio::test]
    async fn test_unicast_delivers_to_all_devices() {
        let manager = manager();
        let (h1, mut rx1) = handle(8);
        let (h2, mut rx2) = handle(8);
        manager.connect("u-1", Role::Customer, h1).await;
        manager.connect("u-1", Role::Customer, h2).await;

        assert!(manager.unicast("u-1", &typing_event()).await);
        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
        assert_eq!(manager.stats().events_sent, 2);
    }

    #[tokio::test]
    async fn test_members_of_unknown_room_is_empty() {
        let manager = manager();
        assert!(manager
            .members_of(&RoomId::Conversation("void".into()))
            .await
            .is_empty());
    }
}
