//! Connection registry: which users currently hold a live connection.
//!
//! One user may be connected from several devices at once, so the
//! registry maps both ways: connection id → connection record, and
//! user id → the set of that user's live connection ids. `is_online`
//! is true as long as at least one connection exists.
//!
//! The registry is owned by the service instance, never a process-wide
//! singleton — tests run several independent instances side by side.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::Role;
use crate::rooms::RoomId;

/// Identifier of one live connection.
pub type ConnectionId = Uuid;

/// The write half of a connection's outbound queue.
///
/// Frames are pre-encoded JSON shared via `Arc`, so a fan-out to N
/// members serializes once. Delivery uses `try_send`: a full or closed
/// queue drops the frame rather than blocking the routing path.
#[derive(Clone)]
pub struct ConnectionHandle {
    tx: mpsc::Sender<Arc<String>>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::Sender<Arc<String>>) -> Self {
        Self { tx }
    }

    /// Queue a frame for this connection. Returns `false` if the
    /// frame was dropped (queue full or connection gone).
    pub fn try_deliver(&self, frame: &Arc<String>) -> bool {
        self.tx.try_send(frame.clone()).is_ok()
    }

    /// Whether the receiving side is still alive.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// One live, authenticated connection.
#[derive(Clone)]
pub struct Connection {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub role: Role,
    /// Rooms this connection currently belongs to, kept in lockstep
    /// with the room membership tables so disconnect can clean up.
    pub joined_rooms: HashSet<RoomId>,
    pub handle: ConnectionHandle,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, Connection>,
    by_user: HashMap<String, HashSet<ConnectionId>>,
}

/// Registry of live connections, keyed by connection and by user.
///
/// Both maps live under one lock so they can never disagree about
/// which connections exist.
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Record a freshly authenticated connection and return its id.
    pub async fn register(
        &self,
        user_id: impl Into<String>,
        role: Role,
        handle: ConnectionHandle,
    ) -> ConnectionId {
        let user_id = user_id.into();
        let connection_id = Uuid::new_v4();
        let mut inner = self.inner.write().await;
        inner.connections.insert(
            connection_id,
            Connection {
                connection_id,
                user_id: user_id.clone(),
                role,
                joined_rooms: HashSet::new(),
                handle,
            },
        );
        inner.by_user.entry(user_id).or_default().insert(connection_id);
        connection_id
    }

    /// Remove a connection. Idempotent: the second call for the same
    /// id returns `None` and changes nothing, so a `disconnect` frame
    /// racing the socket close is harmless.
    pub async fn unregister(&self, connection_id: ConnectionId) -> Option<Connection> {
        let mut inner = self.inner.write().await;
        let connection = inner.connections.remove(&connection_id)?;
        if let Some(set) = inner.by_user.get_mut(&connection.user_id) {
            set.remove(&connection_id);
            if set.is_empty() {
                inner.by_user.remove(&connection.user_id);
            }
        }
        Some(connection)
    }

    /// Whether the user holds at least one live connection.
    pub async fn is_online(&self, user_id: &str) -> bool {
        self.inner
            .read()
            .await
            .by_user
            .get(user_id)
            .map(|set| !set.is_empty())
            .unwrap_or(false)
    }

    /// Handles for every live connection of a user (all devices).
    /// Empty when offline.
    pub async fn resolve(&self, user_id: &str) -> Vec<ConnectionHandle> {
        let inner = self.inner.read().await;
        match inner.by_user.get(user_id) {
            Some(ids) => ids
                .iter()
                .filter_map(|id| inner.connections.get(id))
                .map(|c| c.handle.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// The handle of one specific connection.
    pub async fn handle_of(&self, connection_id: ConnectionId) -> Option<ConnectionHandle> {
        self.inner
            .read()
            .await
            .connections
            .get(&connection_id)
            .map(|c| c.handle.clone())
    }

    /// Identity of one specific connection.
    pub async fn identity_of(&self, connection_id: ConnectionId) -> Option<(String, Role)> {
        self.inner
            .read()
            .await
            .connections
            .get(&connection_id)
            .map(|c| (c.user_id.clone(), c.role))
    }

    /// Record that a connection joined a room.
    pub(crate) async fn note_join(&self, connection_id: ConnectionId, room: RoomId) -> bool {
        let mut inner = self.inner.write().await;
        match inner.connections.get_mut(&connection_id) {
            Some(connection) => {
                connection.joined_rooms.insert(room);
                true
            }
            None => false,
        }
    }

    /// Record that a connection left a room.
    pub(crate) async fn note_leave(&self, connection_id: ConnectionId, room: &RoomId) {
        let mut inner = self.inner.write().await;
        if let Some(connection) = inner.connections.get_mut(&connection_id) {
            connection.joined_rooms.remove(room);
        }
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    /// Number of distinct online users.
    pub async fn online_user_count(&self) -> usize {
        self.inner.read().await.by_user.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ===================================================================
// Tests
// ===================================================================
