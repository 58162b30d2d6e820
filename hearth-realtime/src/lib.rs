//! # hearth-realtime — Presence, signaling and notification core for Hearth
//!
//! The live subsystem of the Hearth home-services marketplace: tracks
//! which users hold an open connection, routes chat and call-signaling
//! events to the right connections and rooms, drives the call
//! lifecycle state machine, and falls back to out-of-band channels
//! (email/SMS/push) — including future-dated delivery — when a
//! recipient is not live.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   WebSocket    ┌────────────────┐
//! │  Client  │ ◄────────────► │ RealtimeServer │
//! │ (per user│   JSON events  │  (accept loop) │
//! │  device) │                └───────┬────────┘
//! └──────────┘                        │ per-connection, in order
//!                                     ▼
//!                             ┌──────────────┐
//!                             │ EventRouter  │
//!                             └──┬───┬───┬───┘
//!                 ┌──────────────┘   │   └──────────────┐
//!                 ▼                  ▼                  ▼
//!         ┌──────────────┐  ┌───────────────┐  ┌─────────────────┐
//!         │ RoomManager  │  │ CallSignaling │  │   Dispatcher    │
//!         │  + Registry  │  │ (state machine│  │ live→email→sms  │
//!         │  (fan-out)   │  │  per call id) │  │  worker pool    │
//!         └──────────────┘  └───────────────┘  └────────┬────────┘
//!                                                       │
//!                                              ┌────────┴────────┐
//!                                              │ DelayedScheduler│
//!                                              │ (sweep + store) │
//!                                              └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — typed event vocabulary (JSON frames, legacy names)
//! - [`registry`] — live connections per user
//! - [`rooms`] — typed room ids, membership, broadcast/unicast
//! - [`router`] — the event dispatch table
//! - [`call`] — call lifecycle state machine + repository contract
//! - [`dispatch`] — multi-channel notification delivery with fallback
//! - [`scheduler`] — future-dated delivery via periodic sweep
//! - [`store`] — delay-store contract plus memory/RocksDB backends
//! - [`server`] — service wiring + WebSocket front end
//!
//! Persistence repositories, HTTP routing, permission tables and
//! template rendering live outside this crate, behind the
//! [`call::CallRepository`], [`dispatch::NotificationGateway`] and
//! [`store::DelayStore`] contracts.

pub mod protocol;
pub mod registry;
pub mod rooms;
pub mod router;
pub mod call;
pub mod dispatch;
pub mod scheduler;
pub mod store;
pub mod server;

// Re-exports for convenience
pub use protocol::{ClientEvent, Message, ProtocolError, Role, ServerEvent};
pub use registry::{Connection, ConnectionHandle, ConnectionId, ConnectionRegistry};
pub use rooms::{FanoutStats, RoomId, RoomManager};
pub use router::{EventRouter, RouterError};
pub use call::{
    Call, CallDetails, CallError, CallFilter, CallRepository, CallSignaling, CallStatus,
};
pub use dispatch::{
    BulkDeliveryResult, Channel, DeliveryError, DeliveryResult, DispatchConfig, DispatchStats,
    NotificationDispatcher, NotificationEnvelope, NotificationGateway,
};
pub use scheduler::{DelayedScheduler, ScheduleError, SweepOutcome};
pub use store::{
    DelayStore, DelayStoreConfig, MemoryDelayStore, RocksDelayStore, StoreError,
};
pub use server::{RealtimeConfig, RealtimeCore, RealtimeServer, ServerStats};
