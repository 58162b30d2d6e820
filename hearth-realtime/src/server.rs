//! Service wiring and the WebSocket front end.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── CallSignaling ── CallRepository
//!            ├── RealtimeServer        │
//! Client B ──┘        │                ├── NotificationDispatcher ── Gateway
//!              ClientEvent frames      │          │
//!                     │                │   DelayedScheduler ── DelayStore
//!                     ▼                │
//!               EventRouter ───────────┤
//!                     │                │
//!              RoomManager ── ConnectionRegistry
//! ```
//!
//! [`RealtimeCore`] owns every subsystem instance — nothing here is a
//! process-wide singleton, so tests spin up as many independent cores
//! as they like. [`RealtimeServer`] is the tokio-tungstenite accept
//! loop wiring sockets to the router: per connection, one read loop
//! that applies frames strictly in arrival order and one outbound
//! queue drained into the socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::call::{Call, CallDetails, CallError, CallRepository, CallSignaling, CallStatus};
use crate::dispatch::{
    DispatchConfig, NotificationDispatcher, NotificationEnvelope, NotificationGateway,
};
use crate::protocol::{ClientEvent, Message, ServerEvent};
use crate::registry::{ConnectionHandle, ConnectionId, ConnectionRegistry};
use crate::rooms::RoomManager;
use crate::router::{EventRouter, RouterError};
use crate::scheduler::{DelayedScheduler, ScheduleError};
use crate::store::DelayStore;

/// Core configuration.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Address the WebSocket listener binds to
    pub bind_addr: String,
    /// Outbound frame queue per connection; a full queue drops frames
    pub outbound_queue_capacity: usize,
    /// Notification dispatch tuning
    pub dispatch: DispatchConfig,
    /// Delayed-delivery sweep cadence
    pub sweep_interval: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4500".to_string(),
            outbound_queue_capacity: 256,
            dispatch: DispatchConfig::default(),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl RealtimeConfig {
    /// Small queues and millisecond timings for tests.
    pub fn for_testing(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            outbound_queue_capacity: 64,
            dispatch: DispatchConfig::for_testing(),
            sweep_interval: Duration::from_millis(25),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub decode_failures: u64,
}

/// The service object: every realtime subsystem, wired.
pub struct RealtimeCore {
    config: RealtimeConfig,
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomManager>,
    dispatcher: Arc<NotificationDispatcher>,
    calls: Arc<CallSignaling>,
    scheduler: Arc<DelayedScheduler>,
    router: Arc<EventRouter>,
}

impl RealtimeCore {
    /// Wire a core from its three external collaborators. Must be
    /// called from within a tokio runtime (the dispatcher spawns its
    /// workers immediately).
    pub fn new(
        config: RealtimeConfig,
        call_repo: Arc<dyn CallRepository>,
        gateway: Arc<dyn NotificationGateway>,
        delay_store: Arc<dyn DelayStore>,
    ) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomManager::new(registry.clone()));
        let dispatcher =
            NotificationDispatcher::new(rooms.clone(), gateway, config.dispatch.clone());
        let calls = Arc::new(CallSignaling::new(
            call_repo,
            rooms.clone(),
            dispatcher.clone(),
        ));
        let scheduler =
            DelayedScheduler::new(delay_store, dispatcher.clone(), config.sweep_interval);
        let router = Arc::new(EventRouter::new(
            rooms.clone(),
            calls.clone(),
            dispatcher.clone(),
        ));
        Arc::new(Self {
            config,
            registry,
            rooms,
            dispatcher,
            calls,
            scheduler,
            router,
        })
    }

    /// Start background work — currently the scheduler's sweep loop.
    /// Callers embedding the core without `RealtimeServer` invoke this
    /// themselves.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        self.scheduler.spawn()
    }

    // ── Caller-initiated surface (HTTP layer, admin jobs) ────────

    /// Start a call on behalf of a customer.
    pub async fn initiate_call(
        &self,
        customer_id: &str,
        provider_id: &str,
        service_request_id: Option<String>,
    ) -> Result<Call, CallError> {
        self.calls
            .initiate(customer_id, provider_id, service_request_id)
            .await
    }

    /// Apply a call transition.
    pub async fn update_call_status(
        &self,
        call_id: Uuid,
        status: CallStatus,
        details: CallDetails,
    ) -> Result<Call, CallError> {
        self.calls.transition(call_id, status, details).await
    }

    /// Route a chat message from outside a live connection.
    pub async fn send_message(
        &self,
        from_user_id: &str,
        to_user_id: &str,
        body: &str,
        kind: &str,
    ) -> Result<Message, RouterError> {
        self.router
            .send_message(from_user_id, to_user_id, body, kind, None)
            .await
    }

    /// Queue a notification for now-or-later delivery.
    pub async fn schedule_notification(
        &self,
        envelope: NotificationEnvelope,
        deliver_at: u64,
    ) -> Result<(), ScheduleError> {
        self.scheduler.schedule(envelope, deliver_at).await
    }

    /// Whether a user holds at least one live connection.
    pub async fn is_online(&self, user_id: &str) -> bool {
        self.registry.is_online(user_id).await
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.dispatcher
    }

    pub fn calls(&self) -> &Arc<CallSignaling> {
        &self.calls
    }

    pub fn scheduler(&self) -> &Arc<DelayedScheduler> {
        &self.scheduler
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }
}

/// The WebSocket accept loop.
pub struct RealtimeServer {
    core: Arc<RealtimeCore>,
    stats: Arc<RwLock<ServerStats>>,
}

impl RealtimeServer {
    pub fn new(core: Arc<RealtimeCore>) -> Self {
        Self {
            core,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind and serve. Runs the accept loop forever; call from an
    /// async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let sweep = self.core.start();
        let listener = TcpListener::bind(&self.core.config().bind_addr).await?;
        log::info!("Realtime server listening on {}", self.core.config().bind_addr);

        let result = self.accept_loop(listener).await;
        sweep.abort();
        result
    }

    async fn accept_loop(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let core = self.core.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, core, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    ///
    /// Inbound frames decode and route one at a time — that await is
    /// what gives a connection its in-order guarantee. Outbound frames
    /// drain from the connection's bounded queue.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        core: Arc<RealtimeCore>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (out_tx, mut out_rx) =
            mpsc::channel::<Arc<String>>(core.config().outbound_queue_capacity.max(1));
        let handle = ConnectionHandle::new(out_tx);
        let mut connection_id: Option<ConnectionId> = None;

        loop {
            tokio::select! {
                // Incoming WebSocket frame
                frame = ws_receiver.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.frames_in += 1;
                            }
                            match ClientEvent::decode(text.as_str()) {
                                Ok(ClientEvent::Authenticate { user_id, role }) => {
                                    if connection_id.is_some() {
                                        let frame = error_frame("validation", "connection is already authenticated");
                                        ws_sender.send(WsMessage::Text(frame.into())).await?;
                                        continue;
                                    }
                                    match core.router().authenticate(&user_id, role, handle.clone()).await {
                                        Ok(id) => connection_id = Some(id),
                                        Err(e) => {
                                            let frame = error_frame(e.code(), &e.to_string());
                                            ws_sender.send(WsMessage::Text(frame.into())).await?;
                                        }
                                    }
                                }
                                Ok(ClientEvent::Disconnect) => {
                                    if let Some(id) = connection_id.take() {
                                        core.router().disconnect(id).await;
                                    }
                                    break;
                                }
                                Ok(event) => {
                                    let Some(id) = connection_id else {
                                        let frame = error_frame(
                                            "not_authenticated",
                                            "authenticate before sending events",
                                        );
                                        ws_sender.send(WsMessage::Text(frame.into())).await?;
                                        continue;
                                    };
                                    if let Err(e) = core.router().handle_event(id, event).await {
                                        log::debug!("Rejected event from {addr}: {e}");
                                        let frame = error_frame(e.code(), &e.to_string());
                                        ws_sender.send(WsMessage::Text(frame.into())).await?;
                                    }
                                }
                                Err(e) => {
                                    log::warn!("Undecodable frame from {addr}: {e}");
                                    {
                                        let mut s = stats.write().await;
                                        s.decode_failures += 1;
                                    }
                                    let frame = error_frame("validation", &e.to_string());
                                    ws_sender.send(WsMessage::Text(frame.into())).await?;
                                }
                            }
                        }

                        Some(Ok(WsMessage::Ping(data))) => {
                            ws_sender.send(WsMessage::Pong(data)).await?;
                        }

                        Some(Ok(WsMessage::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing frame from the router/dispatcher side
                outbound = out_rx.recv() => {
                    match outbound {
                        Some(frame) => {
                            ws_sender.send(WsMessage::Text((*frame).clone().into())).await?;
                            let mut s = stats.write().await;
                            s.frames_out += 1;
                        }
                        None => break,
                    }
                }
            }
        }

        // The close may have raced an explicit disconnect frame;
        // disconnect is idempotent either way.
        if let Some(id) = connection_id {
            core.router().disconnect(id).await;
        }
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        Ok(())
    }

    /// Server statistics snapshot.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn core(&self) -> &Arc<RealtimeCore> {
        &self.core
    }
}

fn error_frame(code: &str, message: &str) -> String {
    ServerEvent::Error {
        code: code.to_string(),
        message: message.to_string(),
    }
    .encode()
    .unwrap_or_else(|_| String::from(r#"{"event":"error"}"#))
}

// ===================================================================
// Tests
// ===================================================================
