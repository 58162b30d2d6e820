//! Multi-channel notification dispatch with ordered fallback.
//!
//! Every notification travels as a [`NotificationEnvelope`] carrying
//! its recipient, template, payload and an ordered channel list:
//!
//! ```text
//! envelope ── live ──✗── email ──✗── sms ──✓  (stop at first success)
//!              │
//!              └─ success = recipient had a live connection
//! ```
//!
//! The live channel is a room-manager unicast; an offline recipient is
//! a normal miss, not an error. External channels go through the
//! [`NotificationGateway`] collaborator under a bounded per-attempt
//! timeout, with up to three tries and exponential backoff before the
//! channel is written off and the walk advances.
//!
//! Event handlers never run this walk inline: they [`enqueue`] work
//! onto a bounded queue drained by a small worker pool, so a slow
//! email gateway cannot stall live event routing.
//!
//! [`enqueue`]: NotificationDispatcher::enqueue

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use crate::protocol::{now_millis, ServerEvent};
use crate::rooms::RoomManager;

/// Template rendered when a provider is being called.
pub const TEMPLATE_CALL_ALERT: &str = "call_alert";
/// Template rendered when a call completes, for both parties.
pub const TEMPLATE_CALL_SUMMARY: &str = "call_summary";
/// Template rendered for a chat message that missed its live recipient.
pub const TEMPLATE_NEW_MESSAGE: &str = "new_message";

// ───────────────────────────────────────────────────────────────────
// Envelope
// ───────────────────────────────────────────────────────────────────

/// A delivery channel, in the order policies name them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Live,
    Email,
    Sms,
    Push,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Live => "live",
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Push => "push",
        }
    }
}

/// Payload-plus-routing metadata for one notification.
///
/// Consumed exactly once: dispatched over the first channel that
/// succeeds, or dropped after every channel has been exhausted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEnvelope {
    pub id: Uuid,
    pub recipient_id: String,
    pub channel_order: Vec<Channel>,
    pub template_id: String,
    pub payload: serde_json::Value,
    /// Milliseconds since epoch.
    pub created_at: u64,
    /// Set when the envelope went through the delayed scheduler.
    pub scheduled_for: Option<u64>,
    /// Default `true`: stop walking channels after the first success.
    pub stop_on_first_success: bool,
}

impl NotificationEnvelope {
    pub fn new(
        recipient_id: impl Into<String>,
        template_id: impl Into<String>,
        payload: serde_json::Value,
        channel_order: Vec<Channel>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            recipient_id: recipient_id.into(),
            channel_order,
            template_id: template_id.into(),
            payload,
            created_at: now_millis(),
            scheduled_for: None,
            stop_on_first_success: true,
        }
    }

    pub fn with_schedule(mut self, deliver_at: u64) -> Self {
        self.scheduled_for = Some(deliver_at);
        self
    }

    pub fn with_stop_on_first_success(mut self, stop: bool) -> Self {
        self.stop_on_first_success = stop;
        self
    }
}

/// Outcome of dispatching one envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryResult {
    pub envelope_id: Uuid,
    pub delivered: bool,
    /// First channel that succeeded, if any.
    pub channel: Option<Channel>,
    /// Total attempts across every channel walked.
    pub attempts: u32,
}

/// Aggregate outcome of a bulk dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkDeliveryResult {
    pub success_count: usize,
    pub failed_count: usize,
}

/// Delivery errors. These are recorded and logged, never raised back
/// to whoever produced the envelope — dispatch is decoupled.
#[derive(Debug, Clone)]
pub enum DeliveryError {
    /// Live channel miss: recipient holds no live connection.
    Offline,
    /// The gateway reported failure for an external channel.
    Gateway { channel: Channel, reason: String },
    /// An external attempt exceeded the per-attempt timeout.
    Timeout(Channel),
    /// The background queue is full; the envelope was dropped.
    QueueFull,
    /// The dispatcher has shut down.
    QueueClosed,
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryError::Offline => write!(f, "Recipient has no live connection"),
            DeliveryError::Gateway { channel, reason } => {
                write!(f, "Gateway failure on {}: {reason}", channel.as_str())
            }
            DeliveryError::Timeout(channel) => {
                write!(f, "Attempt on {} timed out", channel.as_str())
            }
            DeliveryError::QueueFull => write!(f, "Dispatch queue full"),
            DeliveryError::QueueClosed => write!(f, "Dispatch queue closed"),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// External delivery collaborator covering email, SMS and push.
///
/// A non-error return counts as success; no delivery receipt is
/// modeled beyond that (known limitation of the channel providers).
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn send(
        &self,
        channel: Channel,
        to: &str,
        template_id: &str,
        payload: &serde_json::Value,
    ) -> Result<(), DeliveryError>;
}

// ───────────────────────────────────────────────────────────────────
// Dispatcher
// ───────────────────────────────────────────────────────────────────

/// Dispatch tuning knobs.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Background workers draining the queue.
    pub workers: usize,
    /// Bounded queue capacity; a full queue drops, never blocks.
    pub queue_capacity: usize,
    /// Bound on one external gateway attempt.
    pub attempt_timeout: Duration,
    /// Tries per external channel before advancing to the next.
    pub max_attempts: u32,
    /// First backoff delay; doubles per retry.
    pub backoff_base: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 256,
            attempt_timeout: Duration::from_secs(5),
            max_attempts: 3,
            backoff_base: Duration::from_millis(200),
        }
    }
}

impl DispatchConfig {
    /// Small queues and millisecond timings for tests.
    pub fn for_testing() -> Self {
        Self {
            workers: 2,
            queue_capacity: 32,
            attempt_timeout: Duration::from_millis(200),
            max_attempts: 3,
            backoff_base: Duration::from_millis(5),
        }
    }
}

/// Dispatch statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: u64,
    pub failed: u64,
    pub enqueued: u64,
    pub queue_dropped: u64,
}

struct AtomicDispatchStats {
    delivered: AtomicU64,
    failed: AtomicU64,
    enqueued: AtomicU64,
    queue_dropped: AtomicU64,
}

impl AtomicDispatchStats {
    fn new() -> Self {
        Self {
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            enqueued: AtomicU64::new(0),
            queue_dropped: AtomicU64::new(0),
        }
    }
}

struct DispatcherInner {
    rooms: Arc<RoomManager>,
    gateway: Arc<dyn NotificationGateway>,
    config: DispatchConfig,
    stats: AtomicDispatchStats,
}

/// Multi-channel dispatcher with a bounded background worker pool.
pub struct NotificationDispatcher {
    inner: Arc<DispatcherInner>,
    queue_tx: mpsc::Sender<NotificationEnvelope>,
}

impl NotificationDispatcher {
    /// Build the dispatcher and spawn its worker pool. Must be called
    /// from within a tokio runtime. Workers exit once every handle to
    /// the dispatcher is gone.
    pub fn new(
        rooms: Arc<RoomManager>,
        gateway: Arc<dyn NotificationGateway>,
        config: DispatchConfig,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let workers = config.workers.max(1);
        let inner = Arc::new(DispatcherInner {
            rooms,
            gateway,
            config,
            stats: AtomicDispatchStats::new(),
        });

        let queue_rx = Arc::new(Mutex::new(queue_rx));
        for worker in 0..workers {
            let inner = inner.clone();
            let queue_rx = queue_rx.clone();
            tokio::spawn(async move {
                Self::worker_loop(worker, inner, queue_rx).await;
            });
        }

        Arc::new(Self { inner, queue_tx })
    }

    async fn worker_loop(
        worker: usize,
        inner: Arc<DispatcherInner>,
        queue_rx: Arc<Mutex<mpsc::Receiver<NotificationEnvelope>>>,
    ) {
        loop {
            // Hold the receiver lock only while waiting for the next
            // envelope; dispatch runs unlocked so workers overlap.
            let envelope = { queue_rx.lock().await.recv().await };
            let Some(envelope) = envelope else {
                log::debug!("Dispatch worker {worker} shutting down");
                return;
            };
            let result = Self::dispatch(&inner, &envelope).await;
            if result.delivered {
                log::debug!(
                    "Envelope {} delivered via {:?} after {} attempts",
                    result.envelope_id,
                    result.channel,
                    result.attempts
                );
            } else {
                log::warn!(
                    "Envelope {} ({}) exhausted {} channels for {}",
                    result.envelope_id,
                    envelope.template_id,
                    envelope.channel_order.len(),
                    envelope.recipient_id
                );
            }
        }
    }

    /// Submit an envelope for background dispatch. Never blocks: a
    /// full queue drops the envelope with a recorded error.
    pub fn enqueue(&self, envelope: NotificationEnvelope) -> Result<(), DeliveryError> {
        match self.queue_tx.try_send(envelope) {
            Ok(()) => {
                self.inner.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                self.inner.stats.queue_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Dispatch queue full, dropping envelope {} for {}",
                    envelope.id,
                    envelope.recipient_id
                );
                Err(DeliveryError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DeliveryError::QueueClosed),
        }
    }

    /// Walk the envelope's channels in declared order, stopping at the
    /// first success unless the envelope says otherwise.
    pub async fn send(&self, envelope: &NotificationEnvelope) -> DeliveryResult {
        Self::dispatch(&self.inner, envelope).await
    }

    /// Dispatch a batch; one envelope's failure never affects the rest.
    pub async fn send_bulk(&self, envelopes: &[NotificationEnvelope]) -> BulkDeliveryResult {
        let mut result = BulkDeliveryResult::default();
        for envelope in envelopes {
            if self.send(envelope).await.delivered {
                result.success_count += 1;
            } else {
                result.failed_count += 1;
            }
        }
        result
    }

    async fn dispatch(inner: &DispatcherInner, envelope: &NotificationEnvelope) -> DeliveryResult {
        let mut attempts = 0u32;
        let mut first_success: Option<Channel> = None;
        // Guard against a policy listing the same channel twice.
        let mut walked: HashSet<Channel> = HashSet::new();

        for &channel in &envelope.channel_order {
            if !walked.insert(channel) {
                continue;
            }
            let outcome = match channel {
                Channel::Live => {
                    attempts += 1;
                    Self::attempt_live(inner, envelope).await
                }
                external => Self::attempt_external(inner, external, envelope, &mut attempts).await,
            };
            match outcome {
                Ok(()) => {
                    if first_success.is_none() {
                        first_success = Some(channel);
                    }
                    if envelope.stop_on_first_success {
                        break;
                    }
                }
                Err(e) => {
                    log::debug!(
                        "Envelope {} channel {} failed: {e}",
                        envelope.id,
                        channel.as_str()
                    );
                }
            }
        }

        if first_success.is_some() {
            inner.stats.delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            inner.stats.failed.fetch_add(1, Ordering::Relaxed);
        }
        DeliveryResult {
            envelope_id: envelope.id,
            delivered: first_success.is_some(),
            channel: first_success,
            attempts,
        }
    }

    async fn attempt_live(
        inner: &DispatcherInner,
        envelope: &NotificationEnvelope,
    ) -> Result<(), DeliveryError> {
        let event = ServerEvent::Notification {
            template_id: envelope.template_id.clone(),
            payload: envelope.payload.clone(),
        };
        if inner.rooms.unicast(&envelope.recipient_id, &event).await {
            Ok(())
        } else {
            Err(DeliveryError::Offline)
        }
    }

    /// One external channel: bounded attempts with exponential backoff,
    /// each attempt capped by the configured timeout.
    async fn attempt_external(
        inner: &DispatcherInner,
        channel: Channel,
        envelope: &NotificationEnvelope,
        attempts: &mut u32,
    ) -> Result<(), DeliveryError> {
        let config = &inner.config;
        let mut last_error = DeliveryError::Gateway {
            channel,
            reason: "no attempt made".into(),
        };

        for attempt in 1..=config.max_attempts.max(1) {
            *attempts += 1;
            let call = inner.gateway.send(
                channel,
                &envelope.recipient_id,
                &envelope.template_id,
                &envelope.payload,
            );
            match timeout(config.attempt_timeout, call).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => last_error = e,
                Err(_) => last_error = DeliveryError::Timeout(channel),
            }
            if attempt < config.max_attempts {
                let backoff = config.backoff_base * 2u32.saturating_pow(attempt - 1);
                sleep(backoff).await;
            }
        }
        Err(last_error)
    }

    /// Dispatch statistics (lock-free snapshot).
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            delivered: self.inner.stats.delivered.load(Ordering::Relaxed),
            failed: self.inner.stats.failed.load(Ordering::Relaxed),
            enqueued: self.inner.stats.enqueued.load(Ordering::Relaxed),
            queue_dropped: self.inner.stats.queue_dropped.load(Ordering::Relaxed),
        }
    }

    /// The room manager used for the live channel.
    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.inner.rooms
    }
}

// ===================================================================
// Tests
// ===================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Role;
    use crate::registry::{ConnectionHandle, ConnectionRegistry};
    use std::sync::atomic::AtomicU32;

    /// Gateway double: records calls and fails a configurable number
    /// of times before succeeding (u32::MAX = always fail).
    struct ScriptedGateway {
        calls: Mutex<Vec<(Channel, String, String)>>,
        failures_left: AtomicU32,
        delay: Duration,
    }

    impl ScriptedGateway {
        fn ok() -> Arc<Self> {
            Self::failing(0)
        }

        fn failing(times: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                failures_left: AtomicU32::new(times),
                delay: Duration::ZERO,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                failures_left: AtomicU32::new(0),
                delay,
            })
        }

        async fn calls(&self) -> Vec<(Channel, String, String)> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait]
    impl NotificationGateway for ScriptedGateway {
        async fn send(
            &self,
            channel: Channel,
            to: &str,
            template_id: &str,
            _payload: &serde_json::Value,
        ) -> Result<(), DeliveryError> {
            self.calls
                .lock()
                .await
                .push((channel, to.to_string(), template_id.to_string()));
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                if left != u32::MAX {
                    self.failures_left.store(left - 1, Ordering::SeqCst);
                }
                return Err(DeliveryError::Gateway {
                    channel,
                    reason: "scripted failure".into(),
                });
            }
            Ok(())
        }
    }

    fn rooms() -> Arc<RoomManager> {
        Arc::new(RoomManager::new(Arc::new(ConnectionRegistry::new())))
    }

    fn dispatcher(
        rooms: Arc<RoomManager>,
        gateway: Arc<ScriptedGateway>,
    ) -> Arc<NotificationDispatcher> {
        NotificationDispatcher::new(rooms, gateway, DispatchConfig::for_testing())
    }

    fn envelope(channels: Vec<Channel>) -> NotificationEnvelope {
        NotificationEnvelope::new(
            "u-1",
            TEMPLATE_NEW_MESSAGE,
            serde_json::json!({"body": "hi"}),
            channels,
        )
    }

    async fn connect_user(
        rooms: &Arc<RoomManager>,
        user: &str,
    ) -> mpsc::Receiver<Arc<String>> {
        let (tx, rx) = mpsc::channel(16);
        rooms.connect(user, Role::Provider, ConnectionHandle::new(tx)).await;
        rx
    }

    #[tokio::test]
    async fn test_live_channel_short_circuits_gateway() {
        let rooms = rooms();
        let mut rx = connect_user(&rooms, "u-1").await;
        let gateway = ScriptedGateway::ok();
        let dispatcher = dispatcher(rooms, gateway.clone());

        let result = dispatcher.send(&envelope(vec![Channel::Live, Channel::Sms])).await;

        assert!(result.delivered);
        assert_eq!(result.channel, Some(Channel::Live));
        assert_eq!(result.attempts, 1);
        assert!(gateway.calls().await.is_empty(), "no SMS for a live recipient");
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_offline_recipient_falls_back_to_gateway() {
        let gateway = ScriptedGateway::ok();
        let dispatcher = dispatcher(rooms(), gateway.clone());

        let result = dispatcher
            .send(&envelope(vec![Channel::Live, Channel::Email]))
            .await;

        assert!(result.delivered);
        assert_eq!(result.channel, Some(Channel::Email));
        assert_eq!(result.attempts, 2); // one live miss + one email
        let calls = gateway.calls().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, Channel::Email);
        assert_eq!(calls[0].1, "u-1");
    }

    #[tokio::test]
    async fn test_external_channel_retries_then_advances() {
        // Email fails all three tries; SMS succeeds on its first.
        let gateway = ScriptedGateway::failing(3);
        let dispatcher = dispatcher(rooms(), gateway.clone());

        let result = dispatcher
            .send(&envelope(vec![Channel::Email, Channel::Sms]))
            .await;

        assert!(result.delivered);
        assert_eq!(result.channel, Some(Channel::Sms));
        assert_eq!(result.attempts, 4);
        let calls = gateway.calls().await;
        assert_eq!(
            calls.iter().filter(|c| c.0 == Channel::Email).count(),
            3,
            "bounded retry on the failing channel"
        );
        assert_eq!(calls.iter().filter(|c| c.0 == Channel::Sms).count(), 1);
    }

    #[tokio::test]
    async fn test_all_channels_exhausted_is_recorded_not_raised() {
        let gateway = ScriptedGateway::failing(u32::MAX);
        let dispatcher = dispatcher(rooms(), gateway.clone());

        let result = dispatcher
            .send(&envelope(vec![Channel::Live, Channel::Email, Channel::Push]))
            .await;

        assert!(!result.delivered);
        assert_eq!(result.channel, None);
        assert_eq!(result.attempts, 7); // 1 live + 3 email + 3 push
        assert_eq!(dispatcher.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_slow_gateway_hits_attempt_timeout() {
        let gateway = ScriptedGateway::slow(Duration::from_millis(500));
        let dispatcher = dispatcher(rooms(), gateway.clone());

        let result = dispatcher.send(&envelope(vec![Channel::Sms])).await;

        assert!(!result.delivered);
        assert_eq!(result.attempts, 3, "every attempt timed out");
    }

    #[tokio::test]
    async fn test_stop_on_first_success_false_walks_everything() {
        let rooms = rooms();
        let _rx = connect_user(&rooms, "u-1").await;
        let gateway = ScriptedGateway::ok();
        let dispatcher = dispatcher(rooms, gateway.clone());

        let envelope = envelope(vec![Channel::Live, Channel::Email])
            .with_stop_on_first_success(false);
        let result = dispatcher.send(&envelope).await;

        assert!(result.delivered);
        assert_eq!(result.channel, Some(Channel::Live), "first success reported");
        assert_eq!(gateway.calls().await.len(), 1, "email still attempted");
    }

    #[tokio::test]
    async fn test_duplicate_channel_walked_once() {
        let gateway = ScriptedGateway::failing(u32::MAX);
        let dispatcher = dispatcher(rooms(), gateway.clone());

        let result = dispatcher
            .send(&envelope(vec![Channel::Sms, Channel::Sms]))
            .await;

        assert!(!result.delivered);
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn test_send_bulk_counts_are_order_independent() {
        let rooms = rooms();
        let _rx = connect_user(&rooms, "online-user").await;
        let gateway = ScriptedGateway::ok();
        let dispatcher = dispatcher(rooms, gateway);

        let mut batch = Vec::new();
        for _ in 0..5 {
            // Deliverable: live channel, recipient online.
            let mut e = envelope(vec![Channel::Live]);
            e.recipient_id = "online-user".into();
            batch.push(e);
        }
        for _ in 0..3 {
            // Undeliverable: live only, recipient offline.
            let mut e = envelope(vec![Channel::Live]);
            e.recipient_id = "ghost".into();
            batch.push(e);
        }

        let result = dispatcher.send_bulk(&batch).await;
        assert_eq!(result.success_count, 5);
        assert_eq!(result.failed_count, 3);
    }

    #[tokio::test]
    async fn test_enqueue_is_drained_by_workers() {
        let gateway = ScriptedGateway::ok();
        let dispatcher = dispatcher(rooms(), gateway.clone());

        dispatcher.enqueue(envelope(vec![Channel::Email])).unwrap();

        // Background worker owns the walk; poll until it lands.
        for _ in 0..50 {
            if !gateway.calls().await.is_empty() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(gateway.calls().await.len(), 1);
        assert_eq!(dispatcher.stats().enqueued, 1);
    }

    #[tokio::test]
    async fn test_enqueue_full_queue_reports_drop() {
        // No workers can drain fast enough if the gateway is slow and
        // the queue tiny.
        let gateway = ScriptedGateway::slow(Duration::from_millis(100));
        let config = DispatchConfig {
            workers: 1,
            queue_capacity: 1,
            ..DispatchConfig::for_testing()
        };
        let dispatcher = NotificationDispatcher::new(rooms(), gateway, config);

        let mut saw_full = false;
        for _ in 0..8 {
            if matches!(
                dispatcher.enqueue(envelope(vec![Channel::Sms])),
                Err(DeliveryError::QueueFull)
            ) {
                saw_full = true;
                break;
            }
        }
        assert!(saw_full, "bounded queue must eventually refuse");
        assert!(dispatcher.stats().queue_dropped >= 1);
    }

    #[test]
    fn test_envelope_defaults() {
        let e = envelope(vec![Channel::Live]);
        assert!(e.stop_on_first_success);
        assert!(e.scheduled_for.is_none());
        assert!(e.created_at > 0);

        let scheduled = e.with_schedule(12345);
        assert_eq!(scheduled.scheduled_for, Some(12345));
    }
}
