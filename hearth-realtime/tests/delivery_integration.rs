//! Dispatcher + scheduler integration: bulk delivery, delayed
//! delivery timing bounds, and the decoupling of event handling from
//! slow external gateways.

use async_trait::async_trait;
use hearth_realtime::{
    Call, CallError, CallFilter, CallRepository, CallStatus, Channel, ConnectionHandle,
    DelayStore, DelayStoreConfig, DeliveryError, MemoryDelayStore, NotificationEnvelope,
    NotificationGateway, RealtimeConfig, RealtimeCore, RocksDelayStore, Role,
};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Duration, Instant};
use uuid::Uuid;

struct NullRepo;

#[async_trait]
impl CallRepository for NullRepo {
    async fn create(&self, _call: &Call) -> Result<(), CallError> {
        Ok(())
    }
    async fn find_by_id(&self, _id: Uuid) -> Result<Option<Call>, CallError> {
        Ok(None)
    }
    async fn update_status(&self, _id: Uuid, _status: CallStatus) -> Result<(), CallError> {
        Ok(())
    }
    async fn update_details(
        &self,
        _id: Uuid,
        _duration_seconds: Option<u64>,
        _recording_ref: Option<&str>,
    ) -> Result<(), CallError> {
        Ok(())
    }
    async fn list(
        &self,
        _filter: &CallFilter,
        _offset: usize,
        _limit: usize,
    ) -> Result<Vec<Call>, CallError> {
        Ok(Vec::new())
    }
}

struct RecordingGateway {
    calls: Mutex<Vec<(Channel, String, String)>>,
    delay: Duration,
}

impl RecordingGateway {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            delay,
        })
    }

    async fn count(&self) -> usize {
        self.calls.lock().await.len()
    }
}

#[async_trait]
impl NotificationGateway for RecordingGateway {
    async fn send(
        &self,
        channel: Channel,
        to: &str,
        template_id: &str,
        _payload: &serde_json::Value,
    ) -> Result<(), DeliveryError> {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        self.calls
            .lock()
            .await
            .push((channel, to.to_string(), template_id.to_string()));
        Ok(())
    }
}

fn core_with(gateway: Arc<RecordingGateway>) -> Arc<RealtimeCore> {
    RealtimeCore::new(
        RealtimeConfig::for_testing("127.0.0.1:0"),
        Arc::new(NullRepo),
        gateway,
        Arc::new(MemoryDelayStore::new()),
    )
}

fn envelope(recipient: &str, channels: Vec<Channel>) -> NotificationEnvelope {
    NotificationEnvelope::new(
        recipient,
        "new_message",
        serde_json::json!({"body": "hi"}),
        channels,
    )
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

async fn wait_for(gateway: &RecordingGateway, expected: usize) {
    for _ in 0..200 {
        if gateway.count().await >= expected {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {expected} gateway calls, saw {}", gateway.count().await);
}

// ─── Bulk dispatch ───────────────────────────────────────────────

#[tokio::test]
async fn test_send_bulk_counts_deliverable_and_not() {
    let gateway = RecordingGateway::new();
    let core = core_with(gateway.clone());

    // One live user; envelopes to them succeed over the live channel.
    let (tx, _rx) = mpsc::channel(64);
    core.rooms()
        .connect("online", Role::Customer, ConnectionHandle::new(tx))
        .await;

    let mut batch = Vec::new();
    for _ in 0..5 {
        batch.push(envelope("online", vec![Channel::Live]));
    }
    for _ in 0..3 {
        batch.push(envelope("offline", vec![Channel::Live]));
    }

    let result = core.dispatcher().send_bulk(&batch).await;
    assert_eq!(result.success_count, 5);
    assert_eq!(result.failed_count, 3);
}

// ─── Delayed delivery ────────────────────────────────────────────

#[tokio::test]
async fn test_schedule_past_time_dispatches_exactly_once() {
    let gateway = RecordingGateway::new();
    let core = core_with(gateway.clone());
    let sweeper = core.start();

    core.schedule_notification(
        envelope("u-1", vec![Channel::Email]),
        now_millis() - 10_000,
    )
    .await
    .unwrap();

    wait_for(&gateway, 1).await;
    // Several sweep intervals later, still exactly one delivery.
    sleep(Duration::from_millis(150)).await;
    assert_eq!(gateway.count().await, 1);
    sweeper.abort();
}

#[tokio::test]
async fn test_schedule_future_respects_due_time_and_interval_bound() {
    let gateway = RecordingGateway::new();
    let core = core_with(gateway.clone());
    let sweeper = core.start();

    // Sweep interval is 25ms in the testing config; the jitter bound
    // we assert is due_time + interval + generous dispatch slack.
    let delay = Duration::from_millis(200);
    let due_at = now_millis() + delay.as_millis() as u64;
    core.schedule_notification(envelope("u-1", vec![Channel::Email]), due_at)
        .await
        .unwrap();

    sleep(delay / 2).await;
    assert_eq!(gateway.count().await, 0, "nothing before the due time");

    wait_for(&gateway, 1).await;
    assert!(
        now_millis() >= due_at,
        "delivery happened before the due time"
    );
    sweeper.abort();
}

#[tokio::test]
async fn test_scheduled_envelope_survives_rocksdb_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        RocksDelayStore::open(DelayStoreConfig::for_testing(dir.path().join("db"))).unwrap(),
    );
    let gateway = RecordingGateway::new();
    let core = RealtimeCore::new(
        RealtimeConfig::for_testing("127.0.0.1:0"),
        Arc::new(NullRepo),
        gateway.clone(),
        store.clone(),
    );
    let sweeper = core.start();

    core.schedule_notification(
        envelope("u-1", vec![Channel::Sms]),
        now_millis() + 60,
    )
    .await
    .unwrap();

    wait_for(&gateway, 1).await;
    assert_eq!(
        store.pending_count().await.unwrap(),
        0,
        "dispatched entry deleted from the store"
    );
    sweeper.abort();
}

// ─── Decoupling ──────────────────────────────────────────────────

#[tokio::test]
async fn test_slow_gateway_does_not_stall_event_path() {
    // Gateway takes 300ms per send; routing a message to an offline
    // user must return long before that.
    let gateway = RecordingGateway::slow(Duration::from_millis(300));
    let core = core_with(gateway.clone());

    let started = Instant::now();
    core.send_message("u-1", "offline-user", "hello", "text")
        .await
        .unwrap();
    assert!(
        started.elapsed() < Duration::from_millis(200),
        "send_message blocked on the gateway: {:?}",
        started.elapsed()
    );

    // The fallback still happens, just in the background.
    wait_for(&gateway, 1).await;
}
