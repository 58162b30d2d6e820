//! Delayed delivery: hold an envelope until its time, then dispatch.
//!
//! ```text
//! schedule(envelope, deliver_at)
//!        │
//!        ├── deliver_at <= now ──► Dispatcher::enqueue (exactly once)
//!        │
//!        └── future ──► DelayStore::put(id, deliver_at, envelope)
//!                              │
//!                   sweep task (every interval)
//!                              │
//!                       pull_due(now) ──► enqueue ──► delete
//! ```
//!
//! One sweep task exists per scheduler and never overlaps itself: the
//! loop awaits each sweep before ticking again, the interval skips
//! missed ticks rather than queueing them, and `sweep_once` carries an
//! explicit guard for callers driving sweeps by hand. Delivery timing
//! is deliberately loose — an envelope fires within one sweep interval
//! after its due time, never before it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::dispatch::{DeliveryError, NotificationDispatcher, NotificationEnvelope};
use crate::protocol::now_millis;
use crate::store::{DelayStore, StoreError};

/// Scheduling errors, surfaced to the caller of `schedule`.
#[derive(Debug, Clone)]
pub enum ScheduleError {
    Store(StoreError),
    Queue(DeliveryError),
}

impl std::fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleError::Store(e) => write!(f, "Delay store error: {e}"),
            ScheduleError::Queue(e) => write!(f, "Dispatch handoff failed: {e}"),
        }
    }
}

impl std::error::Error for ScheduleError {}

impl From<StoreError> for ScheduleError {
    fn from(e: StoreError) -> Self {
        ScheduleError::Store(e)
    }
}

/// Outcome of one manual sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Another sweep was still running; this one did nothing.
    Skipped,
    /// The sweep ran and handed this many envelopes to the dispatcher.
    Completed(usize),
}

/// Periodic due-entry puller over a [`DelayStore`].
pub struct DelayedScheduler {
    store: Arc<dyn DelayStore>,
    dispatcher: Arc<NotificationDispatcher>,
    sweep_interval: Duration,
    /// Overlap guard shared by the loop and manual `sweep_once` calls.
    sweeping: AtomicBool,
    sweeps_run: AtomicU64,
}

impl DelayedScheduler {
    pub fn new(
        store: Arc<dyn DelayStore>,
        dispatcher: Arc<NotificationDispatcher>,
        sweep_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            dispatcher,
            sweep_interval,
            sweeping: AtomicBool::new(false),
            sweeps_run: AtomicU64::new(0),
        })
    }

    /// Schedule an envelope. Anything due now (or in the past) goes to
    /// the dispatcher immediately — exactly one submission — and never
    /// touches the store.
    pub async fn schedule(
        &self,
        envelope: NotificationEnvelope,
        deliver_at: u64,
    ) -> Result<(), ScheduleError> {
        let now = now_millis();
        if deliver_at <= now {
            return self
                .dispatcher
                .enqueue(envelope)
                .map_err(ScheduleError::Queue);
        }

        let envelope = envelope.with_schedule(deliver_at);
        self.store.put(envelope.id, deliver_at, &envelope).await?;
        log::debug!(
            "Envelope {} parked until {deliver_at} ({}ms out)",
            envelope.id,
            deliver_at - now
        );
        Ok(())
    }

    /// Pull and dispatch everything due. Returns [`SweepOutcome::Skipped`]
    /// when a sweep is already in flight — never two at once.
    pub async fn sweep_once(&self) -> Result<SweepOutcome, StoreError> {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::trace!("Sweep already running, skipping");
            return Ok(SweepOutcome::Skipped);
        }
        let result = self.sweep_inner().await;
        self.sweeping.store(false, Ordering::SeqCst);
        self.sweeps_run.fetch_add(1, Ordering::Relaxed);
        result.map(SweepOutcome::Completed)
    }

    async fn sweep_inner(&self) -> Result<usize, StoreError> {
        let now = now_millis();
        let due = self.store.pull_due(now).await?;
        if due.is_empty() {
            return Ok(0);
        }

        let mut dispatched = 0;
        for (key, envelope) in due {
            match self.dispatcher.enqueue(envelope) {
                Ok(()) => {
                    // Delete only after the handoff so a failure here
                    // re-delivers on the next sweep instead of losing
                    // the envelope.
                    self.store.delete(key).await?;
                    dispatched += 1;
                }
                Err(e) => {
                    // Queue full: leave the entry for the next sweep.
                    log::warn!("Sweep could not enqueue envelope {key}: {e}");
                }
            }
        }
        log::debug!("Sweep dispatched {dispatched} due envelopes");
        Ok(dispatched)
    }

    /// Spawn the periodic sweep loop. The interval skips missed ticks,
    /// so a long sweep swallows the ticks it overran instead of
    /// queueing catch-up sweeps.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(scheduler.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = scheduler.sweep_once().await {
                    log::error!("Sweep failed: {e}");
                }
            }
        })
    }

    /// Number of sweeps that actually ran (skipped ones don't count).
    pub fn sweeps_run(&self) -> u64 {
        self.sweeps_run.load(Ordering::Relaxed)
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }
}

// ===================================================================
// Tests
// ===================================================================
