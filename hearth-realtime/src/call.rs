//! Call lifecycle state machine.
//!
//! ```text
//!               ┌──────────┐
//!               │ initiated │──────────────┐
//!               └─────┬────┘              │
//!                     ▼                   │
//!               ┌──────────┐              │
//!               │  ringing  │──────────┐  │
//!               └─────┬────┘           │  │
//!                     ▼                ▼  ▼
//!               ┌────────────┐     ┌───────────────────┐
//!               │ in_progress │───► │ completed/failed/ │
//!               └────────────┘     │    cancelled      │ (terminal)
//!                                  └───────────────────┘
//! ```
//!
//! Transitions for one call are serialized behind a per-call lock:
//! when two conflicting requests race (a `complete` against a
//! `cancel`), exactly one wins and the loser gets
//! [`CallError::InvalidTransition`] with the state untouched.
//!
//! Every successful transition persists through the external
//! [`CallRepository`], broadcasts `call_status_changed` into both
//! participants' private rooms, and hands any out-of-band notification
//! work to the dispatcher — the transition itself never waits on an
//! email or SMS gateway.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::dispatch::{
    Channel, NotificationDispatcher, NotificationEnvelope, TEMPLATE_CALL_ALERT,
    TEMPLATE_CALL_SUMMARY,
};
use crate::protocol::{now_millis, ServerEvent};
use crate::rooms::{RoomId, RoomManager};

/// Lifecycle state of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Initiated,
    Ringing,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Initiated => "initiated",
            CallStatus::Ringing => "ringing",
            CallStatus::InProgress => "in_progress",
            CallStatus::Completed => "completed",
            CallStatus::Failed => "failed",
            CallStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallStatus::Completed | CallStatus::Failed | CallStatus::Cancelled
        )
    }

    /// The transition table. A call only ever advances; it never
    /// regresses into a prior active state.
    pub fn can_transition(self, next: CallStatus) -> bool {
        use CallStatus::*;
        matches!(
            (self, next),
            (Initiated, Ringing)
                | (Initiated, Cancelled)
                | (Initiated, Failed)
                | (Ringing, InProgress)
                | (Ringing, Cancelled)
                | (Ringing, Failed)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
        )
    }
}

/// One call between a customer and a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    pub id: Uuid,
    pub customer_id: String,
    pub provider_id: String,
    pub status: CallStatus,
    pub duration_seconds: Option<u64>,
    pub recording_ref: Option<String>,
    pub service_request_id: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Call {
    /// The other participant, from one participant's point of view.
    pub fn counterpart(&self, user_id: &str) -> Option<&str> {
        if self.customer_id == user_id {
            Some(&self.provider_id)
        } else if self.provider_id == user_id {
            Some(&self.customer_id)
        } else {
            None
        }
    }
}

/// Details that arrive with a terminal transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallDetails {
    pub duration_seconds: Option<u64>,
    pub recording_ref: Option<String>,
}

impl CallDetails {
    pub fn is_empty(&self) -> bool {
        self.duration_seconds.is_none() && self.recording_ref.is_none()
    }
}

/// Call errors.
#[derive(Debug, Clone)]
pub enum CallError {
    /// No call with that id is known here or in the repository.
    NotFound(Uuid),
    /// The requested move is not in the transition table. State is
    /// unchanged.
    InvalidTransition { from: CallStatus, to: CallStatus },
    /// The repository rejected a persistence call.
    Repository(String),
    /// Caller-supplied fields that fail semantic validation.
    Validation(String),
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::NotFound(id) => write!(f, "Call not found: {id}"),
            CallError::InvalidTransition { from, to } => {
                write!(f, "Invalid transition {} -> {}", from.as_str(), to.as_str())
            }
            CallError::Repository(e) => write!(f, "Call repository error: {e}"),
            CallError::Validation(e) => write!(f, "Invalid call request: {e}"),
        }
    }
}

impl std::error::Error for CallError {}

/// Filters for paginated call listings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallFilter {
    pub customer_id: Option<String>,
    pub provider_id: Option<String>,
    pub status: Option<CallStatus>,
}

/// Durable call storage, implemented outside this crate.
#[async_trait]
pub trait CallRepository: Send + Sync {
    async fn create(&self, call: &Call) -> Result<(), CallError>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Call>, CallError>;
    async fn update_status(&self, id: Uuid, status: CallStatus) -> Result<(), CallError>;
    async fn update_details(
        &self,
        id: Uuid,
        duration_seconds: Option<u64>,
        recording_ref: Option<&str>,
    ) -> Result<(), CallError>;
    async fn list(
        &self,
        filter: &CallFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Call>, CallError>;
}

/// The signaling state machine service.
pub struct CallSignaling {
    /// Live calls, each behind its own lock so transitions on one call
    /// serialize without blocking unrelated calls.
    calls: RwLock<HashMap<Uuid, Arc<Mutex<Call>>>>,
    repo: Arc<dyn CallRepository>,
    rooms: Arc<RoomManager>,
    dispatcher: Arc<NotificationDispatcher>,
}

impl CallSignaling {
    pub fn new(
        repo: Arc<dyn CallRepository>,
        rooms: Arc<RoomManager>,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> Self {
        Self {
            calls: RwLock::new(HashMap::new()),
            repo,
            rooms,
            dispatcher,
        }
    }

    /// Start a call. Persists it, announces `call_status_changed` to
    /// both private rooms, and submits a call-alert for the provider
    /// (live first, SMS/push fallback).
    pub async fn initiate(
        &self,
        customer_id: impl Into<String>,
        provider_id: impl Into<String>,
        service_request_id: Option<String>,
    ) -> Result<Call, CallError> {
        let customer_id = customer_id.into();
        let provider_id = provider_id.into();
        if customer_id.is_empty() || provider_id.is_empty() {
            return Err(CallError::Validation("participant ids must be non-empty".into()));
        }
        if customer_id == provider_id {
            return Err(CallError::Validation("cannot call yourself".into()));
        }

        let now = now_millis();
        let call = Call {
            id: Uuid::new_v4(),
            customer_id,
            provider_id,
            status: CallStatus::Initiated,
            duration_seconds: None,
            recording_ref: None,
            service_request_id,
            created_at: now,
            updated_at: now,
        };
        self.repo.create(&call).await?;
        self.calls
            .write()
            .await
            .insert(call.id, Arc::new(Mutex::new(call.clone())));

        log::info!(
            "Call {} initiated: {} -> {}",
            call.id,
            call.customer_id,
            call.provider_id
        );
        self.announce(&call).await;
        self.alert_callee(&call);
        Ok(call)
    }

    /// Apply one transition. Illegal moves are rejected without
    /// mutating anything; of two racing conflicting requests exactly
    /// one succeeds.
    pub async fn transition(
        &self,
        call_id: Uuid,
        to: CallStatus,
        details: CallDetails,
    ) -> Result<Call, CallError> {
        let entry = self.entry(call_id).await?;
        let snapshot = {
            let mut call = entry.lock().await;
            if !call.status.can_transition(to) {
                log::warn!(
                    "Rejected call {} transition {} -> {}",
                    call_id,
                    call.status.as_str(),
                    to.as_str()
                );
                return Err(CallError::InvalidTransition {
                    from: call.status,
                    to,
                });
            }

            // Persist before mutating so a repository failure leaves
            // the in-memory state exactly where it was.
            self.repo.update_status(call_id, to).await?;
            if !details.is_empty() {
                self.repo
                    .update_details(
                        call_id,
                        details.duration_seconds,
                        details.recording_ref.as_deref(),
                    )
                    .await?;
            }

            call.status = to;
            if details.duration_seconds.is_some() {
                call.duration_seconds = details.duration_seconds;
            }
            if details.recording_ref.is_some() {
                call.recording_ref = details.recording_ref.clone();
            }
            call.updated_at = now_millis();
            call.clone()
        };

        log::info!("Call {} -> {}", call_id, to.as_str());
        self.announce(&snapshot).await;
        if to == CallStatus::Completed {
            self.send_summaries(&snapshot);
        }
        Ok(snapshot)
    }

    /// Current state of a call, if this instance knows it.
    pub async fn find(&self, call_id: Uuid) -> Option<Call> {
        let entry = { self.calls.read().await.get(&call_id).cloned() };
        match entry {
            Some(entry) => Some(entry.lock().await.clone()),
            None => None,
        }
    }

    /// Paginated listing, straight from the repository.
    pub async fn list(
        &self,
        filter: &CallFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Call>, CallError> {
        self.repo.list(filter, offset, limit).await
    }

    /// Look a call up, hydrating from the repository when this
    /// instance has not seen it yet (e.g. after a restart).
    async fn entry(&self, call_id: Uuid) -> Result<Arc<Mutex<Call>>, CallError> {
        if let Some(entry) = self.calls.read().await.get(&call_id) {
            return Ok(entry.clone());
        }
        let Some(call) = self.repo.find_by_id(call_id).await? else {
            return Err(CallError::NotFound(call_id));
        };
        let mut calls = self.calls.write().await;
        // Another task may have hydrated while we read the repo.
        let entry = calls
            .entry(call_id)
            .or_insert_with(|| Arc::new(Mutex::new(call)))
            .clone();
        Ok(entry)
    }

    /// Broadcast `call_status_changed` to both participants' private
    /// rooms. Offline participants simply miss the live event; the
    /// notification path covers them separately.
    async fn announce(&self, call: &Call) {
        let event = ServerEvent::CallStatusChanged {
            call_id: call.id,
            status: call.status,
            customer_id: call.customer_id.clone(),
            provider_id: call.provider_id.clone(),
        };
        for user in [&call.customer_id, &call.provider_id] {
            if let Err(e) = self
                .rooms
                .broadcast(&RoomId::Private(user.clone()), &event)
                .await
            {
                log::error!("Failed to announce call {}: {e}", call.id);
            }
        }
    }

    /// Call-alert for the provider: live first, then SMS, then push.
    fn alert_callee(&self, call: &Call) {
        let envelope = NotificationEnvelope::new(
            call.provider_id.clone(),
            TEMPLATE_CALL_ALERT,
            serde_json::json!({
                "callId": call.id,
                "customerId": call.customer_id,
                "serviceRequestId": call.service_request_id,
            }),
            vec![Channel::Live, Channel::Sms, Channel::Push],
        );
        if let Err(e) = self.dispatcher.enqueue(envelope) {
            log::error!("Call-alert for call {} not queued: {e}", call.id);
        }
    }

    /// Completion summary for both participants.
    fn send_summaries(&self, call: &Call) {
        for user in [&call.customer_id, &call.provider_id] {
            let envelope = NotificationEnvelope::new(
                user.clone(),
                TEMPLATE_CALL_SUMMARY,
                serde_json::json!({
                    "callId": call.id,
                    "status": call.status.as_str(),
                    "durationSeconds": call.duration_seconds,
                    "customerId": call.customer_id,
                    "providerId": call.provider_id,
                }),
                vec![Channel::Live, Channel::Email],
            );
            if let Err(e) = self.dispatcher.enqueue(envelope) {
                log::error!("Call summary for call {} not queued: {e}", call.id);
            }
        }
    }
}

// ===================================================================
// Tests
// ===================================================================
