use crate::app::{App, ServerError};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use skylark_proto::{CallAnswerPayload, CallCanceledPayload, EventKind, IncomingCallPayload};
use skylark_storage::{ordered_pair, CallRecord, Storage, StorageError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Canonical key for the call between two users, identical no matter which
/// side dials. "alice calls bob" and "bob calls alice" address one record.
pub fn call_key(a: &str, b: &str) -> String {
    let (low, high) = ordered_pair(a, b);
    format!("{}:{}", low, high)
}

pub struct ExpiringCall {
    record: CallRecord,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemoryCalls {
    active: HashMap<String, ExpiringCall>,
    pending: HashMap<String, ExpiringCall>,
}

/// Ephemeral call state. Active calls are keyed by the canonical call key,
/// pending calls by the offline callee. Both expire on their own so an
/// abandoned attempt never wedges either side.
pub enum CallStore {
    Shared(Arc<Storage>),
    Memory(Mutex<MemoryCalls>),
}

impl CallStore {
    pub fn shared(storage: Arc<Storage>) -> Self {
        Self::Shared(storage)
    }

    pub fn memory() -> Self {
        Self::Memory(Mutex::new(MemoryCalls::default()))
    }

    pub async fn put_active(&self, record: &CallRecord, ttl_seconds: i64) -> Result<(), StorageError> {
        match self {
            Self::Shared(storage) => storage.put_active_call(record, ttl_seconds).await,
            Self::Memory(calls) => {
                calls.lock().await.active.insert(
                    record.call_id.clone(),
                    expiring(record, ttl_seconds),
                );
                Ok(())
            }
        }
    }

    pub async fn read_active(&self, call_id: &str) -> Result<Option<CallRecord>, StorageError> {
        match self {
            Self::Shared(storage) => storage.read_active_call(call_id).await,
            Self::Memory(calls) => Ok(read_live(&mut calls.lock().await.active, call_id)),
        }
    }

    pub async fn delete_active(&self, call_id: &str) -> Result<bool, StorageError> {
        match self {
            Self::Shared(storage) => storage.delete_active_call(call_id).await,
            Self::Memory(calls) => Ok(calls.lock().await.active.remove(call_id).is_some()),
        }
    }

    pub async fn put_pending(&self, record: &CallRecord, ttl_seconds: i64) -> Result<(), StorageError> {
        match self {
            Self::Shared(storage) => storage.put_pending_call(record, ttl_seconds).await,
            Self::Memory(calls) => {
                calls.lock().await.pending.insert(
                    record.callee_id.clone(),
                    expiring(record, ttl_seconds),
                );
                Ok(())
            }
        }
    }

    pub async fn read_pending(&self, callee_id: &str) -> Result<Option<CallRecord>, StorageError> {
        match self {
            Self::Shared(storage) => storage.read_pending_call(callee_id).await,
            Self::Memory(calls) => Ok(read_live(&mut calls.lock().await.pending, callee_id)),
        }
    }

    pub async fn delete_pending(&self, callee_id: &str) -> Result<bool, StorageError> {
        match self {
            Self::Shared(storage) => storage.delete_pending_call(callee_id).await,
            Self::Memory(calls) => Ok(calls.lock().await.pending.remove(callee_id).is_some()),
        }
    }
}

fn expiring(record: &CallRecord, ttl_seconds: i64) -> ExpiringCall {
    ExpiringCall {
        record: record.clone(),
        expires_at: Utc::now() + Duration::seconds(ttl_seconds),
    }
}

fn read_live(map: &mut HashMap<String, ExpiringCall>, key: &str) -> Option<CallRecord> {
    match map.get(key) {
        Some(entry) if entry.expires_at > Utc::now() => Some(entry.record.clone()),
        Some(_) => {
            map.remove(key);
            None
        }
        None => None,
    }
}

/// What `start_call` produced: a live ring on the callee's connection, or a
/// parked offer for an offline callee.
pub enum CallOutcome {
    Ringing(CallRecord),
    Pending(CallRecord),
}

impl App {
    pub async fn start_call(
        &self,
        caller_id: &str,
        callee_id: &str,
    ) -> Result<CallOutcome, ServerError> {
        if caller_id == callee_id || caller_id.is_empty() || callee_id.is_empty() {
            return Err(ServerError::Invalid);
        }
        let call_id = call_key(caller_id, callee_id);
        if self.state.calls.read_active(&call_id).await?.is_some() {
            return Err(ServerError::Invalid);
        }
        let record = CallRecord {
            call_id: call_id.clone(),
            caller_id: caller_id.to_string(),
            callee_id: callee_id.to_string(),
            started_at: Utc::now(),
        };
        let payload = incoming_call_payload(&record);
        let outcome = if self.state.registry.resolve(callee_id).await.is_some() {
            self.state
                .calls
                .put_active(&record, self.state.config.active_call_ttl_seconds)
                .await?;
            self.set_in_call_flags(&[caller_id, callee_id], true).await;
            let delivered = self
                .state
                .router
                .deliver(callee_id, EventKind::IncomingCall, payload)
                .await;
            debug!(call = %call_id, delivered, "incoming call routed");
            CallOutcome::Ringing(record)
        } else {
            self.state
                .calls
                .put_pending(&record, self.state.config.pending_call_ttl_seconds)
                .await?;
            self.state
                .notifier
                .push(callee_id, EventKind::IncomingCall.as_str(), &payload);
            info!(call = %call_id, callee = %callee_id, "call parked for offline callee");
            CallOutcome::Pending(record)
        };
        self.state.metrics.mark_call_started();
        Ok(outcome)
    }

    /// Accepts under the canonical key: either promotes the callee's pending
    /// offer to an active call or acknowledges an already active ring.
    pub async fn accept_call(
        &self,
        callee_id: &str,
        caller_id: &str,
    ) -> Result<CallRecord, ServerError> {
        let call_id = call_key(caller_id, callee_id);
        let record = match self.state.calls.read_pending(callee_id).await? {
            Some(pending) if pending.call_id == call_id => {
                if let Err(err) = self.state.calls.delete_pending(callee_id).await {
                    warn!(callee = %callee_id, "pending call cleanup failed: {}", err);
                }
                self.state
                    .calls
                    .put_active(&pending, self.state.config.active_call_ttl_seconds)
                    .await?;
                pending
            }
            _ => self
                .state
                .calls
                .read_active(&call_id)
                .await?
                .ok_or(ServerError::NotFound)?,
        };
        self.set_in_call_flags(&[caller_id, callee_id], true).await;
        let payload = serde_json::to_value(CallAnswerPayload {
            call_id: call_id.clone(),
            callee_id: callee_id.to_string(),
        })
        .unwrap_or(Value::Null);
        let delivered = self
            .state
            .router
            .deliver(caller_id, EventKind::CallAccepted, payload)
            .await;
        debug!(call = %call_id, delivered, "call accepted");
        Ok(record)
    }

    /// Tears a call down from either side. Infallible on purpose: every step
    /// is attempted and failures are only logged, so hangup always works no
    /// matter which transport or direction it arrives from.
    pub async fn cancel_call(&self, a: &str, b: &str) {
        let call_id = call_key(a, b);
        match self.state.calls.delete_active(&call_id).await {
            Ok(true) => info!(call = %call_id, "active call canceled"),
            Ok(false) => {}
            Err(err) => warn!(call = %call_id, "active call cleanup failed: {}", err),
        }
        for user_id in [a, b] {
            match self.state.calls.delete_pending(user_id).await {
                Ok(true) => info!(call = %call_id, user = %user_id, "pending call cleared"),
                Ok(false) => {}
                Err(err) => warn!(user = %user_id, "pending call cleanup failed: {}", err),
            }
        }
        let payload = serde_json::to_value(CallCanceledPayload {
            call_id: call_id.clone(),
        })
        .unwrap_or(Value::Null);
        self.state
            .router
            .deliver(a, EventKind::CallCanceled, payload.clone())
            .await;
        self.state
            .router
            .deliver(b, EventKind::CallCanceled, payload)
            .await;
        self.set_in_call_flags(&[a, b], false).await;
        self.state.metrics.mark_call_canceled();
    }

    /// Best effort: the flag is advisory UI state, never authoritative.
    pub(crate) async fn set_in_call_flags(&self, user_ids: &[&str], value: bool) {
        for user_id in user_ids {
            if let Err(err) = self.state.storage.set_in_call(user_id, value).await {
                warn!(user = %user_id, "in-call flag update failed: {}", err);
            }
        }
    }
}

fn incoming_call_payload(record: &CallRecord) -> Value {
    serde_json::to_value(IncomingCallPayload {
        call_id: record.call_id.clone(),
        caller_id: record.caller_id.clone(),
    })
    .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(caller: &str, callee: &str) -> CallRecord {
        CallRecord {
            call_id: call_key(caller, callee),
            caller_id: caller.to_string(),
            callee_id: callee.to_string(),
            started_at: Utc::now(),
        }
    }

    #[test]
    fn call_key_ignores_direction() {
        assert_eq!(call_key("alice", "bob"), call_key("bob", "alice"));
        assert_eq!(call_key("alice", "bob"), "alice:bob");
    }

    #[tokio::test]
    async fn cancel_key_works_from_the_other_side() {
        let store = CallStore::memory();
        store.put_active(&record("carol", "dave"), 60).await.unwrap();
        assert!(store
            .read_active(&call_key("dave", "carol"))
            .await
            .unwrap()
            .is_some());
        assert!(store.delete_active(&call_key("dave", "carol")).await.unwrap());
        assert!(store
            .read_active(&call_key("carol", "dave"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn pending_calls_expire() {
        let store = CallStore::memory();
        store.put_pending(&record("alice", "bob"), -1).await.unwrap();
        assert!(store.read_pending("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deleting_absent_records_reports_false() {
        let store = CallStore::memory();
        assert!(!store.delete_active("alice:bob").await.unwrap());
        assert!(!store.delete_pending("bob").await.unwrap());
    }
}
