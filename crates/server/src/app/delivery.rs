use crate::app::presence::PresenceStore;
use crate::metrics::Metrics;
use chrono::{DateTime, Utc};
use serde_json::Value;
use skylark_proto::{Envelope, EventKind, RoutedEnvelope};
use skylark_storage::{ConnectionDescriptor, Storage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// One attached socket. The sender feeds the transport task that owns the
/// actual connection; dropping the receiver marks the connection dead.
pub struct ConnectionEntry {
    pub user_id: String,
    pub connection_id: String,
    pub connected_at: DateTime<Utc>,
    pub sender: mpsc::Sender<Envelope>,
}

/// Best-effort event router. Persistence always happens before anything is
/// handed to the router, so a failed delivery only means the recipient will
/// catch up from the database on their next sync.
pub struct Router {
    node_id: String,
    registry: Arc<PresenceStore>,
    connections: RwLock<HashMap<String, ConnectionEntry>>,
    publisher: Option<Arc<Storage>>,
    metrics: Arc<Metrics>,
    fanout_limit: usize,
}

impl Router {
    pub fn new(
        node_id: String,
        registry: Arc<PresenceStore>,
        publisher: Option<Arc<Storage>>,
        metrics: Arc<Metrics>,
        fanout_limit: usize,
    ) -> Self {
        Self {
            node_id,
            registry,
            connections: RwLock::new(HashMap::new()),
            publisher,
            metrics,
            fanout_limit,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Attaches a connection, replacing any previous entry for the user.
    pub async fn attach(&self, entry: ConnectionEntry) {
        let mut connections = self.connections.write().await;
        connections.insert(entry.user_id.clone(), entry);
    }

    /// Detaches by connection id and returns the owning user, if the entry
    /// was still current. A reconnect that already replaced the entry makes
    /// the late detach a no-op.
    pub async fn detach(&self, connection_id: &str) -> Option<String> {
        let mut connections = self.connections.write().await;
        let user_id = connections
            .iter()
            .find(|(_, entry)| entry.connection_id == connection_id)
            .map(|(user_id, _)| user_id.clone())?;
        connections.remove(&user_id);
        Some(user_id)
    }

    /// Descriptors for every locally attached connection, used by the
    /// presence refresh worker.
    pub async fn local_descriptors(&self) -> Vec<ConnectionDescriptor> {
        let connections = self.connections.read().await;
        connections
            .values()
            .map(|entry| ConnectionDescriptor {
                user_id: entry.user_id.clone(),
                connection_id: entry.connection_id.clone(),
                node_id: self.node_id.clone(),
                connected_at: entry.connected_at,
            })
            .collect()
    }

    /// Pushes one event toward a user. Returns whether a live connection
    /// accepted it; `false` covers offline, stale and transport failures
    /// alike, and the caller is free to ignore it.
    pub async fn deliver(&self, target_user_id: &str, event: EventKind, payload: Value) -> bool {
        let Some(descriptor) = self.registry.resolve(target_user_id).await else {
            return false;
        };
        self.forward(&descriptor, Envelope::new(event, payload)).await
    }

    /// Fans one event out to many users, capped at the configured limit.
    /// Returns the number of live deliveries.
    pub async fn deliver_many(&self, targets: &[String], event: EventKind, payload: Value) -> usize {
        let capped = if targets.len() > self.fanout_limit {
            warn!(
                requested = targets.len(),
                limit = self.fanout_limit,
                "fan-out truncated"
            );
            &targets[..self.fanout_limit]
        } else {
            targets
        };
        let descriptors = self.registry.resolve_many(capped).await;
        let mut delivered = 0usize;
        for descriptor in descriptors.into_iter().flatten() {
            if self
                .forward(&descriptor, Envelope::new(event, payload.clone()))
                .await
            {
                delivered += 1;
            }
        }
        delivered
    }

    /// Hands a routed envelope from the shared bus to the local connection it
    /// names. Stale connection ids are dropped silently.
    pub async fn dispatch_local(&self, routed: RoutedEnvelope) -> bool {
        self.push_local(
            &routed.target_user_id,
            &routed.connection_id,
            routed.envelope,
        )
        .await
    }

    async fn forward(&self, descriptor: &ConnectionDescriptor, envelope: Envelope) -> bool {
        if descriptor.node_id == self.node_id {
            return self
                .push_local(&descriptor.user_id, &descriptor.connection_id, envelope)
                .await;
        }
        let Some(publisher) = &self.publisher else {
            self.metrics.mark_event_dropped();
            return false;
        };
        let routed = RoutedEnvelope {
            target_user_id: descriptor.user_id.clone(),
            connection_id: descriptor.connection_id.clone(),
            envelope,
        };
        let encoded = match routed.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(user = %descriptor.user_id, "routed envelope encoding failed: {}", err);
                self.metrics.mark_event_dropped();
                return false;
            }
        };
        match publisher.publish_delivery(&descriptor.node_id, &encoded).await {
            Ok(()) => {
                self.metrics.mark_event_delivered();
                true
            }
            Err(err) => {
                warn!(node = %descriptor.node_id, "delivery publish failed: {}", err);
                self.metrics.mark_event_dropped();
                false
            }
        }
    }

    async fn push_local(&self, user_id: &str, connection_id: &str, envelope: Envelope) -> bool {
        let sender = {
            let connections = self.connections.read().await;
            match connections.get(user_id) {
                Some(entry) if entry.connection_id == connection_id => entry.sender.clone(),
                _ => {
                    debug!(user = %user_id, "dropping event for stale connection");
                    self.metrics.mark_event_dropped();
                    return false;
                }
            }
        };
        match sender.send(envelope).await {
            Ok(()) => {
                self.metrics.mark_event_delivered();
                true
            }
            Err(_) => {
                debug!(user = %user_id, "connection channel closed");
                self.metrics.mark_event_dropped();
                false
            }
        }
    }
}
