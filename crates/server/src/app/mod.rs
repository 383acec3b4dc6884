pub mod call;
pub mod delivery;
pub mod media;
pub mod messaging;
pub mod notifications;
pub mod notify;
pub mod presence;

use crate::config::{PresenceMode, ServerConfig};
use crate::metrics::Metrics;
use crate::util::generate_id;
use call::CallStore;
use chrono::{Duration, Utc};
use delivery::{ConnectionEntry, Router};
use media::{MediaError, MediaStore};
use notify::{NoopNotifier, Notifier, WebhookNotifier};
use presence::PresenceStore;
use serde_json::Value;
use skylark_proto::{Envelope, EventKind, IncomingCallPayload, RoutedEnvelope};
use skylark_storage::{connect, ConnectionDescriptor, Storage, StorageError};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum ServerError {
    NotFound,
    Unauthorized,
    MediaUpload,
    Storage,
    Invalid,
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "record not found"),
            Self::Unauthorized => write!(f, "requester is not a participant"),
            Self::MediaUpload => write!(f, "media upload failure"),
            Self::Storage => write!(f, "storage failure"),
            Self::Invalid => write!(f, "invalid request"),
        }
    }
}

impl Error for ServerError {}

impl From<StorageError> for ServerError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::Missing => Self::NotFound,
            StorageError::Invalid => Self::Invalid,
            _ => Self::Storage,
        }
    }
}

impl From<MediaError> for ServerError {
    fn from(_: MediaError) -> Self {
        Self::MediaUpload
    }
}

pub struct AppState {
    pub config: ServerConfig,
    pub storage: Arc<Storage>,
    pub metrics: Arc<Metrics>,
    pub registry: Arc<PresenceStore>,
    pub calls: CallStore,
    pub router: Arc<Router>,
    pub notifier: Box<dyn Notifier>,
    pub media: MediaStore,
    pub node_id: String,
}

/// The realtime core. One instance per server process; transports hand it
/// connections and invoke its operations.
pub struct App {
    pub(crate) state: Arc<AppState>,
}

impl App {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Connects the backing stores and spawns the maintenance workers. A
    /// failure here is fatal: the process must not come up half-wired.
    pub async fn init(config: ServerConfig) -> Result<Self, ServerError> {
        let storage = Arc::new(connect(&config.postgres_dsn, &config.redis_url).await?);
        storage.migrate().await?;
        storage.readiness().await?;
        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(|| generate_id("node"));
        let metrics = Arc::new(Metrics::new());
        let (registry, calls, publisher) = match config.presence_mode {
            PresenceMode::Shared => (
                PresenceStore::shared(Arc::clone(&storage)),
                CallStore::shared(Arc::clone(&storage)),
                Some(Arc::clone(&storage)),
            ),
            PresenceMode::Memory => (PresenceStore::memory(), CallStore::memory(), None),
        };
        let registry = Arc::new(registry);
        let router = Arc::new(Router::new(
            node_id.clone(),
            Arc::clone(&registry),
            publisher,
            Arc::clone(&metrics),
            config.fanout_limit,
        ));
        let notifier: Box<dyn Notifier> = match &config.push_webhook {
            Some(endpoint) => Box::new(WebhookNotifier::new(endpoint.clone())),
            None => Box::new(NoopNotifier),
        };
        let media = match &config.media_root {
            Some(root) => MediaStore::directory(PathBuf::from(root)),
            None => MediaStore::Disabled,
        };
        let shared_mode = config.presence_mode == PresenceMode::Shared;
        let state = Arc::new(AppState {
            config,
            storage,
            metrics,
            registry,
            calls,
            router,
            notifier,
            media,
            node_id,
        });
        spawn_presence_refresh(Arc::clone(&state));
        spawn_notification_sweeper(Arc::clone(&state));
        if shared_mode {
            tokio::spawn(run_dispatcher(Arc::clone(&state)));
        }
        info!(node = %state.node_id, "realtime core initialized");
        Ok(Self { state })
    }

    /// Registers a fresh connection: routes events to it, announces presence
    /// and re-rings any call that was parked while the user was offline.
    pub async fn on_connect(
        &self,
        user_id: &str,
        connection_id: &str,
        sender: mpsc::Sender<Envelope>,
    ) {
        let connected_at = Utc::now();
        self.state
            .router
            .attach(ConnectionEntry {
                user_id: user_id.to_string(),
                connection_id: connection_id.to_string(),
                connected_at,
                sender,
            })
            .await;
        let descriptor = ConnectionDescriptor {
            user_id: user_id.to_string(),
            connection_id: connection_id.to_string(),
            node_id: self.state.node_id.clone(),
            connected_at,
        };
        self.state
            .registry
            .register(&descriptor, self.state.config.presence_ttl_seconds)
            .await;
        self.state.metrics.incr_connections();
        info!(user = %user_id, connection = %connection_id, "connection attached");
        match self.state.calls.read_pending(user_id).await {
            Ok(Some(parked)) => {
                let payload = serde_json::to_value(IncomingCallPayload {
                    call_id: parked.call_id.clone(),
                    caller_id: parked.caller_id.clone(),
                })
                .unwrap_or(Value::Null);
                let delivered = self
                    .state
                    .router
                    .deliver(user_id, EventKind::IncomingCall, payload)
                    .await;
                debug!(call = %parked.call_id, delivered, "parked call re-rung");
            }
            Ok(None) => {}
            Err(err) => warn!(user = %user_id, "pending call lookup failed: {}", err),
        }
    }

    /// Unwinds a closed connection. The presence entry is removed only if it
    /// still belongs to this connection, so a quick reconnect on another node
    /// is never knocked offline by the old socket's teardown.
    pub async fn on_disconnect(&self, connection_id: &str) {
        let Some(user_id) = self.state.router.detach(connection_id).await else {
            return;
        };
        let removed = self.state.registry.unregister(&user_id, connection_id).await;
        if !removed {
            debug!(user = %user_id, "presence already owned by a newer connection");
        }
        self.state.metrics.decr_connections();
        info!(user = %user_id, connection = %connection_id, "connection detached");
    }
}

/// Re-publishes presence for every local connection at half the TTL, so
/// entries only lapse when the process actually dies.
fn spawn_presence_refresh(state: Arc<AppState>) {
    tokio::spawn(async move {
        let period = (state.config.presence_ttl_seconds / 2).max(1) as u64;
        let mut ticker = interval(StdDuration::from_secs(period));
        loop {
            ticker.tick().await;
            for descriptor in state.router.local_descriptors().await {
                state
                    .registry
                    .register(&descriptor, state.config.presence_ttl_seconds)
                    .await;
            }
        }
    });
}

fn spawn_notification_sweeper(state: Arc<AppState>) {
    tokio::spawn(async move {
        let mut ticker = interval(StdDuration::from_secs(3_600));
        loop {
            ticker.tick().await;
            let horizon = Duration::days(state.config.notification_horizon_days);
            match state.storage.prune_notifications(horizon).await {
                Ok(0) => {}
                Ok(pruned) => info!(pruned, "expired notifications removed"),
                Err(err) => warn!("notification sweep failed: {}", err),
            }
        }
    });
}

/// Consumes this node's delivery channel and replays routed envelopes into
/// local connections. Reconnects with a short backoff when the subscription
/// drops.
async fn run_dispatcher(state: Arc<AppState>) {
    loop {
        let mut subscription = match state.storage.delivery_subscriber(&state.node_id).await {
            Ok(subscription) => subscription,
            Err(err) => {
                warn!("delivery subscribe failed: {}", err);
                sleep(StdDuration::from_secs(5)).await;
                continue;
            }
        };
        info!(node = %state.node_id, "delivery dispatcher subscribed");
        while let Some(payload) = subscription.next_payload().await {
            match RoutedEnvelope::decode(&payload) {
                Ok(routed) => {
                    state.router.dispatch_local(routed).await;
                }
                Err(err) => warn!("malformed routed envelope: {}", err),
            }
        }
        warn!("delivery subscription closed, reconnecting");
        sleep(StdDuration::from_secs(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_to_api_errors() {
        assert!(matches!(
            ServerError::from(StorageError::Missing),
            ServerError::NotFound
        ));
        assert!(matches!(
            ServerError::from(StorageError::Invalid),
            ServerError::Invalid
        ));
        assert!(matches!(
            ServerError::from(StorageError::Postgres),
            ServerError::Storage
        ));
        assert!(matches!(
            ServerError::from(StorageError::Redis),
            ServerError::Storage
        ));
        assert!(matches!(
            ServerError::from(MediaError::Unavailable),
            ServerError::MediaUpload
        ));
    }
}
