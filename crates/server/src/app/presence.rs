use chrono::{DateTime, Duration, Utc};
use skylark_storage::{ConnectionDescriptor, Storage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

pub struct MemoryPresence {
    descriptor: ConnectionDescriptor,
    expires_at: DateTime<Utc>,
}

/// Registry of online users. The shared variant reads and writes the Redis
/// presence keys so every node sees the same picture; the memory variant is a
/// single-process fallback with the same semantics, used when no shared tier
/// is configured and by unit tests.
///
/// Lookups degrade to "offline" instead of failing: the registry is a hint
/// for routing, never the source of truth for message persistence.
pub enum PresenceStore {
    Shared(Arc<Storage>),
    Memory(RwLock<HashMap<String, MemoryPresence>>),
}

impl PresenceStore {
    pub fn shared(storage: Arc<Storage>) -> Self {
        Self::Shared(storage)
    }

    pub fn memory() -> Self {
        Self::Memory(RwLock::new(HashMap::new()))
    }

    /// Last write wins: a newer connection for the same user replaces the
    /// previous descriptor unconditionally.
    pub async fn register(&self, descriptor: &ConnectionDescriptor, ttl_seconds: i64) {
        match self {
            Self::Shared(storage) => {
                if let Err(err) = storage.publish_presence(descriptor, ttl_seconds).await {
                    warn!(user = %descriptor.user_id, "presence publish failed: {}", err);
                }
            }
            Self::Memory(map) => {
                map.write().await.insert(
                    descriptor.user_id.clone(),
                    MemoryPresence {
                        descriptor: descriptor.clone(),
                        expires_at: Utc::now() + Duration::seconds(ttl_seconds),
                    },
                );
            }
        }
    }

    pub async fn resolve(&self, user_id: &str) -> Option<ConnectionDescriptor> {
        match self {
            Self::Shared(storage) => match storage.read_presence(user_id).await {
                Ok(found) => found,
                Err(err) => {
                    warn!(user = %user_id, "presence lookup degraded to offline: {}", err);
                    None
                }
            },
            Self::Memory(map) => {
                let mut map = map.write().await;
                match map.get(user_id) {
                    Some(entry) if entry.expires_at > Utc::now() => {
                        Some(entry.descriptor.clone())
                    }
                    Some(_) => {
                        map.remove(user_id);
                        None
                    }
                    None => None,
                }
            }
        }
    }

    /// Batched lookup; the result aligns index-for-index with `user_ids`.
    pub async fn resolve_many(&self, user_ids: &[String]) -> Vec<Option<ConnectionDescriptor>> {
        match self {
            Self::Shared(storage) => match storage.read_presence_many(user_ids).await {
                Ok(found) => found,
                Err(err) => {
                    warn!("batched presence lookup degraded to offline: {}", err);
                    vec![None; user_ids.len()]
                }
            },
            Self::Memory(_) => {
                let mut out = Vec::with_capacity(user_ids.len());
                for user_id in user_ids {
                    out.push(self.resolve(user_id).await);
                }
                out
            }
        }
    }

    /// Removes the presence entry only while it still belongs to
    /// `connection_id`. A stale disconnect never evicts a newer connection.
    pub async fn unregister(&self, user_id: &str, connection_id: &str) -> bool {
        match self {
            Self::Shared(storage) => match storage.clear_presence(user_id, connection_id).await {
                Ok(removed) => removed,
                Err(err) => {
                    warn!(user = %user_id, "presence clear failed: {}", err);
                    false
                }
            },
            Self::Memory(map) => {
                let mut map = map.write().await;
                match map.get(user_id) {
                    Some(entry) if entry.descriptor.connection_id == connection_id => {
                        map.remove(user_id);
                        true
                    }
                    _ => false,
                }
            }
        }
    }

    pub async fn list_all(&self) -> HashMap<String, ConnectionDescriptor> {
        match self {
            Self::Shared(storage) => match storage.list_presence().await {
                Ok(found) => found,
                Err(err) => {
                    warn!("presence enumeration failed: {}", err);
                    HashMap::new()
                }
            },
            Self::Memory(map) => {
                let now = Utc::now();
                let mut map = map.write().await;
                map.retain(|_, entry| entry.expires_at > now);
                map.iter()
                    .map(|(user_id, entry)| (user_id.clone(), entry.descriptor.clone()))
                    .collect()
            }
        }
    }
}
