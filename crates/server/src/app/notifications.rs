use crate::app::{App, ServerError};
use crate::util::generate_id;
use chrono::Utc;
use serde_json::Value;
use skylark_proto::{ActivityPayload, EventKind};
use skylark_storage::NotificationRecord;
use tracing::warn;

impl App {
    /// Persists an activity item for one user, then pushes it live. History
    /// stays capped per user; the oldest rows roll off on insert.
    pub async fn record_activity(
        &self,
        user_id: &str,
        kind: &str,
        actor_id: &str,
        payload: Value,
    ) -> Result<NotificationRecord, ServerError> {
        if kind.is_empty() {
            return Err(ServerError::Invalid);
        }
        let event = ActivityPayload {
            kind: kind.to_string(),
            actor_id: actor_id.to_string(),
            payload,
        };
        let record = NotificationRecord {
            notification_id: generate_id("notification"),
            user_id: user_id.to_string(),
            kind: kind.to_string(),
            payload: serde_json::to_value(&event).map_err(|_| ServerError::Invalid)?,
            created_at: Utc::now(),
        };
        self.state
            .storage
            .record_notification(&record, self.state.config.notification_cap)
            .await?;
        self.state.metrics.mark_notification_recorded();
        self.state
            .router
            .deliver(user_id, EventKind::Activity, record.payload.clone())
            .await;
        self.state
            .notifier
            .push(user_id, EventKind::Activity.as_str(), &record.payload);
        Ok(record)
    }

    pub async fn list_activity(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<NotificationRecord>, ServerError> {
        let limit = limit.clamp(1, self.state.config.notification_cap.max(1));
        Ok(self.state.storage.list_notifications(user_id, limit).await?)
    }

    /// Records the same activity for a set of users and pushes to whoever is
    /// online. Persistence failures for individual targets are logged and do
    /// not stop the rest of the batch.
    pub async fn broadcast_activity(
        &self,
        targets: &[String],
        kind: &str,
        actor_id: &str,
        payload: Value,
    ) -> Result<usize, ServerError> {
        if kind.is_empty() {
            return Err(ServerError::Invalid);
        }
        let event = ActivityPayload {
            kind: kind.to_string(),
            actor_id: actor_id.to_string(),
            payload,
        };
        let encoded = serde_json::to_value(&event).map_err(|_| ServerError::Invalid)?;
        for user_id in targets {
            let record = NotificationRecord {
                notification_id: generate_id("notification"),
                user_id: user_id.clone(),
                kind: kind.to_string(),
                payload: encoded.clone(),
                created_at: Utc::now(),
            };
            match self
                .state
                .storage
                .record_notification(&record, self.state.config.notification_cap)
                .await
            {
                Ok(()) => self.state.metrics.mark_notification_recorded(),
                Err(err) => warn!(user = %user_id, "activity persist failed: {}", err),
            }
        }
        let delivered = self
            .state
            .router
            .deliver_many(targets, EventKind::Activity, encoded)
            .await;
        Ok(delivered)
    }
}
