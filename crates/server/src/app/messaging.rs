use crate::app::{App, ServerError};
use crate::util::generate_id;
use chrono::Utc;
use serde_json::Value;
use skylark_proto::{
    EventKind, MessageDeletedPayload, MessageReactionPayload, MessagesSeenPayload,
    NewMessagePayload, UnreadCountPayload,
};
use skylark_storage::{
    ConversationRecord, ConversationSummary, MessageRecord, NewMessage, ReactionRecord,
};
use tracing::{debug, warn};

const MAX_MESSAGE_PAGE: usize = 100;
const MAX_CONVERSATION_PAGE: i64 = 200;

pub struct MediaUpload {
    pub name: String,
    pub bytes: Vec<u8>,
}

pub struct MessagePage {
    pub messages: Vec<MessageRecord>,
    pub has_more: bool,
}

/// Turns a newest-first overfetch (`limit + 1` rows) into a chronological
/// page plus a continuation flag.
pub(crate) fn page_from_rows(mut rows: Vec<MessageRecord>, limit: usize) -> MessagePage {
    let has_more = rows.len() > limit;
    rows.truncate(limit);
    rows.reverse();
    MessagePage {
        messages: rows,
        has_more,
    }
}

impl App {
    /// Sends a direct message. The attachment is stored first so the message
    /// row never references a blob that failed to land; the conversation is
    /// created on the fly when this is the pair's first exchange.
    pub async fn send_message(
        &self,
        sender_id: &str,
        recipient_id: &str,
        text: &str,
        media: Option<MediaUpload>,
        reply_to_id: Option<&str>,
    ) -> Result<MessageRecord, ServerError> {
        if sender_id == recipient_id {
            return Err(ServerError::Invalid);
        }
        if text.is_empty() && media.is_none() {
            return Err(ServerError::Invalid);
        }
        let media_url = match media {
            Some(upload) => Some(self.state.media.store(&upload.name, &upload.bytes).await?),
            None => None,
        };
        let conversation = self
            .state
            .storage
            .find_or_create_conversation(&generate_id("conversation"), sender_id, recipient_id)
            .await?;
        if let Some(reply_id) = reply_to_id {
            let parent = self.state.storage.load_message(reply_id).await?;
            if parent.conversation_id != conversation.conversation_id {
                return Err(ServerError::Invalid);
            }
        }
        let message = NewMessage {
            message_id: generate_id("message"),
            conversation_id: conversation.conversation_id.clone(),
            sender_id: sender_id.to_string(),
            text: text.to_string(),
            media_url,
            reply_to_id: reply_to_id.map(str::to_string),
            created_at: Utc::now(),
        };
        self.state.storage.insert_message(&message).await?;
        let record = MessageRecord {
            message_id: message.message_id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            text: message.text,
            media_url: message.media_url,
            reply_to_id: message.reply_to_id,
            seen: false,
            reactions: Vec::new(),
            created_at: message.created_at,
        };
        self.state.metrics.mark_message_sent();

        let payload = NewMessagePayload {
            message: serde_json::to_value(&record).map_err(|_| ServerError::Invalid)?,
            conversation_updated_at: record.created_at,
        };
        let encoded = serde_json::to_value(&payload).map_err(|_| ServerError::Invalid)?;
        let delivered = self
            .state
            .router
            .deliver(recipient_id, EventKind::NewMessage, encoded.clone())
            .await;
        debug!(message = %record.message_id, delivered, "new message routed");
        self.push_unread_count(recipient_id).await;
        self.state
            .notifier
            .push(recipient_id, EventKind::NewMessage.as_str(), &encoded);
        Ok(record)
    }

    /// Chronological page of messages ending just before `before` (exclusive),
    /// or the newest page when no anchor is given.
    pub async fn get_messages(
        &self,
        conversation_id: &str,
        limit: usize,
        before: Option<&str>,
    ) -> Result<MessagePage, ServerError> {
        let limit = limit.clamp(1, MAX_MESSAGE_PAGE);
        self.state.storage.load_conversation(conversation_id).await?;
        let rows = self
            .state
            .storage
            .list_messages(conversation_id, (limit + 1) as i64, before)
            .await?;
        Ok(page_from_rows(rows, limit))
    }

    pub async fn get_conversations(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<ConversationSummary>, ServerError> {
        let limit = limit.clamp(1, MAX_CONVERSATION_PAGE);
        Ok(self.state.storage.list_conversations(user_id, limit).await?)
    }

    /// Deletes a message on behalf of any participant of its conversation,
    /// not only the author. Both sides learn about it if they are online.
    pub async fn delete_message(
        &self,
        message_id: &str,
        requester_id: &str,
    ) -> Result<(), ServerError> {
        let message = self.state.storage.load_message(message_id).await?;
        let conversation = self
            .state
            .storage
            .load_conversation(&message.conversation_id)
            .await?;
        if !conversation.is_participant(requester_id) {
            return Err(ServerError::Unauthorized);
        }
        self.state.storage.delete_message(message_id).await?;
        self.state.metrics.mark_message_deleted();
        if let Some(url) = &message.media_url {
            if let Err(err) = self.state.media.remove(url).await {
                warn!(message = %message_id, "media cleanup failed: {}", err);
            }
        }
        let payload = serde_json::to_value(MessageDeletedPayload {
            conversation_id: conversation.conversation_id.clone(),
            message_id: message_id.to_string(),
        })
        .map_err(|_| ServerError::Invalid)?;
        self.deliver_to_participants(&conversation, EventKind::MessageDeleted, payload)
            .await;
        Ok(())
    }

    /// Toggles the requester's reaction and fans the fresh reaction list out
    /// to both participants.
    pub async fn toggle_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<Vec<ReactionRecord>, ServerError> {
        if emoji.is_empty() {
            return Err(ServerError::Invalid);
        }
        let message = self.state.storage.load_message(message_id).await?;
        let conversation = self
            .state
            .storage
            .load_conversation(&message.conversation_id)
            .await?;
        if !conversation.is_participant(user_id) {
            return Err(ServerError::Unauthorized);
        }
        let reactions = self
            .state
            .storage
            .toggle_reaction(message_id, user_id, emoji)
            .await?;
        let payload = serde_json::to_value(MessageReactionPayload {
            conversation_id: conversation.conversation_id.clone(),
            message_id: message_id.to_string(),
            reactions: serde_json::to_value(&reactions).map_err(|_| ServerError::Invalid)?,
        })
        .map_err(|_| ServerError::Invalid)?;
        self.deliver_to_participants(&conversation, EventKind::MessageReactionUpdated, payload)
            .await;
        Ok(reactions)
    }

    /// Marks everything the peer sent in this conversation as seen. Returns
    /// the number of rows flipped; zero means there was nothing to do and no
    /// events go out.
    pub async fn mark_seen(
        &self,
        conversation_id: &str,
        reader_id: &str,
    ) -> Result<u64, ServerError> {
        let conversation = self.state.storage.load_conversation(conversation_id).await?;
        if !conversation.is_participant(reader_id) {
            return Err(ServerError::Unauthorized);
        }
        let flipped = self
            .state
            .storage
            .mark_seen(conversation_id, reader_id)
            .await?;
        if flipped > 0 {
            let payload = serde_json::to_value(MessagesSeenPayload {
                conversation_id: conversation_id.to_string(),
                seen_by: reader_id.to_string(),
            })
            .map_err(|_| ServerError::Invalid)?;
            self.state
                .router
                .deliver(conversation.peer_of(reader_id), EventKind::MessagesSeen, payload)
                .await;
            self.push_unread_count(reader_id).await;
        }
        Ok(flipped)
    }

    pub async fn get_total_unread(&self, user_id: &str) -> Result<i64, ServerError> {
        Ok(self.state.storage.total_unread(user_id).await?)
    }

    /// Recomputes and pushes the global unread counter. Best effort: the
    /// badge self-heals on the next recompute if this one is lost.
    pub(crate) async fn push_unread_count(&self, user_id: &str) {
        match self.state.storage.total_unread(user_id).await {
            Ok(total_unread) => {
                let payload = serde_json::to_value(UnreadCountPayload { total_unread })
                    .unwrap_or(Value::Null);
                self.state
                    .router
                    .deliver(user_id, EventKind::UnreadCountUpdate, payload)
                    .await;
            }
            Err(err) => warn!(user = %user_id, "unread recompute failed: {}", err),
        }
    }

    async fn deliver_to_participants(
        &self,
        conversation: &ConversationRecord,
        event: EventKind,
        payload: Value,
    ) {
        self.state
            .router
            .deliver(&conversation.participant_low, event, payload.clone())
            .await;
        self.state
            .router
            .deliver(&conversation.participant_high, event, payload)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::call::CallStore;
    use crate::app::delivery::Router;
    use crate::app::media::MediaStore;
    use crate::app::notify::NoopNotifier;
    use crate::app::presence::PresenceStore;
    use crate::app::AppState;
    use crate::config::{PresenceMode, ServerConfig};
    use crate::metrics::Metrics;
    use chrono::Duration;
    use skylark_storage::{connect, StorageError};
    use std::sync::Arc;

    fn rows_newest_first(count: i64) -> Vec<MessageRecord> {
        let base = Utc::now();
        (0..count)
            .rev()
            .map(|index| MessageRecord {
                message_id: format!("msg-{:02}", index),
                conversation_id: "conversation-1".to_string(),
                sender_id: "alice".to_string(),
                text: format!("hello {}", index),
                media_url: None,
                reply_to_id: None,
                seen: false,
                reactions: Vec::new(),
                created_at: base + Duration::milliseconds(index),
            })
            .collect()
    }

    #[test]
    fn overfetched_page_signals_more() {
        let page = page_from_rows(rows_newest_first(13), 12);
        assert!(page.has_more);
        assert_eq!(page.messages.len(), 12);
        assert_eq!(page.messages.first().unwrap().message_id, "msg-01");
        assert_eq!(page.messages.last().unwrap().message_id, "msg-12");
        for pair in page.messages.windows(2) {
            assert!(pair[0].created_at < pair[1].created_at);
        }
    }

    #[test]
    fn exact_page_has_no_more() {
        let page = page_from_rows(rows_newest_first(5), 12);
        assert!(!page.has_more);
        assert_eq!(page.messages.len(), 5);
        assert_eq!(page.messages.first().unwrap().message_id, "msg-00");
    }

    #[test]
    fn empty_history_pages_cleanly() {
        let page = page_from_rows(Vec::new(), 12);
        assert!(!page.has_more);
        assert!(page.messages.is_empty());
    }

    #[tokio::test]
    async fn outsider_cannot_delete_messages() -> Result<(), Box<dyn std::error::Error>> {
        let pg = match std::env::var("SKYLARK_TEST_PG_DSN") {
            Ok(value) => value,
            Err(_) => {
                eprintln!("skipping outsider_cannot_delete_messages: SKYLARK_TEST_PG_DSN not set");
                return Ok(());
            }
        };
        let redis_url = match std::env::var("SKYLARK_TEST_REDIS_URL") {
            Ok(value) => value,
            Err(_) => {
                eprintln!(
                    "skipping outsider_cannot_delete_messages: SKYLARK_TEST_REDIS_URL not set"
                );
                return Ok(());
            }
        };
        let storage = Arc::new(connect(&pg, &redis_url).await?);
        storage.migrate().await?;
        let config = ServerConfig {
            node_id: Some("node-test".to_string()),
            postgres_dsn: pg,
            redis_url,
            presence_mode: PresenceMode::Memory,
            presence_ttl_seconds: 45,
            active_call_ttl_seconds: 3_600,
            pending_call_ttl_seconds: 300,
            fanout_limit: 64,
            notification_cap: 100,
            notification_horizon_days: 30,
            media_root: None,
            push_webhook: None,
        };
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(PresenceStore::memory());
        let router = Arc::new(Router::new(
            "node-test".to_string(),
            Arc::clone(&registry),
            None,
            Arc::clone(&metrics),
            config.fanout_limit,
        ));
        let app = App::new(Arc::new(AppState {
            config,
            storage,
            metrics,
            registry,
            calls: CallStore::memory(),
            router,
            notifier: Box::new(NoopNotifier),
            media: MediaStore::memory(),
            node_id: "node-test".to_string(),
        }));

        let suffix = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let alice = format!("alice-{}", suffix);
        let bob = format!("bob-{}", suffix);
        let mallory = format!("mallory-{}", suffix);
        let record = app.send_message(&alice, &bob, "for your eyes", None, None).await?;

        let rejected = app.delete_message(&record.message_id, &mallory).await;
        assert!(matches!(rejected, Err(ServerError::Unauthorized)));
        // The message survives the rejected attempt untouched.
        let survivor = app.state.storage.load_message(&record.message_id).await?;
        assert_eq!(survivor.text, "for your eyes");

        // Either participant may delete, not only the author.
        app.delete_message(&record.message_id, &bob).await?;
        assert!(matches!(
            app.state.storage.load_message(&record.message_id).await,
            Err(StorageError::Missing)
        ));
        Ok(())
    }
}
