use chrono::{DateTime, Duration, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls};

const INIT_SQL: &str = include_str!("../migrations/001_init.sql");

const PRESENCE_PREFIX: &str = "presence:";
const ACTIVE_CALL_PREFIX: &str = "activeCall:";
const PENDING_CALL_PREFIX: &str = "pendingCall:";
const DELIVERY_PREFIX: &str = "deliver:";
const SCAN_BATCH: usize = 512;

// Deletes the presence key only when the stored descriptor still belongs to
// the connection being torn down, so a stale disconnect cannot clobber a
// newer registration.
const PRESENCE_CLEAR_SCRIPT: &str = r#"local value = redis.call('GET', KEYS[1])
if not value then return 0 end
local parsed = cjson.decode(value)
if parsed['connection_id'] == ARGV[1] then return redis.call('DEL', KEYS[1]) end
return 0"#;

#[derive(Debug)]
pub enum StorageError {
    Postgres,
    Redis,
    Serialization,
    Missing,
    Invalid,
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres failure"),
            Self::Redis => write!(f, "redis failure"),
            Self::Serialization => write!(f, "serialization failure"),
            Self::Missing => write!(f, "missing record"),
            Self::Invalid => write!(f, "invalid state"),
        }
    }
}

impl Error for StorageError {}

pub struct Storage {
    client: Client,
    _pg_task: JoinHandle<()>,
    redis: Arc<Mutex<redis::aio::MultiplexedConnection>>,
    redis_client: redis::Client,
}

/// Live-connection descriptor shared across server processes. One entry per
/// user; a reconnect overwrites the previous descriptor (last write wins).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub user_id: String,
    pub connection_id: String,
    pub node_id: String,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub call_id: String,
    pub caller_id: String,
    pub callee_id: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub conversation_id: String,
    pub participant_low: String,
    pub participant_high: String,
    pub last_message_text: Option<String>,
    pub last_message_sender: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationRecord {
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.participant_low == user_id || self.participant_high == user_id
    }

    pub fn peer_of(&self, user_id: &str) -> &str {
        if self.participant_low == user_id {
            self.participant_high.as_str()
        } else {
            self.participant_low.as_str()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: ConversationRecord,
    pub unread: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub message_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub text: String,
    pub media_url: Option<String>,
    pub reply_to_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub message_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub text: String,
    pub media_url: Option<String>,
    pub reply_to_id: Option<String>,
    pub seen: bool,
    pub reactions: Vec<ReactionRecord>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionRecord {
    pub user_id: String,
    pub emoji: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub notification_id: String,
    pub user_id: String,
    pub kind: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Normalizes a participant pair to its sorted form. Conversation rows and
/// call keys are both addressed by the unordered pair, so either argument
/// order resolves to the same storage key.
pub fn ordered_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b { (a, b) } else { (b, a) }
}

fn presence_key(user_id: &str) -> String {
    format!("{}{}", PRESENCE_PREFIX, user_id)
}

fn active_call_key(call_id: &str) -> String {
    format!("{}{}", ACTIVE_CALL_PREFIX, call_id)
}

fn pending_call_key(callee_id: &str) -> String {
    format!("{}{}", PENDING_CALL_PREFIX, callee_id)
}

fn delivery_channel(node_id: &str) -> String {
    format!("{}{}", DELIVERY_PREFIX, node_id)
}

/// Establishes connectivity to PostgreSQL and Redis backends.
pub async fn connect(postgres_dsn: &str, redis_url: &str) -> Result<Storage, StorageError> {
    let (client, connection) = tokio_postgres::connect(postgres_dsn, NoTls)
        .await
        .map_err(|_| StorageError::Postgres)?;
    let task = tokio::spawn(async move {
        if let Err(error) = connection.await {
            tracing::error!("postgres connection stopped: {}", error);
        }
    });
    let redis_client = redis::Client::open(redis_url).map_err(|_| StorageError::Redis)?;
    let redis_connection = redis_client
        .get_multiplexed_async_connection()
        .await
        .map_err(|_| StorageError::Redis)?;
    Ok(Storage {
        client,
        _pg_task: task,
        redis: Arc::new(Mutex::new(redis_connection)),
        redis_client,
    })
}

impl Storage {
    /// Applies bundled migrations to PostgreSQL.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        self.client
            .batch_execute(INIT_SQL)
            .await
            .map_err(|_| StorageError::Postgres)
    }

    /// Executes lightweight probes across PostgreSQL and Redis.
    pub async fn readiness(&self) -> Result<(), StorageError> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map_err(|_| StorageError::Postgres)?;
        let mut conn = self.redis.lock().await;
        let _: String = redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(())
    }

    /// Finds the conversation for an unordered participant pair, creating it
    /// when absent. Safe under concurrent first messages: the uniqueness
    /// constraint on the sorted pair collapses duplicate creates to one row.
    pub async fn find_or_create_conversation(
        &self,
        candidate_id: &str,
        a: &str,
        b: &str,
    ) -> Result<ConversationRecord, StorageError> {
        if a == b {
            return Err(StorageError::Invalid);
        }
        let (low, high) = ordered_pair(a, b);
        let now = Utc::now();
        let inserted = self
            .client
            .query_opt(
                "INSERT INTO conversation (conversation_id, participant_low, participant_high, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $4)
                ON CONFLICT (participant_low, participant_high) DO NOTHING
                RETURNING conversation_id, participant_low, participant_high, last_message_text, last_message_sender, created_at, updated_at",
                &[&candidate_id, &low, &high, &now],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        let row = match inserted {
            Some(row) => row,
            None => self
                .client
                .query_opt(
                    "SELECT conversation_id, participant_low, participant_high, last_message_text, last_message_sender, created_at, updated_at
                    FROM conversation WHERE participant_low = $1 AND participant_high = $2",
                    &[&low, &high],
                )
                .await
                .map_err(|_| StorageError::Postgres)?
                .ok_or(StorageError::Missing)?,
        };
        Ok(conversation_from_row(&row))
    }

    /// Loads conversation metadata by identifier.
    pub async fn load_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<ConversationRecord, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT conversation_id, participant_low, participant_high, last_message_text, last_message_sender, created_at, updated_at
                FROM conversation WHERE conversation_id = $1",
                &[&conversation_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        let row = row.ok_or(StorageError::Missing)?;
        Ok(conversation_from_row(&row))
    }

    /// Lists a user's conversations sorted by last activity, with the unread
    /// count the client shows per entry.
    pub async fn list_conversations(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<ConversationSummary>, StorageError> {
        let rows = self
            .client
            .query(
                "SELECT c.conversation_id, c.participant_low, c.participant_high, c.last_message_text, c.last_message_sender, c.created_at, c.updated_at,
                    (SELECT COUNT(*) FROM message m WHERE m.conversation_id = c.conversation_id AND m.sender_id <> $1 AND NOT m.seen) AS unread
                FROM conversation c
                WHERE c.participant_low = $1 OR c.participant_high = $1
                ORDER BY c.updated_at DESC
                LIMIT $2",
                &[&user_id, &limit],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows
            .into_iter()
            .map(|row| ConversationSummary {
                conversation: conversation_from_row(&row),
                unread: row.get(7),
            })
            .collect())
    }

    /// Inserts a message and refreshes the owning conversation summary as one
    /// statement. The summary can therefore never reference a message that
    /// was not persisted.
    pub async fn insert_message(&self, message: &NewMessage) -> Result<(), StorageError> {
        let affected = self
            .client
            .execute(
                "WITH inserted AS (
                    INSERT INTO message (message_id, conversation_id, sender_id, body, media_url, reply_to_id, seen, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6, FALSE, $7)
                    RETURNING message_id
                )
                UPDATE conversation
                SET last_message_text = $4, last_message_sender = $3, updated_at = $7
                WHERE conversation_id = $2 AND EXISTS (SELECT 1 FROM inserted)",
                &[
                    &message.message_id,
                    &message.conversation_id,
                    &message.sender_id,
                    &message.text,
                    &message.media_url,
                    &message.reply_to_id,
                    &message.created_at,
                ],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        if affected == 0 {
            return Err(StorageError::Missing);
        }
        Ok(())
    }

    /// Loads a message with its reactions.
    pub async fn load_message(&self, message_id: &str) -> Result<MessageRecord, StorageError> {
        let row = self
            .client
            .query_opt(
                "SELECT message_id, conversation_id, sender_id, body, media_url, reply_to_id, seen, created_at
                FROM message WHERE message_id = $1",
                &[&message_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        let row = row.ok_or(StorageError::Missing)?;
        let mut record = message_from_row(&row);
        record.reactions = self.list_reactions(message_id).await?;
        Ok(record)
    }

    /// Fetches one reverse-chronological page. `fetch` is the page size plus
    /// one (the caller derives `has_more` from the overflow row). `before`
    /// resolves to that message's position and filters strictly older rows.
    pub async fn list_messages(
        &self,
        conversation_id: &str,
        fetch: i64,
        before: Option<&str>,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let rows = match before {
            Some(anchor_id) => {
                let anchor = self
                    .client
                    .query_opt(
                        "SELECT created_at FROM message WHERE message_id = $1 AND conversation_id = $2",
                        &[&anchor_id, &conversation_id],
                    )
                    .await
                    .map_err(|_| StorageError::Postgres)?
                    .ok_or(StorageError::Missing)?;
                let anchor_at: DateTime<Utc> = anchor.get(0);
                self.client
                    .query(
                        "SELECT message_id, conversation_id, sender_id, body, media_url, reply_to_id, seen, created_at
                        FROM message
                        WHERE conversation_id = $1 AND (created_at, message_id) < ($2::timestamptz, $3::text)
                        ORDER BY created_at DESC, message_id DESC
                        LIMIT $4",
                        &[&conversation_id, &anchor_at, &anchor_id, &fetch],
                    )
                    .await
                    .map_err(|_| StorageError::Postgres)?
            }
            None => self
                .client
                .query(
                    "SELECT message_id, conversation_id, sender_id, body, media_url, reply_to_id, seen, created_at
                    FROM message
                    WHERE conversation_id = $1
                    ORDER BY created_at DESC, message_id DESC
                    LIMIT $2",
                    &[&conversation_id, &fetch],
                )
                .await
                .map_err(|_| StorageError::Postgres)?,
        };
        let mut messages: Vec<MessageRecord> = rows.iter().map(message_from_row).collect();
        let ids: Vec<String> = messages
            .iter()
            .map(|message| message.message_id.clone())
            .collect();
        if !ids.is_empty() {
            let mut grouped = self.reactions_for(&ids).await?;
            for message in messages.iter_mut() {
                if let Some(reactions) = grouped.remove(&message.message_id) {
                    message.reactions = reactions;
                }
            }
        }
        Ok(messages)
    }

    /// Deletes a message. Reactions cascade with the row.
    pub async fn delete_message(&self, message_id: &str) -> Result<(), StorageError> {
        let affected = self
            .client
            .execute("DELETE FROM message WHERE message_id = $1", &[&message_id])
            .await
            .map_err(|_| StorageError::Postgres)?;
        if affected == 0 {
            return Err(StorageError::Missing);
        }
        Ok(())
    }

    /// Toggles a user's reaction on a message. Each branch is a single-row
    /// atomic statement: same emoji removes it, a different emoji replaces it
    /// in place, no prior reaction adds one. Concurrent reactions from
    /// different users touch different rows and cannot lose updates.
    pub async fn toggle_reaction(
        &self,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<Vec<ReactionRecord>, StorageError> {
        let removed = self
            .client
            .execute(
                "DELETE FROM message_reaction WHERE message_id = $1 AND user_id = $2 AND emoji = $3",
                &[&message_id, &user_id, &emoji],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        if removed == 0 {
            self.client
                .execute(
                    "INSERT INTO message_reaction (message_id, user_id, emoji) VALUES ($1, $2, $3)
                    ON CONFLICT (message_id, user_id) DO UPDATE SET emoji = excluded.emoji",
                    &[&message_id, &user_id, &emoji],
                )
                .await
                .map_err(|_| StorageError::Postgres)?;
        }
        self.list_reactions(message_id).await
    }

    /// Lists reactions on a message.
    pub async fn list_reactions(
        &self,
        message_id: &str,
    ) -> Result<Vec<ReactionRecord>, StorageError> {
        let rows = self
            .client
            .query(
                "SELECT user_id, emoji FROM message_reaction WHERE message_id = $1 ORDER BY user_id ASC",
                &[&message_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows
            .into_iter()
            .map(|row| ReactionRecord {
                user_id: row.get(0),
                emoji: row.get(1),
            })
            .collect())
    }

    async fn reactions_for(
        &self,
        message_ids: &[String],
    ) -> Result<HashMap<String, Vec<ReactionRecord>>, StorageError> {
        let rows = self
            .client
            .query(
                "SELECT message_id, user_id, emoji FROM message_reaction WHERE message_id = ANY($1)",
                &[&message_ids],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        let mut grouped: HashMap<String, Vec<ReactionRecord>> = HashMap::new();
        for row in rows {
            let message_id: String = row.get(0);
            grouped.entry(message_id).or_default().push(ReactionRecord {
                user_id: row.get(1),
                emoji: row.get(2),
            });
        }
        Ok(grouped)
    }

    /// Marks every message addressed to the reader in a conversation as seen.
    /// A single atomic update; returns the number of rows flipped.
    pub async fn mark_seen(
        &self,
        conversation_id: &str,
        reader_id: &str,
    ) -> Result<u64, StorageError> {
        self.client
            .execute(
                "UPDATE message SET seen = TRUE WHERE conversation_id = $1 AND sender_id <> $2 AND NOT seen",
                &[&conversation_id, &reader_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)
    }

    /// Counts unseen messages addressed to a user across all conversations.
    /// The authoritative number; pushed unread updates are a convenience copy.
    pub async fn total_unread(&self, user_id: &str) -> Result<i64, StorageError> {
        let row = self
            .client
            .query_one(
                "SELECT COUNT(*) FROM message m
                JOIN conversation c ON c.conversation_id = m.conversation_id
                WHERE (c.participant_low = $1 OR c.participant_high = $1)
                  AND m.sender_id <> $1 AND NOT m.seen",
                &[&user_id],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(row.get(0))
    }

    /// Appends a notification and prunes the user's overflow beyond `cap`,
    /// keeping per-user history a bounded ring.
    pub async fn record_notification(
        &self,
        record: &NotificationRecord,
        cap: i64,
    ) -> Result<(), StorageError> {
        self.client
            .execute(
                "INSERT INTO notification (notification_id, user_id, kind, payload, created_at)
                VALUES ($1, $2, $3, $4, $5)",
                &[
                    &record.notification_id,
                    &record.user_id,
                    &record.kind,
                    &record.payload,
                    &record.created_at,
                ],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        self.client
            .execute(
                "DELETE FROM notification WHERE user_id = $1 AND notification_id NOT IN (
                    SELECT notification_id FROM notification WHERE user_id = $1
                    ORDER BY created_at DESC LIMIT $2
                )",
                &[&record.user_id, &cap],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Sweeps notifications older than the retention horizon.
    pub async fn prune_notifications(&self, horizon: Duration) -> Result<u64, StorageError> {
        let cutoff = Utc::now() - horizon;
        self.client
            .execute("DELETE FROM notification WHERE created_at < $1", &[&cutoff])
            .await
            .map_err(|_| StorageError::Postgres)
    }

    /// Lists a user's newest notifications.
    pub async fn list_notifications(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<NotificationRecord>, StorageError> {
        let rows = self
            .client
            .query(
                "SELECT notification_id, user_id, kind, payload, created_at
                FROM notification WHERE user_id = $1
                ORDER BY created_at DESC LIMIT $2",
                &[&user_id, &limit],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows
            .into_iter()
            .map(|row| NotificationRecord {
                notification_id: row.get(0),
                user_id: row.get(1),
                kind: row.get(2),
                payload: row.get(3),
                created_at: row.get(4),
            })
            .collect())
    }

    /// Upserts the best-effort "in call" flag for a user.
    pub async fn set_in_call(&self, user_id: &str, in_call: bool) -> Result<(), StorageError> {
        let now = Utc::now();
        self.client
            .execute(
                "INSERT INTO app_user_flag (user_id, in_call, updated_at) VALUES ($1, $2, $3)
                ON CONFLICT (user_id) DO UPDATE SET in_call = excluded.in_call, updated_at = excluded.updated_at",
                &[&user_id, &in_call, &now],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Publishes a connection descriptor into Redis, unconditionally
    /// replacing any previous registration for the user.
    pub async fn publish_presence(
        &self,
        descriptor: &ConnectionDescriptor,
        ttl_seconds: i64,
    ) -> Result<(), StorageError> {
        let payload =
            serde_json::to_string(descriptor).map_err(|_| StorageError::Serialization)?;
        let mut conn = self.redis.lock().await;
        redis::cmd("SETEX")
            .arg(presence_key(&descriptor.user_id))
            .arg(ttl_seconds.max(1) as usize)
            .arg(payload)
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(())
    }

    /// Reads a user's presence descriptor from Redis.
    pub async fn read_presence(
        &self,
        user_id: &str,
    ) -> Result<Option<ConnectionDescriptor>, StorageError> {
        let mut conn = self.redis.lock().await;
        let value: Option<String> = redis::cmd("GET")
            .arg(presence_key(user_id))
            .query_async::<Option<String>>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        match value {
            Some(json) => {
                let descriptor =
                    serde_json::from_str(&json).map_err(|_| StorageError::Serialization)?;
                Ok(Some(descriptor))
            }
            None => Ok(None),
        }
    }

    /// Resolves many users in one batched MGET; positions align with input.
    pub async fn read_presence_many(
        &self,
        user_ids: &[String],
    ) -> Result<Vec<Option<ConnectionDescriptor>>, StorageError> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = user_ids.iter().map(|id| presence_key(id)).collect();
        let mut conn = self.redis.lock().await;
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async::<Vec<Option<String>>>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(values
            .into_iter()
            .map(|value| value.and_then(|json| serde_json::from_str(&json).ok()))
            .collect())
    }

    /// Conditionally removes a presence entry: the delete only happens when
    /// the stored connection id matches the one being unregistered.
    pub async fn clear_presence(
        &self,
        user_id: &str,
        connection_id: &str,
    ) -> Result<bool, StorageError> {
        let mut conn = self.redis.lock().await;
        let removed: i64 = redis::cmd("EVAL")
            .arg(PRESENCE_CLEAR_SCRIPT)
            .arg(1)
            .arg(presence_key(user_id))
            .arg(connection_id)
            .query_async::<i64>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(removed > 0)
    }

    /// Enumerates every registered descriptor, batched through SCAN so large
    /// deployments never block Redis the way KEYS would.
    pub async fn list_presence(
        &self,
    ) -> Result<HashMap<String, ConnectionDescriptor>, StorageError> {
        let mut conn = self.redis.lock().await;
        let mut entries = HashMap::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(format!("{}*", PRESENCE_PREFIX))
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async::<(u64, Vec<String>)>(&mut *conn)
                .await
                .map_err(|_| StorageError::Redis)?;
            if !keys.is_empty() {
                let values: Vec<Option<String>> = redis::cmd("MGET")
                    .arg(&keys)
                    .query_async::<Vec<Option<String>>>(&mut *conn)
                    .await
                    .map_err(|_| StorageError::Redis)?;
                for value in values.into_iter().flatten() {
                    if let Ok(descriptor) =
                        serde_json::from_str::<ConnectionDescriptor>(&value)
                    {
                        entries.insert(descriptor.user_id.clone(), descriptor);
                    }
                }
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(entries)
    }

    /// Stores an active call with a bounded lifetime so a crashed client can
    /// never wedge call state permanently.
    pub async fn put_active_call(
        &self,
        record: &CallRecord,
        ttl_seconds: i64,
    ) -> Result<(), StorageError> {
        self.put_call(&active_call_key(&record.call_id), record, ttl_seconds)
            .await
    }

    /// Reads an active call by its unordered-pair key.
    pub async fn read_active_call(
        &self,
        call_id: &str,
    ) -> Result<Option<CallRecord>, StorageError> {
        self.read_call(&active_call_key(call_id)).await
    }

    /// Deletes an active call entry; returns whether one existed.
    pub async fn delete_active_call(&self, call_id: &str) -> Result<bool, StorageError> {
        self.delete_call(&active_call_key(call_id)).await
    }

    /// Stores a "ring when the callee reconnects" intent.
    pub async fn put_pending_call(
        &self,
        record: &CallRecord,
        ttl_seconds: i64,
    ) -> Result<(), StorageError> {
        self.put_call(&pending_call_key(&record.callee_id), record, ttl_seconds)
            .await
    }

    /// Reads the pending call waiting on a callee, if any.
    pub async fn read_pending_call(
        &self,
        callee_id: &str,
    ) -> Result<Option<CallRecord>, StorageError> {
        self.read_call(&pending_call_key(callee_id)).await
    }

    /// Deletes a pending call entry; returns whether one existed.
    pub async fn delete_pending_call(&self, callee_id: &str) -> Result<bool, StorageError> {
        self.delete_call(&pending_call_key(callee_id)).await
    }

    async fn put_call(
        &self,
        key: &str,
        record: &CallRecord,
        ttl_seconds: i64,
    ) -> Result<(), StorageError> {
        let payload = serde_json::to_string(record).map_err(|_| StorageError::Serialization)?;
        let mut conn = self.redis.lock().await;
        redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_seconds.max(1) as usize)
            .arg(payload)
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(())
    }

    async fn read_call(&self, key: &str) -> Result<Option<CallRecord>, StorageError> {
        let mut conn = self.redis.lock().await;
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async::<Option<String>>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        match value {
            Some(json) => {
                let record =
                    serde_json::from_str(&json).map_err(|_| StorageError::Serialization)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn delete_call(&self, key: &str) -> Result<bool, StorageError> {
        let mut conn = self.redis.lock().await;
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async::<i64>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(removed > 0)
    }

    /// Publishes a routed delivery frame on another node's channel.
    pub async fn publish_delivery(
        &self,
        node_id: &str,
        payload: &[u8],
    ) -> Result<(), StorageError> {
        let mut conn = self.redis.lock().await;
        redis::cmd("PUBLISH")
            .arg(delivery_channel(node_id))
            .arg(payload)
            .query_async::<i64>(&mut *conn)
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(())
    }

    /// Opens the pub/sub subscription this node's dispatcher drains.
    pub async fn delivery_subscriber(
        &self,
        node_id: &str,
    ) -> Result<DeliverySubscription, StorageError> {
        let mut pubsub = self
            .redis_client
            .get_async_pubsub()
            .await
            .map_err(|_| StorageError::Redis)?;
        pubsub
            .subscribe(delivery_channel(node_id))
            .await
            .map_err(|_| StorageError::Redis)?;
        Ok(DeliverySubscription { pubsub })
    }
}

/// Wraps the Redis pub/sub stream so consumers stay driver-agnostic.
pub struct DeliverySubscription {
    pubsub: redis::aio::PubSub,
}

impl DeliverySubscription {
    /// Waits for the next routed delivery frame; `None` when the
    /// subscription connection has gone away.
    pub async fn next_payload(&mut self) -> Option<Vec<u8>> {
        let mut stream = self.pubsub.on_message();
        let message = stream.next().await?;
        message.get_payload::<Vec<u8>>().ok()
    }
}

fn conversation_from_row(row: &tokio_postgres::Row) -> ConversationRecord {
    ConversationRecord {
        conversation_id: row.get(0),
        participant_low: row.get(1),
        participant_high: row.get(2),
        last_message_text: row.get(3),
        last_message_sender: row.get(4),
        created_at: row.get(5),
        updated_at: row.get(6),
    }
}

fn message_from_row(row: &tokio_postgres::Row) -> MessageRecord {
    MessageRecord {
        message_id: row.get(0),
        conversation_id: row.get(1),
        sender_id: row.get(2),
        text: row.get(3),
        media_url: row.get(4),
        reply_to_id: row.get(5),
        seen: row.get(6),
        reactions: Vec::new(),
        created_at: row.get(7),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn init_sql_exists() {
        assert!(INIT_SQL.contains("CREATE TABLE"));
    }

    #[test]
    fn init_sql_declares_relations() {
        assert!(INIT_SQL.contains("conversation"));
        assert!(INIT_SQL.contains("message"));
        assert!(INIT_SQL.contains("message_reaction"));
        assert!(INIT_SQL.contains("notification"));
        assert!(INIT_SQL.contains("app_user_flag"));
    }

    #[test]
    fn init_sql_enforces_pair_uniqueness() {
        assert!(INIT_SQL.contains("UNIQUE (participant_low, participant_high)"));
        assert!(INIT_SQL.contains("CHECK (participant_low < participant_high)"));
    }

    #[test]
    fn ordered_pair_is_symmetric() {
        assert_eq!(ordered_pair("alice", "bob"), ("alice", "bob"));
        assert_eq!(ordered_pair("bob", "alice"), ("alice", "bob"));
    }

    #[test]
    fn key_layout_matches_contract() {
        assert_eq!(presence_key("u1"), "presence:u1");
        assert_eq!(active_call_key("a:b"), "activeCall:a:b");
        assert_eq!(pending_call_key("u2"), "pendingCall:u2");
        assert_eq!(delivery_channel("n1"), "deliver:n1");
    }

    #[test]
    fn clear_script_checks_connection_identity() {
        assert!(PRESENCE_CLEAR_SCRIPT.contains("connection_id"));
        assert!(PRESENCE_CLEAR_SCRIPT.contains("cjson.decode"));
    }

    #[test]
    fn descriptor_json_roundtrip() {
        let descriptor = ConnectionDescriptor {
            user_id: "user-1".to_string(),
            connection_id: "conn-1".to_string(),
            node_id: "node-1".to_string(),
            connected_at: Utc::now(),
        };
        let json = serde_json::to_string(&descriptor).unwrap();
        assert!(json.contains("\"connection_id\""));
        let parsed: ConnectionDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, descriptor);
    }

    #[test]
    fn conversation_peer_lookup() {
        let conversation = ConversationRecord {
            conversation_id: "c1".to_string(),
            participant_low: "alice".to_string(),
            participant_high: "bob".to_string(),
            last_message_text: None,
            last_message_sender: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(conversation.is_participant("alice"));
        assert!(!conversation.is_participant("mallory"));
        assert_eq!(conversation.peer_of("alice"), "bob");
        assert_eq!(conversation.peer_of("bob"), "alice");
    }

    #[tokio::test]
    async fn storage_integration_flow() -> Result<(), Box<dyn std::error::Error>> {
        let pg = match std::env::var("SKYLARK_TEST_PG_DSN") {
            Ok(value) => value,
            Err(_) => {
                eprintln!("skipping storage_integration_flow: SKYLARK_TEST_PG_DSN not set");
                return Ok(());
            }
        };
        let redis_url = match std::env::var("SKYLARK_TEST_REDIS_URL") {
            Ok(value) => value,
            Err(_) => {
                eprintln!("skipping storage_integration_flow: SKYLARK_TEST_REDIS_URL not set");
                return Ok(());
            }
        };
        let storage = connect(&pg, &redis_url).await?;
        storage.migrate().await?;
        let suffix = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let alice = format!("alice-{}", suffix);
        let bob = format!("bob-{}", suffix);

        // Conversation find-or-create resolves both argument orders to one row.
        let first = storage
            .find_or_create_conversation(&format!("conv-a-{}", suffix), &alice, &bob)
            .await?;
        let second = storage
            .find_or_create_conversation(&format!("conv-b-{}", suffix), &bob, &alice)
            .await?;
        assert_eq!(first.conversation_id, second.conversation_id);

        // Thirteen messages; a 12-message page leaves one behind.
        let base = Utc::now();
        for index in 0..13i64 {
            let message = NewMessage {
                message_id: format!("msg-{}-{:02}", suffix, index),
                conversation_id: first.conversation_id.clone(),
                sender_id: alice.clone(),
                text: format!("hello {}", index),
                media_url: None,
                reply_to_id: None,
                created_at: base + Duration::milliseconds(index),
            };
            storage.insert_message(&message).await?;
        }
        let conversation = storage.load_conversation(&first.conversation_id).await?;
        assert_eq!(conversation.last_message_text.as_deref(), Some("hello 12"));
        let rows = storage
            .list_messages(&first.conversation_id, 13, None)
            .await?;
        assert_eq!(rows.len(), 13);
        assert_eq!(rows[0].text, "hello 12");

        // Unread counting and the seen flip.
        assert_eq!(storage.total_unread(&bob).await?, 13);
        assert_eq!(storage.total_unread(&alice).await?, 0);
        let flipped = storage.mark_seen(&first.conversation_id, &bob).await?;
        assert_eq!(flipped, 13);
        assert_eq!(storage.total_unread(&bob).await?, 0);

        // Reaction toggle semantics.
        let target = &rows[0].message_id;
        let reactions = storage.toggle_reaction(target, &bob, "👍").await?;
        assert_eq!(reactions.len(), 1);
        let reactions = storage.toggle_reaction(target, &bob, "😂").await?;
        assert_eq!(reactions.len(), 1);
        assert_eq!(reactions[0].emoji, "😂");
        let reactions = storage.toggle_reaction(target, &bob, "😂").await?;
        assert!(reactions.is_empty());

        // Presence last-write-wins and the stale-disconnect guard.
        let c1 = ConnectionDescriptor {
            user_id: alice.clone(),
            connection_id: format!("conn-1-{}", suffix),
            node_id: "node-test".to_string(),
            connected_at: Utc::now(),
        };
        let mut c2 = c1.clone();
        c2.connection_id = format!("conn-2-{}", suffix);
        storage.publish_presence(&c1, 30).await?;
        storage.publish_presence(&c2, 30).await?;
        let resolved = storage.read_presence(&alice).await?.expect("presence");
        assert_eq!(resolved.connection_id, c2.connection_id);
        assert!(!storage.clear_presence(&alice, &c1.connection_id).await?);
        assert!(storage.read_presence(&alice).await?.is_some());
        assert!(storage.clear_presence(&alice, &c2.connection_id).await?);
        assert!(storage.read_presence(&alice).await?.is_none());

        // Call records under the unordered key, including pending cleanup.
        let (low, high) = ordered_pair(&alice, &bob);
        let call = CallRecord {
            call_id: format!("{}:{}", low, high),
            caller_id: alice.clone(),
            callee_id: bob.clone(),
            started_at: Utc::now(),
        };
        storage.put_active_call(&call, 60).await?;
        assert!(storage.read_active_call(&call.call_id).await?.is_some());
        assert!(storage.delete_active_call(&call.call_id).await?);
        assert!(!storage.delete_active_call(&call.call_id).await?);
        storage.put_pending_call(&call, 60).await?;
        assert_eq!(
            storage
                .read_pending_call(&bob)
                .await?
                .map(|record| record.caller_id),
            Some(alice.clone())
        );
        assert!(storage.delete_pending_call(&bob).await?);

        // Notification ring buffer keeps the newest entries under the cap.
        for index in 0..5 {
            let record = NotificationRecord {
                notification_id: format!("note-{}-{}", suffix, index),
                user_id: bob.clone(),
                kind: "follow".to_string(),
                payload: serde_json::json!({ "actor": alice, "seq": index }),
                created_at: Utc::now(),
            };
            storage.record_notification(&record, 3).await?;
        }
        let notes = storage.list_notifications(&bob, 10).await?;
        assert_eq!(notes.len(), 3);

        storage.set_in_call(&alice, true).await?;
        storage.set_in_call(&alice, false).await?;
        storage.readiness().await?;
        Ok(())
    }
}
