use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Upper bound for a single encoded event pushed over a live connection.
pub const MAX_EVENT_LEN: usize = 256 * 1024;

/// Stable wire labels for events pushed to live clients. The labels are the
/// contract with the client and with other server processes; they never change
/// once shipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "newMessage")]
    NewMessage,
    #[serde(rename = "unreadCountUpdate")]
    UnreadCountUpdate,
    #[serde(rename = "messageDeleted")]
    MessageDeleted,
    #[serde(rename = "messageReactionUpdated")]
    MessageReactionUpdated,
    #[serde(rename = "messagesSeen")]
    MessagesSeen,
    #[serde(rename = "activity")]
    Activity,
    #[serde(rename = "incomingCall")]
    IncomingCall,
    #[serde(rename = "callAccepted")]
    CallAccepted,
    #[serde(rename = "CallCanceled")]
    CallCanceled,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewMessage => "newMessage",
            Self::UnreadCountUpdate => "unreadCountUpdate",
            Self::MessageDeleted => "messageDeleted",
            Self::MessageReactionUpdated => "messageReactionUpdated",
            Self::MessagesSeen => "messagesSeen",
            Self::Activity => "activity",
            Self::IncomingCall => "incomingCall",
            Self::CallAccepted => "callAccepted",
            Self::CallCanceled => "CallCanceled",
        }
    }

    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            "newMessage" => Some(Self::NewMessage),
            "unreadCountUpdate" => Some(Self::UnreadCountUpdate),
            "messageDeleted" => Some(Self::MessageDeleted),
            "messageReactionUpdated" => Some(Self::MessageReactionUpdated),
            "messagesSeen" => Some(Self::MessagesSeen),
            "activity" => Some(Self::Activity),
            "incomingCall" => Some(Self::IncomingCall),
            "callAccepted" => Some(Self::CallAccepted),
            "CallCanceled" => Some(Self::CallCanceled),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum CodecError {
    InvalidJson,
    EventTooLarge,
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidJson => write!(f, "invalid event json"),
            Self::EventTooLarge => write!(f, "event exceeds limits"),
        }
    }
}

impl Error for CodecError {}

/// The unit pushed to a client over its live connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: EventKind,
    pub payload: Value,
    pub sent_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(event: EventKind, payload: Value) -> Self {
        Envelope {
            event,
            payload,
            sent_at: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let encoded = serde_json::to_vec(self).map_err(|_| CodecError::InvalidJson)?;
        if encoded.len() > MAX_EVENT_LEN {
            return Err(CodecError::EventTooLarge);
        }
        Ok(encoded)
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() > MAX_EVENT_LEN {
            return Err(CodecError::EventTooLarge);
        }
        serde_json::from_slice(data).map_err(|_| CodecError::InvalidJson)
    }
}

/// Cross-process delivery frame, published on the owning node's delivery
/// channel when the target's connection lives in another server process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutedEnvelope {
    pub target_user_id: String,
    pub connection_id: String,
    pub envelope: Envelope,
}

impl RoutedEnvelope {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let encoded = serde_json::to_vec(self).map_err(|_| CodecError::InvalidJson)?;
        if encoded.len() > MAX_EVENT_LEN {
            return Err(CodecError::EventTooLarge);
        }
        Ok(encoded)
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() > MAX_EVENT_LEN {
            return Err(CodecError::EventTooLarge);
        }
        serde_json::from_slice(data).map_err(|_| CodecError::InvalidJson)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessagePayload {
    pub message: Value,
    pub conversation_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCountPayload {
    pub total_unread: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeletedPayload {
    pub conversation_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReactionPayload {
    pub conversation_id: String,
    pub message_id: String,
    pub reactions: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesSeenPayload {
    pub conversation_id: String,
    pub seen_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCallPayload {
    pub call_id: String,
    pub caller_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallAnswerPayload {
    pub call_id: String,
    pub callee_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallCanceledPayload {
    pub call_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityPayload {
    pub kind: String,
    pub actor_id: String,
    pub payload: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_labels_roundtrip() {
        let kinds = [
            EventKind::NewMessage,
            EventKind::UnreadCountUpdate,
            EventKind::MessageDeleted,
            EventKind::MessageReactionUpdated,
            EventKind::MessagesSeen,
            EventKind::Activity,
            EventKind::IncomingCall,
            EventKind::CallAccepted,
            EventKind::CallCanceled,
        ];
        for kind in kinds {
            assert_eq!(EventKind::from_label(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::from_label("presenceUpdate"), None);
    }

    #[test]
    fn event_label_matches_serde_rename() {
        let value = serde_json::to_value(EventKind::CallCanceled).unwrap();
        assert_eq!(value, json!("CallCanceled"));
        let value = serde_json::to_value(EventKind::NewMessage).unwrap();
        assert_eq!(value, json!("newMessage"));
    }

    #[test]
    fn envelope_roundtrip() {
        let envelope = Envelope::new(
            EventKind::UnreadCountUpdate,
            serde_json::to_value(UnreadCountPayload { total_unread: 4 }).unwrap(),
        );
        let encoded = envelope.encode().unwrap();
        let decoded = Envelope::decode(&encoded).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn envelope_rejects_oversize() {
        let envelope = Envelope::new(
            EventKind::Activity,
            json!({ "blob": "x".repeat(MAX_EVENT_LEN) }),
        );
        assert!(matches!(envelope.encode(), Err(CodecError::EventTooLarge)));
        let oversized = vec![b'{'; MAX_EVENT_LEN + 1];
        assert!(matches!(
            Envelope::decode(&oversized),
            Err(CodecError::EventTooLarge)
        ));
    }

    #[test]
    fn routed_envelope_roundtrip() {
        let routed = RoutedEnvelope {
            target_user_id: "user-1".to_string(),
            connection_id: "conn-1".to_string(),
            envelope: Envelope::new(
                EventKind::MessageDeleted,
                serde_json::to_value(MessageDeletedPayload {
                    conversation_id: "conv-1".to_string(),
                    message_id: "msg-1".to_string(),
                })
                .unwrap(),
            ),
        };
        let decoded = RoutedEnvelope::decode(&routed.encode().unwrap()).unwrap();
        assert_eq!(decoded, routed);
    }

    #[test]
    fn payloads_use_camel_case_keys() {
        let payload = serde_json::to_value(NewMessagePayload {
            message: json!({"id": "m1"}),
            conversation_updated_at: Utc::now(),
        })
        .unwrap();
        assert!(payload.get("conversationUpdatedAt").is_some());
        let payload = serde_json::to_value(IncomingCallPayload {
            call_id: "a:b".to_string(),
            caller_id: "a".to_string(),
        })
        .unwrap();
        assert!(payload.get("callId").is_some());
        assert!(payload.get("callerId").is_some());
    }

    #[test]
    fn malformed_event_is_rejected() {
        assert!(matches!(
            Envelope::decode(b"not-json"),
            Err(CodecError::InvalidJson)
        ));
    }
}
