use serde_json::{json, Value};
use tracing::warn;

/// Out-of-band push toward a provider gateway. Runs after the authoritative
/// write and never affects it; failures are logged and forgotten.
pub trait Notifier: Send + Sync {
    fn push(&self, user_id: &str, event: &str, payload: &Value);
}

pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn push(&self, _user_id: &str, _event: &str, _payload: &Value) {}
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl WebhookNotifier {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

impl Notifier for WebhookNotifier {
    fn push(&self, user_id: &str, event: &str, payload: &Value) {
        let request = self.client.post(&self.endpoint).json(&json!({
            "userId": user_id,
            "event": event,
            "payload": payload,
        }));
        let event = event.to_string();
        tokio::spawn(async move {
            if let Err(err) = request.send().await {
                warn!(event = %event, "push webhook failed: {}", err);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifier_is_object_safe() {
        let notifier: Box<dyn Notifier + Send + Sync> = Box::new(NoopNotifier);
        notifier.push("alice", "newMessage", &json!({}));
    }
}
