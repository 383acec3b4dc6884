use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Process-local counters. Scraped as a Prometheus text page by whatever
/// operational surface the deployment wires up.
#[derive(Default)]
pub struct Metrics {
    connections_active: AtomicI64,
    events_delivered: AtomicU64,
    events_dropped: AtomicU64,
    messages_sent: AtomicU64,
    messages_deleted: AtomicU64,
    calls_started: AtomicU64,
    calls_canceled: AtomicU64,
    notifications_recorded: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_connections(&self) {
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr_connections(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn mark_event_delivered(&self) {
        self.events_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_message_deleted(&self) {
        self.messages_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_call_started(&self) {
        self.calls_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_call_canceled(&self) {
        self.calls_canceled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_notification_recorded(&self) {
        self.notifications_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn encode_prometheus(&self) -> String {
        let mut out = String::new();
        push_gauge(
            &mut out,
            "skylark_connections_active",
            self.connections_active.load(Ordering::Relaxed),
        );
        push_counter(
            &mut out,
            "skylark_events_delivered_total",
            self.events_delivered.load(Ordering::Relaxed),
        );
        push_counter(
            &mut out,
            "skylark_events_dropped_total",
            self.events_dropped.load(Ordering::Relaxed),
        );
        push_counter(
            &mut out,
            "skylark_messages_sent_total",
            self.messages_sent.load(Ordering::Relaxed),
        );
        push_counter(
            &mut out,
            "skylark_messages_deleted_total",
            self.messages_deleted.load(Ordering::Relaxed),
        );
        push_counter(
            &mut out,
            "skylark_calls_started_total",
            self.calls_started.load(Ordering::Relaxed),
        );
        push_counter(
            &mut out,
            "skylark_calls_canceled_total",
            self.calls_canceled.load(Ordering::Relaxed),
        );
        push_counter(
            &mut out,
            "skylark_notifications_recorded_total",
            self.notifications_recorded.load(Ordering::Relaxed),
        );
        out
    }
}

fn push_counter(out: &mut String, name: &str, value: u64) {
    out.push_str("# TYPE ");
    out.push_str(name);
    out.push_str(" counter\n");
    out.push_str(name);
    out.push(' ');
    out.push_str(&value.to_string());
    out.push('\n');
}

fn push_gauge(out: &mut String, name: &str, value: i64) {
    out.push_str("# TYPE ");
    out.push_str(name);
    out.push_str(" gauge\n");
    out.push_str(name);
    out.push(' ');
    out.push_str(&value.to_string());
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_reflects_counter_state() {
        let metrics = Metrics::new();
        metrics.incr_connections();
        metrics.incr_connections();
        metrics.decr_connections();
        metrics.mark_message_sent();
        metrics.mark_event_delivered();
        metrics.mark_event_delivered();
        let page = metrics.encode_prometheus();
        assert!(page.contains("skylark_connections_active 1"));
        assert!(page.contains("skylark_messages_sent_total 1"));
        assert!(page.contains("skylark_events_delivered_total 2"));
        assert!(page.contains("skylark_events_dropped_total 0"));
    }
}
