use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// In-memory counter. Monotonically increasing.
#[derive(Default)]
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn increment(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Relay-wide monitoring counters.
///
/// Delivery counts are a monitoring signal only; nothing reads them to make
/// a correctness decision.
#[derive(Default)]
pub struct RelayMetrics {
    connections_opened: Counter,
    connections_closed: Counter,
    messages_accepted: Counter,
    messages_rejected: Counter,
    decode_failures: Counter,
    persistence_failures: Counter,
    deliveries_sent: Counter,
    deliveries_dropped: Counter,
}

/// Point-in-time copy of [`RelayMetrics`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub messages_accepted: u64,
    pub messages_rejected: u64,
    pub decode_failures: u64,
    pub persistence_failures: u64,
    pub deliveries_sent: u64,
    pub deliveries_dropped: u64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_opened.increment(1);
    }

    pub fn connection_closed(&self) {
        self.connections_closed.increment(1);
    }

    pub fn message_accepted(&self) {
        self.messages_accepted.increment(1);
    }

    pub fn message_rejected(&self) {
        self.messages_rejected.increment(1);
    }

    pub fn decode_failed(&self) {
        self.decode_failures.increment(1);
    }

    pub fn persistence_failed(&self) {
        self.persistence_failures.increment(1);
    }

    pub fn record_delivery(&self, sent: u64, dropped: u64) {
        self.deliveries_sent.increment(sent);
        self.deliveries_dropped.increment(dropped);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_opened: self.connections_opened.get(),
            connections_closed: self.connections_closed.get(),
            messages_accepted: self.messages_accepted.get(),
            messages_rejected: self.messages_rejected.get(),
            decode_failures: self.decode_failures.get(),
            persistence_failures: self.persistence_failures.get(),
            deliveries_sent: self.deliveries_sent.get(),
            deliveries_dropped: self.deliveries_dropped.get(),
        }
    }
}
