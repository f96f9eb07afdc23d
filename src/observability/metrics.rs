//! Metrics registry for the sync engine
//!
//! - Counters only
//! - Monotonic increase
//! - Reset only when the engine is constructed

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Operational counters for one engine instance
///
/// All counters use Relaxed atomics; values are exact but unordered
/// relative to each other.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    channels_opened: AtomicU64,
    reconnect_attempts: AtomicU64,
    upstream_subscribes: AtomicU64,
    upstream_unsubscribes: AtomicU64,
    events_routed: AtomicU64,
    stale_events_dropped: AtomicU64,
    callbacks_invoked: AtomicU64,
    optimistic_writes: AtomicU64,
    push_confirmations: AtomicU64,
    write_failures: AtomicU64,
    network_transitions: AtomicU64,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_channels_opened(&self) {
        self.channels_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_reconnect_attempts(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_upstream_subscribes(&self) {
        self.upstream_subscribes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_upstream_unsubscribes(&self) {
        self.upstream_unsubscribes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_events_routed(&self) {
        self.events_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_stale_events(&self) {
        self.stale_events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Add the number of callbacks a single fan-out invoked
    pub fn add_callbacks_invoked(&self, count: u64) {
        self.callbacks_invoked.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_optimistic_writes(&self) {
        self.optimistic_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_push_confirmations(&self) {
        self.push_confirmations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_write_failures(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_network_transitions(&self) {
        self.network_transitions.fetch_add(1, Ordering::Relaxed);
    }

    /// Get all metrics as a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            channels_opened: self.channels_opened.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            upstream_subscribes: self.upstream_subscribes.load(Ordering::Relaxed),
            upstream_unsubscribes: self.upstream_unsubscribes.load(Ordering::Relaxed),
            events_routed: self.events_routed.load(Ordering::Relaxed),
            stale_events_dropped: self.stale_events_dropped.load(Ordering::Relaxed),
            callbacks_invoked: self.callbacks_invoked.load(Ordering::Relaxed),
            optimistic_writes: self.optimistic_writes.load(Ordering::Relaxed),
            push_confirmations: self.push_confirmations.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            network_transitions: self.network_transitions.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub channels_opened: u64,
    pub reconnect_attempts: u64,
    pub upstream_subscribes: u64,
    pub upstream_unsubscribes: u64,
    pub events_routed: u64,
    pub stale_events_dropped: u64,
    pub callbacks_invoked: u64,
    pub optimistic_writes: u64,
    pub push_confirmations: u64,
    pub write_failures: u64,
    pub network_transitions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_registry_has_zero_values() {
        let registry = MetricsRegistry::new();
        assert_eq!(registry.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_increment_counters() {
        let registry = MetricsRegistry::new();

        registry.increment_channels_opened();
        registry.increment_channels_opened();
        registry.increment_reconnect_attempts();
        registry.add_callbacks_invoked(3);
        registry.increment_push_confirmations();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.channels_opened, 2);
        assert_eq!(snapshot.reconnect_attempts, 1);
        assert_eq!(snapshot.callbacks_invoked, 3);
        assert_eq!(snapshot.push_confirmations, 1);
        assert_eq!(snapshot.write_failures, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let registry = MetricsRegistry::new();
        registry.increment_events_routed();

        let json = serde_json::to_value(registry.snapshot()).unwrap();
        assert_eq!(json["events_routed"], 1);
    }

    #[test]
    fn test_thread_safety() {
        use std::sync::Arc;
        use std::thread;

        let registry = Arc::new(MetricsRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = Arc::clone(&registry);
                thread::spawn(move || {
                    for _ in 0..100 {
                        reg.increment_events_routed();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.snapshot().events_routed, 800);
    }
}
