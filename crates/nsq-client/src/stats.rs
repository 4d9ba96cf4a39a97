use std::sync::atomic::{AtomicU64, Ordering};

/// Atomically-updated lifetime counters, snapshotted by `Consumer::stats()`.
#[derive(Default)]
pub struct Stats {
    messages_received: AtomicU64,
    messages_finished: AtomicU64,
    messages_requeued: AtomicU64,
    connections: AtomicU64,
}

impl Stats {
    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_finished(&self) {
        self.messages_finished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_requeued(&self) {
        self.messages_requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_connection_count(&self, n: usize) {
        self.connections.store(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_finished: self.messages_finished.load(Ordering::Relaxed),
            messages_requeued: self.messages_requeued.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`Stats`], safe to pass around or log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub messages_received: u64,
    pub messages_finished: u64,
    pub messages_requeued: u64,
    pub connections: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let stats = Stats::default();
        stats.record_received();
        stats.record_received();
        stats.record_finished();
        stats.record_requeued();
        stats.set_connection_count(3);

        let snap = stats.snapshot();
        assert_eq!(snap.messages_received, 2);
        assert_eq!(snap.messages_finished, 1);
        assert_eq!(snap.messages_requeued, 1);
        assert_eq!(snap.connections, 3);
    }
}
