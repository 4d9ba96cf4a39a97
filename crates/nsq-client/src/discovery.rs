use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{RwLock, mpsc};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::lookup::LookupClient;

/// The ordered set of lookupd endpoints a [`Consumer`](crate::consumer::Consumer)
/// polls, round-robin, one per tick.
pub(crate) struct LookupState {
    endpoints: RwLock<Vec<String>>,
    next_index: AtomicUsize,
}

impl LookupState {
    pub fn new() -> Self {
        Self { endpoints: RwLock::new(Vec::new()), next_index: AtomicUsize::new(0) }
    }

    /// Returns `false` if `endpoint` was already present.
    pub async fn add_endpoint(&self, endpoint: String) -> bool {
        let mut guard = self.endpoints.write().await;
        if guard.iter().any(|e| e == &endpoint) {
            return false;
        }
        guard.push(endpoint);
        true
    }

    /// Returns `false` if `endpoint` was not present.
    pub async fn remove_endpoint(&self, endpoint: &str) -> bool {
        let mut guard = self.endpoints.write().await;
        let before = guard.len();
        guard.retain(|e| e != endpoint);
        guard.len() != before
    }

    pub async fn len(&self) -> usize {
        self.endpoints.read().await.len()
    }

    async fn next_endpoint(&self) -> Option<String> {
        let guard = self.endpoints.read().await;
        if guard.is_empty() {
            return None;
        }
        let idx = self.next_index.fetch_add(1, Ordering::SeqCst) % guard.len();
        Some(guard[idx].clone())
    }
}

fn jittered_duration(interval: Duration, jitter: f64) -> Duration {
    let offset: f64 = rand::thread_rng().gen_range(-jitter..=jitter);
    let factor = (1.0 + offset).max(0.0);
    Duration::from_secs_f64(interval.as_secs_f64() * factor)
}

/// Polls one lookupd endpoint per tick (round-robin), forwarding any
/// producer address it finds to `connect_tx`. A failed poll iteration is
/// logged and retried on the next tick; it never tears down the loop.
/// `recheck_rx` lets the consumer force an immediate extra poll, e.g. right
/// after a new endpoint is added.
pub(crate) async fn run_discovery_loop(
    topic: Arc<str>,
    lookup: Arc<LookupState>,
    poll_interval: Duration,
    poll_jitter: f64,
    connect_tx: mpsc::Sender<SocketAddr>,
    mut recheck_rx: mpsc::Receiver<()>,
    token: CancellationToken,
) {
    let client = LookupClient::new(Duration::from_secs(10).min(poll_interval).max(Duration::from_secs(1)));

    sleep(jittered_duration(poll_interval, poll_jitter)).await;

    loop {
        if token.is_cancelled() {
            break;
        }
        poll_once(&client, &topic, &lookup, &connect_tx).await;

        tokio::select! {
            _ = token.cancelled() => break,
            _ = sleep(jittered_duration(poll_interval, poll_jitter)) => {}
            _ = recheck_rx.recv() => {}
        }
    }
}

async fn poll_once(
    client: &LookupClient,
    topic: &str,
    lookup: &LookupState,
    connect_tx: &mpsc::Sender<SocketAddr>,
) {
    let Some(endpoint) = lookup.next_endpoint().await else { return };
    match client.query_producers(&endpoint, topic).await {
        Ok(addrs) => {
            for addr in addrs {
                let _ = connect_tx.send(addr).await;
            }
        }
        Err(err) => {
            warn!("lookup poll failed: endpoint={endpoint}, error={err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_robins_across_endpoints() {
        let lookup = LookupState::new();
        lookup.add_endpoint("http://a:4161".to_string()).await;
        lookup.add_endpoint("http://b:4161".to_string()).await;

        let first = lookup.next_endpoint().await.unwrap();
        let second = lookup.next_endpoint().await.unwrap();
        let third = lookup.next_endpoint().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[tokio::test]
    async fn add_endpoint_rejects_duplicates() {
        let lookup = LookupState::new();
        assert!(lookup.add_endpoint("http://a:4161".to_string()).await);
        assert!(!lookup.add_endpoint("http://a:4161".to_string()).await);
        assert_eq!(lookup.len().await, 1);
    }

    #[tokio::test]
    async fn remove_endpoint_reports_presence() {
        let lookup = LookupState::new();
        lookup.add_endpoint("http://a:4161".to_string()).await;
        assert!(lookup.remove_endpoint("http://a:4161").await);
        assert!(!lookup.remove_endpoint("http://a:4161").await);
    }

    #[test]
    fn jitter_stays_non_negative() {
        let d = jittered_duration(Duration::from_secs(60), 0.3);
        assert!(d.as_secs_f64() >= 0.0);
    }
}
