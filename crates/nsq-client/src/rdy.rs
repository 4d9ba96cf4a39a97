use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;
use tracing::{debug, info};

use crate::config::Config;
use crate::connection::{ConnectionHandle, now_ms};

pub(crate) type ConnectionMap = RwLock<HashMap<SocketAddr, ConnectionHandle>>;

struct BackoffState {
    counter: u32,
    duration: Duration,
}

impl Default for BackoffState {
    fn default() -> Self {
        Self { counter: 0, duration: Duration::ZERO }
    }
}

/// Divides the consumer's `max_in_flight` budget across live connections,
/// tracks the shared backoff counter, and periodically redistributes RDY so
/// connections past the budget don't starve forever.
pub(crate) struct RdyController {
    max_in_flight: AtomicI64,
    max_backoff_duration: Duration,
    backoff_multiplier: Duration,
    low_rdy_idle_timeout: Duration,
    backoff: Mutex<BackoffState>,
}

impl RdyController {
    pub fn new(config: &Config) -> Self {
        Self {
            max_in_flight: AtomicI64::new(config.max_in_flight as i64),
            max_backoff_duration: config.max_backoff_duration,
            backoff_multiplier: config.backoff_multiplier,
            low_rdy_idle_timeout: config.low_rdy_idle_timeout,
            backoff: Mutex::new(BackoffState::default()),
        }
    }

    pub fn max_in_flight(&self) -> i64 {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn set_max_in_flight(&self, n: u32) {
        self.max_in_flight.store(n as i64, Ordering::SeqCst);
    }

    fn max_backoff_level(&self) -> u32 {
        let secs = self.max_backoff_duration.as_secs_f64().max(1.0);
        (secs.log2().ceil() as u32).max(1)
    }

    pub fn per_conn_max_in_flight(&self, live_connections: usize) -> i64 {
        let max_in_flight = self.max_in_flight();
        if max_in_flight == 0 {
            return 0;
        }
        if live_connections == 0 {
            return max_in_flight.max(1);
        }
        (max_in_flight / live_connections as i64).clamp(1, max_in_flight.max(1))
    }

    /// Recomputes and (where warranted) re-sends RDY for every live connection.
    /// A no-op while backoff is held.
    pub async fn refresh_all(&self, connections: &ConnectionMap) {
        if self.backoff.lock().await.counter > 0 {
            return;
        }
        self.grant_per_conn_budget(connections).await;
    }

    async fn grant_per_conn_budget(&self, connections: &ConnectionMap) {
        let guard = connections.read().await;
        let count = self.per_conn_max_in_flight(guard.len());
        for handle in guard.values() {
            self.maybe_update_rdy(handle, count);
        }
    }

    fn maybe_update_rdy(&self, handle: &ConnectionHandle, count: i64) {
        if handle.shared.is_closing() {
            return;
        }
        let max_rdy = handle.max_rdy_count().max(0);
        let target = count.clamp(0, max_rdy);
        let last = handle.last_rdy_count();
        let remaining = handle.current_rdy_count();

        let needs_refresh = last == 0
            || (last != target && (remaining as f64) <= 0.25 * (last as f64).max(1.0));
        if needs_refresh {
            handle.send_rdy(target as u32);
        }
    }

    /// Call after a message is acknowledged without triggering backoff.
    /// Counts toward exiting an active backoff.
    pub async fn on_success(&self, connections: &ConnectionMap) {
        let mut backoff = self.backoff.lock().await;
        if backoff.counter == 0 {
            return;
        }
        backoff.counter -= 1;
        let exited = backoff.counter == 0;
        drop(backoff);

        if exited {
            self.grant_per_conn_budget(connections).await;
            info!("rdy controller exited backoff");
        }
    }

    /// Call after a message is requeued with `backoff=true`. Deepens (or
    /// enters) backoff, cuts every connection's RDY to zero, and schedules a
    /// one-shot test probe once the new backoff duration elapses.
    pub async fn on_failure(self: &Arc<Self>, connections: Arc<ConnectionMap>) {
        let duration = {
            let mut backoff = self.backoff.lock().await;
            backoff.counter = (backoff.counter + 1).min(self.max_backoff_level());
            let exp = 2_u32.saturating_pow(backoff.counter);
            let jitter = Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..1.0));
            let duration = (self.backoff_multiplier.saturating_mul(exp) + jitter)
                .min(self.max_backoff_duration);
            backoff.duration = duration;
            duration
        };

        {
            let guard = connections.read().await;
            for handle in guard.values() {
                handle.send_rdy(0);
            }
        }
        debug!("rdy controller entering backoff: duration={duration:?}");

        let controller = self.clone();
        tokio::spawn(async move {
            sleep(duration).await;
            controller.fire_test_probe(&connections).await;
        });
    }

    /// Grants RDY 1 to a single, uniformly-random live connection. Called
    /// once the backoff timer fires; a later `on_success`/`on_failure`
    /// resolves whether the probe succeeded.
    async fn fire_test_probe(&self, connections: &ConnectionMap) {
        if self.backoff.lock().await.counter == 0 {
            return;
        }

        let guard = connections.read().await;
        let addrs: Vec<SocketAddr> = guard.keys().copied().collect();
        if addrs.is_empty() {
            return;
        }
        let pick = addrs[rand::thread_rng().gen_range(0..addrs.len())];
        if let Some(handle) = guard.get(&pick) {
            handle.send_rdy(1);
        }
    }

    /// Periodic task body: steals RDY from idle connections back to
    /// connections that currently have none, so growth past `max_in_flight`
    /// doesn't leave most connections permanently starved.
    pub async fn redistribute(&self, connections: &ConnectionMap) {
        if self.backoff.lock().await.counter > 0 {
            return;
        }

        let guard = connections.read().await;
        let live = guard.len() as i64;
        if live == 0 {
            return;
        }

        let max_in_flight = self.max_in_flight();
        let over_subscribed = live > max_in_flight;
        let now = now_ms();
        let idle_timeout_ms = self.low_rdy_idle_timeout.as_millis() as i64;

        // Steal RDY back from connections that currently hold it: either
        // they've gone idle past the timeout, or there are more connections
        // than budget and everyone holding RDY must take turns.
        let steal: Vec<SocketAddr> = guard
            .iter()
            .filter(|(_, h)| {
                !h.shared.is_closing()
                    && h.last_rdy_count() > 0
                    && (over_subscribed || now - h.last_message_at_ms() > idle_timeout_ms)
            })
            .map(|(addr, _)| *addr)
            .collect();
        for addr in &steal {
            if let Some(handle) = guard.get(addr) {
                handle.send_rdy(0);
            }
        }

        let total_granted: i64 = guard.values().map(|h| h.last_rdy_count()).sum();
        let budget = (max_in_flight - total_granted).max(0);
        if budget == 0 {
            return;
        }

        let mut idle: Vec<SocketAddr> = guard
            .iter()
            .filter(|(_, h)| !h.shared.is_closing() && h.last_rdy_count() == 0)
            .map(|(addr, _)| *addr)
            .collect();

        if idle.is_empty() {
            return;
        }

        let mut rng = rand::thread_rng();
        for i in (1..idle.len()).rev() {
            let j = rng.gen_range(0..=i);
            idle.swap(i, j);
        }

        let pick_count = budget.min(idle.len() as i64) as usize;
        for addr in idle.into_iter().take(pick_count) {
            if let Some(handle) = guard.get(&addr) {
                handle.send_rdy(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_conn_budget_splits_evenly_and_floors_at_one() {
        let config = Config::default().with_max_in_flight(10);
        let controller = RdyController::new(&config);
        assert_eq!(controller.per_conn_max_in_flight(4), 2);
        assert_eq!(controller.per_conn_max_in_flight(0), 10);
        assert_eq!(controller.per_conn_max_in_flight(100), 1);
    }

    #[test]
    fn per_conn_budget_is_zero_when_max_in_flight_is_zero() {
        let config = Config::default().with_max_in_flight(0);
        let controller = RdyController::new(&config);
        assert_eq!(controller.per_conn_max_in_flight(0), 0);
        assert_eq!(controller.per_conn_max_in_flight(3), 0);
    }

    #[test]
    fn max_backoff_level_is_at_least_one() {
        let mut config = Config::default();
        config.max_backoff_duration = Duration::from_secs(1);
        let controller = RdyController::new(&config);
        assert_eq!(controller.max_backoff_level(), 1);

        config.max_backoff_duration = Duration::from_secs(120);
        let controller = RdyController::new(&config);
        assert_eq!(controller.max_backoff_level(), 7);
    }
}
