use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connection;
use crate::delegate::ConnectionDelegate;
use crate::discovery::{LookupState, run_discovery_loop};
use crate::error::ConsumerError;
use crate::message::Message;
use crate::rdy::{ConnectionMap, RdyController};
use crate::stats::{Stats, StatsSnapshot};

/// A message handler. `handle` takes ownership of the message and returns it
/// back alongside the outcome, so the dispatcher can inspect whether the
/// handler opted out of auto FIN/REQ via [`Message::disable_auto_response`]
/// before acting on the result.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, message: Message) -> HandlerFuture;
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = (Message, anyhow::Result<()>)> + Send>>;

/// Runtime for a single (topic, channel) pair: discovery, connection pool,
/// RDY flow control, and handler dispatch. Clone is cheap — it shares the
/// same underlying state.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

struct ConsumerInner {
    topic: Arc<str>,
    channel: Arc<str>,
    config: Arc<Config>,
    connections: Arc<ConnectionMap>,
    pending: StdMutex<HashSet<SocketAddr>>,
    lookup: Arc<LookupState>,
    rdy: Arc<RdyController>,
    stats: Arc<Stats>,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    incoming_tx: Mutex<Option<mpsc::Sender<Message>>>,
    incoming_rx: Arc<Mutex<mpsc::Receiver<Message>>>,
    discovery_recheck_tx: mpsc::Sender<()>,
    token: CancellationToken,
    worker_handles: StdMutex<Vec<JoinHandle<()>>>,
    background_handles: StdMutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Consumer {
    /// Validates and freezes `config`, then spawns the RDY-redistribution
    /// and lookup-poll background tasks. [`Consumer::add_handler`] must be
    /// called before any `connect_*` method will succeed.
    pub fn new(
        topic: impl Into<String>,
        channel: impl Into<String>,
        config: Config,
    ) -> Result<Self, ConsumerError> {
        config.validate()?;
        let topic: Arc<str> = Arc::from(topic.into());
        let channel: Arc<str> = Arc::from(channel.into());
        nsq_proto::command::sub(&topic, &channel)
            .map_err(|err| ConsumerError::InvalidConfig(err.to_string()))?;

        let config = Arc::new(config);
        let (incoming_tx, incoming_rx) = mpsc::channel(1024);
        let (discovery_recheck_tx, discovery_recheck_rx) = mpsc::channel(4);
        let (connect_tx, connect_rx) = mpsc::channel::<SocketAddr>(256);
        let token = CancellationToken::new();
        let connections: Arc<ConnectionMap> = Arc::new(RwLock::new(HashMap::new()));
        let rdy = Arc::new(RdyController::new(&config));
        let lookup = Arc::new(LookupState::new());

        let inner = Arc::new(ConsumerInner {
            topic: topic.clone(),
            channel: channel.clone(),
            config: config.clone(),
            connections: connections.clone(),
            pending: StdMutex::new(HashSet::new()),
            lookup: lookup.clone(),
            rdy: rdy.clone(),
            stats: Arc::new(Stats::default()),
            handler: RwLock::new(None),
            incoming_tx: Mutex::new(Some(incoming_tx)),
            incoming_rx: Arc::new(Mutex::new(incoming_rx)),
            discovery_recheck_tx,
            token: token.clone(),
            worker_handles: StdMutex::new(Vec::new()),
            background_handles: StdMutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        });

        let rdy_task = tokio::spawn(run_rdy_redistribution_loop(
            rdy,
            connections,
            config.rdy_redistribute_interval,
            token.clone(),
        ));
        let discovery_task = tokio::spawn(run_discovery_loop(
            topic,
            lookup,
            config.lookupd_poll_interval,
            config.lookupd_poll_jitter,
            connect_tx,
            discovery_recheck_rx,
            token.clone(),
        ));
        let connect_drain_task =
            tokio::spawn(run_connect_drain_loop(inner.clone(), connect_rx, token));

        inner.background_handles.lock().unwrap().extend([
            rdy_task,
            discovery_task,
            connect_drain_task,
        ]);

        Ok(Self { inner })
    }

    /// Registers the message handler and spawns `concurrency` worker tasks
    /// (minimum 1) draining the incoming queue. Must be called before any
    /// `connect_*` method.
    pub async fn add_handler(&self, handler: Arc<dyn MessageHandler>, concurrency: usize) {
        *self.inner.handler.write().await = Some(handler.clone());

        let mut handles = Vec::with_capacity(concurrency.max(1));
        for _ in 0..concurrency.max(1) {
            handles.push(tokio::spawn(run_handler_worker(
                handler.clone(),
                self.inner.incoming_rx.clone(),
                self.inner.config.max_attempts,
                self.inner.config.default_requeue_delay,
                self.inner.token.clone(),
            )));
        }
        self.inner.worker_handles.lock().unwrap().extend(handles);
    }

    pub async fn connect_to_nsqd(&self, addr: SocketAddr) -> Result<(), ConsumerError> {
        self.inner.connect_to_nsqd(addr).await
    }

    pub async fn connect_to_nsqds(&self, addrs: &[SocketAddr]) -> Result<(), ConsumerError> {
        for &addr in addrs {
            match self.connect_to_nsqd(addr).await {
                Ok(()) | Err(ConsumerError::AlreadyConnected(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    pub async fn connect_to_lookupd(&self, endpoint: impl Into<String>) -> Result<(), ConsumerError> {
        if self.inner.token.is_cancelled() {
            return Err(ConsumerError::Stopped);
        }
        if self.inner.handler.read().await.is_none() {
            return Err(ConsumerError::NoHandlers);
        }

        let endpoint = endpoint.into();
        if self.inner.lookup.add_endpoint(endpoint).await {
            let _ = self.inner.discovery_recheck_tx.try_send(());
        }
        Ok(())
    }

    pub async fn disconnect_from_nsqd(&self, addr: SocketAddr) -> Result<(), ConsumerError> {
        let mut guard = self.inner.connections.write().await;
        let Some(handle) = guard.remove(&addr) else {
            return Err(ConsumerError::NotConnected(addr));
        };
        let count = guard.len();
        drop(guard);
        self.inner.stats.set_connection_count(count);
        handle.close();
        Ok(())
    }

    pub async fn disconnect_from_lookupd(&self, endpoint: &str) -> Result<(), ConsumerError> {
        if self.inner.lookup.len().await <= 1 {
            return Err(ConsumerError::LastLookupEndpoint);
        }
        if self.inner.lookup.remove_endpoint(endpoint).await {
            Ok(())
        } else {
            Err(ConsumerError::LookupEndpointNotFound(endpoint.to_string()))
        }
    }

    /// Updates the global in-flight budget and immediately re-grants RDY
    /// across live connections (a no-op while backoff is held).
    pub async fn change_max_in_flight(&self, n: u32) {
        self.inner.rdy.set_max_in_flight(n);
        self.inner.rdy.refresh_all(&self.inner.connections).await;
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub async fn is_starved(&self) -> bool {
        let guard = self.inner.connections.read().await;
        guard.values().any(|handle| {
            let in_flight = handle.messages_in_flight();
            let last_rdy = handle.last_rdy_count();
            !handle.shared.is_closing() && in_flight > 0 && in_flight as f64 >= 0.85 * last_rdy as f64
        })
    }

    /// A clone of the consumer's internal shutdown token, resolved once
    /// [`Consumer::stop`] has fully torn everything down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Idempotent graceful shutdown: `CLS` every connection, give in-flight
    /// messages a chance to drain, cancel all background tasks, then join
    /// every connection, handler worker, and background task before
    /// returning.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping consumer: topic={}, channel={}", self.inner.topic, self.inner.channel);

        {
            let guard = self.inner.connections.read().await;
            for handle in guard.values() {
                handle.send_command(nsq_proto::command::cls());
            }
        }
        tokio::time::sleep(self.inner.config.msg_timeout.min(Duration::from_secs(5))).await;

        self.inner.token.cancel();
        *self.inner.incoming_tx.lock().await = None;

        let handles: Vec<connection::ConnectionHandle> = {
            let mut guard = self.inner.connections.write().await;
            guard.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.join().await;
        }

        for handle in std::mem::take(&mut *self.inner.worker_handles.lock().unwrap()) {
            let _ = handle.await;
        }
        for handle in std::mem::take(&mut *self.inner.background_handles.lock().unwrap()) {
            let _ = handle.await;
        }

        info!("consumer stopped: topic={}, channel={}", self.inner.topic, self.inner.channel);
    }
}

impl ConsumerInner {
    async fn connect_to_nsqd(self: &Arc<Self>, addr: SocketAddr) -> Result<(), ConsumerError> {
        if self.token.is_cancelled() {
            return Err(ConsumerError::Stopped);
        }
        if self.handler.read().await.is_none() {
            return Err(ConsumerError::NoHandlers);
        }

        let already_connected = self.connections.read().await.contains_key(&addr);
        {
            let mut pending = self.pending.lock().unwrap();
            if already_connected || pending.contains(&addr) {
                return Err(ConsumerError::AlreadyConnected(addr));
            }
            pending.insert(addr);
        }

        let incoming_tx = {
            let guard = self.incoming_tx.lock().await;
            guard.clone().ok_or(ConsumerError::Stopped)?
        };

        let result = connection::connect(
            addr,
            self.topic.clone(),
            self.channel.clone(),
            self.config.clone(),
            self.clone() as Arc<dyn ConnectionDelegate>,
            incoming_tx,
            self.token.clone(),
        )
        .await;

        self.pending.lock().unwrap().remove(&addr);

        match result {
            Ok(handle) => {
                let mut guard = self.connections.write().await;
                guard.insert(addr, handle);
                let count = guard.len();
                drop(guard);
                self.stats.set_connection_count(count);
                self.rdy.refresh_all(&self.connections).await;
                info!("connected to nsqd: addr={addr}");
                Ok(())
            }
            Err(err) => {
                warn!("failed to connect to nsqd: addr={addr}, error={err}");
                Err(err)
            }
        }
    }
}

impl ConnectionDelegate for ConsumerInner {
    fn on_message(&self, _addr: SocketAddr) {
        self.stats.record_received();
    }

    fn on_response(&self, addr: SocketAddr, payload: &[u8]) {
        debug!("response frame: addr={addr}, payload={}", String::from_utf8_lossy(payload));
    }

    fn on_error(&self, addr: SocketAddr, payload: &[u8]) {
        warn!("error frame: addr={addr}, payload={}", String::from_utf8_lossy(payload));
    }

    fn on_heartbeat(&self, addr: SocketAddr) {
        debug!("heartbeat: addr={addr}");
    }

    fn on_close(&self, addr: SocketAddr) {
        let connections = self.connections.clone();
        let rdy = self.rdy.clone();
        let stats = self.stats.clone();
        tokio::spawn(async move {
            let mut guard = connections.write().await;
            guard.remove(&addr);
            let count = guard.len();
            drop(guard);
            stats.set_connection_count(count);
            rdy.refresh_all(&connections).await;
        });
        let _ = self.discovery_recheck_tx.try_send(());
    }

    fn on_finish(&self, _addr: SocketAddr) {
        self.stats.record_finished();
        let rdy = self.rdy.clone();
        let connections = self.connections.clone();
        tokio::spawn(async move { rdy.on_success(&connections).await });
    }

    fn on_requeue(&self, _addr: SocketAddr, backoff: bool) {
        self.stats.record_requeued();
        if backoff {
            let rdy = self.rdy.clone();
            let connections = self.connections.clone();
            tokio::spawn(async move { rdy.on_failure(connections).await });
        }
    }

    fn on_touch(&self, addr: SocketAddr) {
        debug!("touch: addr={addr}");
    }

    fn on_io_error(&self, addr: SocketAddr) {
        warn!("io error, connection closing: addr={addr}");
        let _ = self.discovery_recheck_tx.try_send(());
    }
}

async fn run_rdy_redistribution_loop(
    rdy: Arc<RdyController>,
    connections: Arc<ConnectionMap>,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                rdy.redistribute(&connections).await;
            }
        }
    }
}

async fn run_connect_drain_loop(
    inner: Arc<ConsumerInner>,
    mut connect_rx: mpsc::Receiver<SocketAddr>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            maybe_addr = connect_rx.recv() => {
                let Some(addr) = maybe_addr else { break };
                if let Err(err) = inner.connect_to_nsqd(addr).await {
                    if !matches!(err, ConsumerError::AlreadyConnected(_)) {
                        debug!("discovery connect attempt failed: addr={addr}, error={err}");
                    }
                }
            }
        }
    }
}

async fn run_handler_worker(
    handler: Arc<dyn MessageHandler>,
    incoming_rx: Arc<Mutex<mpsc::Receiver<Message>>>,
    max_attempts: u16,
    default_requeue_delay: Duration,
    token: CancellationToken,
) {
    loop {
        let message = {
            let mut rx = incoming_rx.lock().await;
            tokio::select! {
                _ = token.cancelled() => None,
                m = rx.recv() => m,
            }
        };
        let Some(message) = message else { break };

        let attempts = message.attempts;
        let (mut message, result) = handler.handle(message).await;
        if message.auto_response_disabled() {
            continue;
        }

        match result {
            Ok(()) => message.finish(),
            Err(err) if attempts >= max_attempts => {
                warn!(
                    "message exceeded max_attempts, finishing instead of requeuing: attempts={attempts}, max_attempts={max_attempts}, error={err}"
                );
                message.finish();
            }
            Err(err) => {
                debug!("handler failed, requeuing message: error={err}");
                message.requeue(default_requeue_delay, true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config::default().with_max_in_flight(4)
    }

    #[tokio::test]
    async fn connect_without_handler_is_rejected() {
        let consumer = Consumer::new("events", "workers", test_config()).unwrap();
        let err = consumer.connect_to_nsqd("127.0.0.1:1".parse().unwrap()).await.unwrap_err();
        assert!(matches!(err, ConsumerError::NoHandlers));
        consumer.stop().await;
    }

    struct NoopHandler;
    impl MessageHandler for NoopHandler {
        fn handle(&self, message: Message) -> HandlerFuture {
            Box::pin(async move { (message, Ok(())) })
        }
    }

    #[tokio::test]
    async fn disconnect_from_unknown_nsqd_errors() {
        let consumer = Consumer::new("events", "workers", test_config()).unwrap();
        consumer.add_handler(Arc::new(NoopHandler), 1).await;
        let err = consumer.disconnect_from_nsqd("127.0.0.1:1".parse().unwrap()).await.unwrap_err();
        assert!(matches!(err, ConsumerError::NotConnected(_)));
        consumer.stop().await;
    }

    #[tokio::test]
    async fn disconnect_last_lookup_endpoint_is_refused() {
        let consumer = Consumer::new("events", "workers", test_config()).unwrap();
        consumer.add_handler(Arc::new(NoopHandler), 1).await;
        consumer.connect_to_lookupd("http://127.0.0.1:4161").await.unwrap();
        let err = consumer.disconnect_from_lookupd("http://127.0.0.1:4161").await.unwrap_err();
        assert!(matches!(err, ConsumerError::LastLookupEndpoint));
        consumer.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let consumer = Consumer::new("events", "workers", test_config()).unwrap();
        consumer.add_handler(Arc::new(NoopHandler), 1).await;
        consumer.stop().await;
        consumer.stop().await;
    }
}
