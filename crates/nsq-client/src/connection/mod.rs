mod handshake;
mod stream;
mod task;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use nsq_proto::IdentifyResponse;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub(crate) use task::connect;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    Subscribed,
    Closing,
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Handshaking,
            1 => ConnectionState::Subscribed,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Handshaking => 0,
            ConnectionState::Subscribed => 1,
            ConnectionState::Closing => 2,
            ConnectionState::Closed => 3,
        }
    }
}

/// State a connection's two tasks (read loop, write loop) share with the
/// RDY controller and the rest of the consumer, all mutated only via atomics
/// so no task ever holds a lock across network I/O.
pub(crate) struct ConnectionShared {
    pub state: AtomicU8,
    pub last_rdy_count: AtomicI64,
    pub current_rdy_count: AtomicI64,
    pub max_rdy_count: AtomicI64,
    pub messages_in_flight: AtomicI64,
    pub last_message_at_ms: AtomicI64,
    pub last_heartbeat_at_ms: AtomicI64,
    pub closing: AtomicBool,
}

impl ConnectionShared {
    pub fn new(max_rdy_count: i64) -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Handshaking.as_u8()),
            last_rdy_count: AtomicI64::new(0),
            current_rdy_count: AtomicI64::new(0),
            max_rdy_count: AtomicI64::new(max_rdy_count.max(1)),
            messages_in_flight: AtomicI64::new(0),
            last_message_at_ms: AtomicI64::new(0),
            last_heartbeat_at_ms: AtomicI64::new(0),
            closing: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
        if state == ConnectionState::Closing || state == ConnectionState::Closed {
            self.closing.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

impl Default for ConnectionShared {
    fn default() -> Self {
        Self::new(2500)
    }
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Everything the rest of the consumer needs to talk to a live connection: a
/// raw-command outbound queue, shared flow-control state, and a cancellation
/// handle. The connection's actual socket and loop tasks are never exposed.
pub struct ConnectionHandle {
    pub addr: SocketAddr,
    pub(crate) cmd_tx: mpsc::Sender<Vec<u8>>,
    pub(crate) shared: Arc<ConnectionShared>,
    pub(crate) cancel: CancellationToken,
    pub(crate) identify: IdentifyResponse,
    pub(crate) join: JoinHandle<()>,
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn last_rdy_count(&self) -> i64 {
        self.shared.last_rdy_count.load(Ordering::SeqCst)
    }

    pub fn messages_in_flight(&self) -> i64 {
        self.shared.messages_in_flight.load(Ordering::SeqCst)
    }

    pub fn current_rdy_count(&self) -> i64 {
        self.shared.current_rdy_count.load(Ordering::SeqCst)
    }

    pub fn max_rdy_count(&self) -> i64 {
        self.shared.max_rdy_count.load(Ordering::SeqCst)
    }

    pub fn last_message_at_ms(&self) -> i64 {
        self.shared.last_message_at_ms.load(Ordering::SeqCst)
    }

    /// Sends a raw, already-encoded command (e.g. from `nsq_proto::command`)
    /// on this connection's write queue. Best-effort: a closed connection
    /// simply drops the command, the caller observes this by the connection
    /// disappearing from the consumer's map shortly after.
    pub(crate) fn send_command(&self, command: Vec<u8>) {
        let _ = self.cmd_tx.try_send(command);
    }

    /// Sends `RDY n` and records it as the last granted count.
    pub(crate) fn send_rdy(&self, n: u32) {
        self.send_command(nsq_proto::command::rdy(n));
        self.shared.last_rdy_count.store(n as i64, Ordering::SeqCst);
        self.shared.current_rdy_count.store(n as i64, Ordering::SeqCst);
    }

    /// Requests a graceful close: `CLS`, then cancellation once in-flight
    /// messages have had a chance to ack or the parent times the wait out.
    pub(crate) fn close(&self) {
        self.shared.set_state(ConnectionState::Closing);
        self.send_command(nsq_proto::command::cls());
        self.cancel.cancel();
    }

    pub(crate) async fn join(self) {
        let _ = self.join.await;
    }
}
