use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::connection::ConnectionShared;
use crate::delegate::ConnectionDelegate;

/// The channel and shared state a [`Message`] uses to route FIN/REQ/TOUCH
/// back to the connection that delivered it. Holding only a sender (not the
/// connection task itself) mirrors the "weak endpoint reference" the data
/// model calls for: if the connection has already torn down, sends simply
/// fail and are logged, they never keep the connection's task alive.
#[derive(Clone)]
pub(crate) struct Acker {
    pub addr: SocketAddr,
    pub cmd_tx: mpsc::Sender<Vec<u8>>,
    pub shared: Arc<ConnectionShared>,
    pub delegate: Arc<dyn ConnectionDelegate>,
}

/// One delivered, not-yet-acknowledged message.
///
/// Owned by exactly one handler worker at a time; `finish`/`requeue` may be
/// called at most once apiece (enforced by the `finished` flag), `touch` may
/// be called any number of times before either.
pub struct Message {
    pub id: [u8; 16],
    pub timestamp_ns: i64,
    pub attempts: u16,
    pub body: Vec<u8>,
    pub nsqd_address: SocketAddr,
    pub(crate) acker: Option<Acker>,
    finished: bool,
    auto_response_disabled: bool,
}

impl Message {
    pub(crate) fn new(
        id: [u8; 16],
        timestamp_ns: i64,
        attempts: u16,
        body: Vec<u8>,
        nsqd_address: SocketAddr,
        acker: Acker,
    ) -> Self {
        Self {
            id,
            timestamp_ns,
            attempts,
            body,
            nsqd_address,
            acker: Some(acker),
            finished: false,
            auto_response_disabled: false,
        }
    }

    pub fn id_hex(&self) -> String {
        self.id.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn has_responded(&self) -> bool {
        self.finished
    }

    pub fn auto_response_disabled(&self) -> bool {
        self.auto_response_disabled
    }

    /// Opts this message out of the dispatcher's automatic FIN-on-success /
    /// REQ-on-error behavior; the handler becomes responsible for calling
    /// `finish`/`requeue` itself, possibly after returning.
    pub fn disable_auto_response(&mut self) {
        self.auto_response_disabled = true;
    }

    /// Sends `FIN`. Idempotent: a second call is a no-op.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        let Some(acker) = self.acker.take() else { return };
        let frame = nsq_proto::command::fin(&self.id);
        if acker.cmd_tx.try_send(frame).is_err() {
            warn!(
                "failed to send FIN, connection write queue closed: addr={}, id={}",
                acker.addr,
                self.id_hex()
            );
        }
        acker.shared.messages_in_flight.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        acker.delegate.on_finish(acker.addr);
    }

    /// Sends `REQ` with the given delay. `backoff` signals the RDY controller
    /// that this failure should count toward the shared backoff counter.
    pub fn requeue(&mut self, delay: Duration, backoff: bool) {
        if self.finished {
            return;
        }
        self.finished = true;

        let Some(acker) = self.acker.take() else { return };
        let frame = nsq_proto::command::req(&self.id, delay);
        if acker.cmd_tx.try_send(frame).is_err() {
            warn!(
                "failed to send REQ, connection write queue closed: addr={}, id={}",
                acker.addr,
                self.id_hex()
            );
        }
        acker.shared.messages_in_flight.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        acker.delegate.on_requeue(acker.addr, backoff);
    }

    /// Sends `TOUCH`, extending the server-side visibility timeout. May be
    /// called any number of times before the message is finished or requeued.
    pub fn touch(&mut self) {
        if self.finished {
            return;
        }
        let Some(acker) = self.acker.as_ref() else { return };
        let frame = nsq_proto::command::touch(&self.id);
        if acker.cmd_tx.try_send(frame).is_err() {
            debug!(
                "failed to send TOUCH, connection write queue closed: addr={}, id={}",
                acker.addr,
                self.id_hex()
            );
            return;
        }
        acker.delegate.on_touch(acker.addr);
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id_hex())
            .field("attempts", &self.attempts)
            .field("body_len", &self.body.len())
            .field("nsqd_address", &self.nsqd_address)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::ConnectionDelegate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDelegate {
        finishes: AtomicUsize,
        requeues: AtomicUsize,
        touches: AtomicUsize,
    }

    impl ConnectionDelegate for CountingDelegate {
        fn on_message(&self, _addr: SocketAddr) {}
        fn on_response(&self, _addr: SocketAddr, _payload: &[u8]) {}
        fn on_error(&self, _addr: SocketAddr, _payload: &[u8]) {}
        fn on_heartbeat(&self, _addr: SocketAddr) {}
        fn on_close(&self, _addr: SocketAddr) {}
        fn on_finish(&self, _addr: SocketAddr) {
            self.finishes.fetch_add(1, Ordering::SeqCst);
        }
        fn on_requeue(&self, _addr: SocketAddr, _backoff: bool) {
            self.requeues.fetch_add(1, Ordering::SeqCst);
        }
        fn on_touch(&self, _addr: SocketAddr) {
            self.touches.fetch_add(1, Ordering::SeqCst);
        }
        fn on_io_error(&self, _addr: SocketAddr) {}
    }

    fn make_message() -> (Message, mpsc::Receiver<Vec<u8>>, Arc<CountingDelegate>) {
        let (tx, rx) = mpsc::channel(8);
        let delegate = Arc::new(CountingDelegate {
            finishes: AtomicUsize::new(0),
            requeues: AtomicUsize::new(0),
            touches: AtomicUsize::new(0),
        });
        let shared = Arc::new(ConnectionShared::default());
        shared.messages_in_flight.store(1, Ordering::SeqCst);
        let acker = Acker {
            addr: "127.0.0.1:4150".parse().unwrap(),
            cmd_tx: tx,
            shared,
            delegate: delegate.clone(),
        };
        let msg = Message::new(
            *b"0123456789abcdef",
            0,
            1,
            b"hello".to_vec(),
            "127.0.0.1:4150".parse().unwrap(),
            acker,
        );
        (msg, rx, delegate)
    }

    #[test]
    fn finish_sends_fin_exactly_once() {
        let (mut msg, mut rx, delegate) = make_message();
        msg.finish();
        msg.finish();
        assert!(msg.has_responded());
        assert_eq!(delegate.finishes.load(Ordering::SeqCst), 1);
        let frame = rx.try_recv().unwrap();
        assert!(frame.starts_with(b"FIN "));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn requeue_after_finish_is_noop() {
        let (mut msg, mut rx, delegate) = make_message();
        msg.finish();
        msg.requeue(Duration::from_secs(1), true);
        assert_eq!(delegate.finishes.load(Ordering::SeqCst), 1);
        assert_eq!(delegate.requeues.load(Ordering::SeqCst), 0);
        let _ = rx.try_recv().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn touch_does_not_finish_message() {
        let (mut msg, mut rx, delegate) = make_message();
        msg.touch();
        msg.touch();
        assert!(!msg.has_responded());
        assert_eq!(delegate.touches.load(Ordering::SeqCst), 2);
        assert!(rx.try_recv().unwrap().starts_with(b"TOUCH "));
        assert!(rx.try_recv().unwrap().starts_with(b"TOUCH "));
    }
}
