use std::net::SocketAddr;

/// Callback surface a [`Connection`](crate::connection::Connection) uses to
/// reach its owning [`Consumer`](crate::consumer::Consumer) without holding a
/// strong reference back to it. The `Consumer` holds only lightweight command
/// handles for its connections, never an `Arc` cycle through this trait.
pub trait ConnectionDelegate: Send + Sync {
    /// A `Message` frame was decoded and enqueued to the incoming queue.
    fn on_message(&self, addr: SocketAddr);
    /// An in-band `Response` frame other than a heartbeat was received.
    fn on_response(&self, addr: SocketAddr, payload: &[u8]);
    /// An `Error` frame was received.
    fn on_error(&self, addr: SocketAddr, payload: &[u8]);
    /// A `_heartbeat_` response was received and a `NOP` was queued in reply.
    fn on_heartbeat(&self, addr: SocketAddr);
    /// The connection has fully torn down; called exactly once.
    fn on_close(&self, addr: SocketAddr);
    /// A message on this connection was `FIN`'d.
    fn on_finish(&self, addr: SocketAddr);
    /// A message on this connection was `REQ`'d. `backoff` signals the RDY
    /// controller should count this as a failure.
    fn on_requeue(&self, addr: SocketAddr, backoff: bool);
    /// A message on this connection was `TOUCH`'d.
    fn on_touch(&self, addr: SocketAddr);
    /// A transport-level error occurred; the connection is closing itself and
    /// discovery should be nudged to re-probe.
    fn on_io_error(&self, addr: SocketAddr);
}
