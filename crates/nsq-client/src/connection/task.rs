use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use nsq_proto::FrameType;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handshake::handshake;
use super::stream::BoxedStream;
use super::{ConnectionHandle, ConnectionShared, ConnectionState, now_ms};
use crate::config::Config;
use crate::delegate::ConnectionDelegate;
use crate::error::ConsumerError;
use crate::message::{Acker, Message};

/// Errors whose `E_*` prefix means the server considers the connection dead,
/// not merely this one command rejected.
const FATAL_ERROR_PREFIXES: [&str; 4] =
    ["E_INVALID", "E_BAD_TOPIC", "E_BAD_CHANNEL", "E_AUTH_FAILED"];

/// Runs the handshake, then spawns the read and write loop tasks, returning
/// a handle the rest of the consumer can hold without ever touching the
/// socket or the tasks directly.
pub(crate) async fn connect(
    addr: SocketAddr,
    topic: Arc<str>,
    channel: Arc<str>,
    config: Arc<Config>,
    delegate: Arc<dyn ConnectionDelegate>,
    incoming_tx: mpsc::Sender<Message>,
    parent_token: CancellationToken,
) -> Result<ConnectionHandle, ConsumerError> {
    let (stream, identify) = handshake(addr, &topic, &channel, &config).await?;

    let shared = Arc::new(ConnectionShared::new(identify.max_rdy_count));
    shared.last_heartbeat_at_ms.store(now_ms(), Ordering::SeqCst);
    shared.set_state(ConnectionState::Subscribed);

    let (cmd_tx, cmd_rx) = mpsc::channel::<Vec<u8>>(256);
    let token = parent_token.child_token();

    let (read_half, write_half) = tokio::io::split(stream);

    let write_task = tokio::spawn(run_write_loop(write_half, cmd_rx, token.clone(), config.clone(), addr));
    let read_task = tokio::spawn(run_read_loop(
        read_half,
        addr,
        shared.clone(),
        delegate.clone(),
        incoming_tx,
        cmd_tx.clone(),
        config.clone(),
        identify.heartbeat_interval,
        token.clone(),
    ));

    let close_shared = shared.clone();
    let close_delegate = delegate.clone();
    let join = tokio::spawn(async move {
        let _ = tokio::join!(read_task, write_task);
        close_shared.set_state(ConnectionState::Closed);
        close_delegate.on_close(addr);
        info!("connection closed: addr={addr}");
    });

    Ok(ConnectionHandle { addr, cmd_tx, shared, cancel: token, identify, join })
}

async fn run_write_loop(
    mut write_half: WriteHalf<BoxedStream>,
    mut cmd_rx: mpsc::Receiver<Vec<u8>>,
    token: CancellationToken,
    config: Arc<Config>,
    addr: SocketAddr,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            maybe_cmd = cmd_rx.recv() => {
                let Some(cmd) = maybe_cmd else { break };
                match timeout(config.write_timeout, write_half.write_all(&cmd)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        warn!("write failed, closing connection: addr={addr}, error={err}");
                        token.cancel();
                        break;
                    }
                    Err(_) => {
                        warn!("write timed out, closing connection: addr={addr}");
                        token.cancel();
                        break;
                    }
                }
                if let Err(err) = write_half.flush().await {
                    warn!("flush failed, closing connection: addr={addr}, error={err}");
                    token.cancel();
                    break;
                }
            }
        }
    }
    let _ = write_half.shutdown().await;
}

#[allow(clippy::too_many_arguments)]
async fn run_read_loop(
    mut read_half: ReadHalf<BoxedStream>,
    addr: SocketAddr,
    shared: Arc<ConnectionShared>,
    delegate: Arc<dyn ConnectionDelegate>,
    incoming_tx: mpsc::Sender<Message>,
    cmd_tx: mpsc::Sender<Vec<u8>>,
    config: Arc<Config>,
    heartbeat_interval_ms: i64,
    token: CancellationToken,
) {
    let heartbeat_interval = if heartbeat_interval_ms > 0 {
        Duration::from_millis(heartbeat_interval_ms as u64)
    } else {
        config.heartbeat_interval
    };
    let heartbeat_timeout_ms = heartbeat_interval.as_millis() as i64 * 2;
    let mut watchdog = interval(heartbeat_interval);
    watchdog.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = watchdog.tick() => {
                let last = shared.last_heartbeat_at_ms.load(Ordering::SeqCst);
                if last != 0 && now_ms() - last > heartbeat_timeout_ms {
                    warn!("missed heartbeat, closing connection: addr={addr}");
                    delegate.on_io_error(addr);
                    token.cancel();
                    break;
                }
            }
            frame = nsq_proto::frame::read_frame_async(&mut read_half, config.max_frame_size) => {
                match frame {
                    Ok((frame_type, payload)) => {
                        if !dispatch(
                            frame_type, payload, addr, &shared, &delegate, &incoming_tx, &cmd_tx,
                        ).await {
                            token.cancel();
                            break;
                        }
                    }
                    Err(err) => {
                        warn!("read failed, closing connection: addr={addr}, error={err}");
                        delegate.on_io_error(addr);
                        token.cancel();
                        break;
                    }
                }
            }
        }
    }
}

/// Handles one decoded frame. Returns `false` when the connection should
/// close as a result (a fatal protocol error or a channel teardown).
async fn dispatch(
    frame_type: FrameType,
    payload: Vec<u8>,
    addr: SocketAddr,
    shared: &Arc<ConnectionShared>,
    delegate: &Arc<dyn ConnectionDelegate>,
    incoming_tx: &mpsc::Sender<Message>,
    cmd_tx: &mpsc::Sender<Vec<u8>>,
) -> bool {
    match frame_type {
        FrameType::Response => {
            if payload == nsq_proto::HEARTBEAT {
                shared.last_heartbeat_at_ms.store(now_ms(), Ordering::SeqCst);
                let _ = cmd_tx.try_send(nsq_proto::command::nop());
                delegate.on_heartbeat(addr);
            } else {
                delegate.on_response(addr, &payload);
            }
            true
        }
        FrameType::Error => {
            delegate.on_error(addr, &payload);
            let text = String::from_utf8_lossy(&payload);
            let fatal = FATAL_ERROR_PREFIXES.iter().any(|prefix| text.starts_with(prefix));
            if fatal {
                warn!("fatal protocol error, closing connection: addr={addr}, error={text}");
            }
            !fatal
        }
        FrameType::Message => match nsq_proto::decode_message_payload(&payload) {
            Ok((timestamp_ns, attempts, id, body)) => {
                shared.messages_in_flight.fetch_add(1, Ordering::SeqCst);
                shared.current_rdy_count.fetch_sub(1, Ordering::SeqCst);
                shared.last_message_at_ms.store(now_ms(), Ordering::SeqCst);

                let acker = Acker {
                    addr,
                    cmd_tx: cmd_tx.clone(),
                    shared: shared.clone(),
                    delegate: delegate.clone(),
                };
                let message = Message::new(id, timestamp_ns, attempts, body.to_vec(), addr, acker);
                delegate.on_message(addr);
                if incoming_tx.send(message).await.is_err() {
                    debug!("incoming queue closed, dropping message: addr={addr}");
                }
                true
            }
            Err(err) => {
                warn!("malformed message frame, closing connection: addr={addr}, error={err}");
                false
            }
        },
    }
}
