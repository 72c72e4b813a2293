//! TCP listener and per-connection tasks.
//!
//! Each accepted connection gets three tasks:
//!
//! - a reader that decodes lines into a bounded inbound queue and turns
//!   read-idle intervals into echo probes or a read timeout,
//! - a processor that feeds the [`ChannelHandler`] in arrival order and
//!   enforces the handshake deadline,
//! - a writer that drains the outbound queue onto the socket.
//!
//! Closing the connection (from any side) cancels its token; all three
//! tasks watch it.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::{ChannelError, ChannelHandler, Controller};
use crate::core::config::OpenFlowConfig;
use crate::core::error::AppError;
use crate::protocol::{Frame, codec};
use crate::switch::{SendError, SwitchConnection};

struct TcpConnection {
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<Frame>,
    closed: CancellationToken,
}

impl SwitchConnection for TcpConnection {
    fn send(&self, frame: Frame) -> Result<(), SendError> {
        if self.closed.is_cancelled() {
            return Err(SendError::Closed);
        }
        self.tx.send(frame).map_err(|_| SendError::Closed)
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }
}

/// What the reader tells the processor besides frames.
enum Signal {
    Idle,
    Fault(ChannelError),
}

pub async fn bind(addr: &str) -> Result<TcpListener, AppError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::Transport(format!("bind {addr} failed: {e}")))
}

/// Accept switch connections until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    controller: Controller,
    config: OpenFlowConfig,
    shutdown: CancellationToken,
) {
    match listener.local_addr() {
        Ok(addr) => info!(%addr, "switch listener ready"),
        Err(e) => warn!(error = %e, "switch listener ready; local address unknown"),
    }

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("switch listener shutting down");
                break;
            }

            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, error = %e, "could not disable nagle");
                    }
                    tokio::spawn(handle_connection(
                        stream,
                        peer,
                        controller.clone(),
                        config.clone(),
                        shutdown.child_token(),
                    ));
                }
                Err(e) => warn!(error = %e, "switch listener accept error"),
            },
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    controller: Controller,
    config: OpenFlowConfig,
    closed: CancellationToken,
) {
    let (reader, writer) = stream.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let conn = Arc::new(TcpConnection {
        peer,
        tx: out_tx,
        closed: closed.clone(),
    });

    let writer_task = tokio::spawn(write_loop(writer, out_rx, closed.clone()));
    let (in_tx, in_rx) = mpsc::channel(config.inbound_queue);
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let reader_task = tokio::spawn(read_loop(
        reader,
        in_tx,
        signal_tx,
        config.clone(),
        closed.clone(),
    ));

    let handler = controller.channel(conn);
    process_loop(handler, in_rx, signal_rx, config, closed.clone()).await;

    closed.cancel();
    let _ = reader_task.await;
    let _ = writer_task.await;
    debug!(%peer, "connection tasks finished");
}

async fn process_loop(
    mut handler: ChannelHandler,
    mut in_rx: mpsc::Receiver<Frame>,
    mut signal_rx: mpsc::UnboundedReceiver<Signal>,
    config: OpenFlowConfig,
    closed: CancellationToken,
) {
    if let Err(e) = handler.channel_connected() {
        handler.handle_error(&e);
    }

    let deadline = tokio::time::sleep(config.handshake_timeout);
    tokio::pin!(deadline);
    let mut signals_open = true;

    loop {
        tokio::select! {
            biased;

            _ = closed.cancelled() => break,

            signal = signal_rx.recv(), if signals_open => match signal {
                Some(Signal::Idle) => {
                    if let Err(e) = handler.channel_idle() {
                        if !handler.handle_error(&e) {
                            break;
                        }
                    }
                }
                Some(Signal::Fault(e)) => {
                    if !handler.handle_error(&e) {
                        break;
                    }
                }
                None => signals_open = false,
            },

            _ = &mut deadline, if !handler.is_ready() => {
                handler.handle_error(&ChannelError::HandshakeTimeout);
                break;
            }

            frame = in_rx.recv() => match frame {
                Some(frame) => {
                    if !handler.handle_frame(frame).await {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    handler.channel_disconnected();
}

async fn read_loop(
    reader: OwnedReadHalf,
    in_tx: mpsc::Sender<Frame>,
    signal_tx: mpsc::UnboundedSender<Signal>,
    config: OpenFlowConfig,
    closed: CancellationToken,
) {
    let mut lines = BufReader::new(reader).lines();
    let mut last_read = Instant::now();

    loop {
        tokio::select! {
            biased;

            _ = closed.cancelled() => break,

            read = tokio::time::timeout(config.idle_timeout, lines.next_line()) => match read {
                Err(_idle) => {
                    if last_read.elapsed() >= config.read_timeout {
                        let _ = signal_tx.send(Signal::Fault(ChannelError::ReadTimeout));
                        break;
                    }
                    let _ = signal_tx.send(Signal::Idle);
                }
                Ok(Ok(None)) => {
                    debug!("switch closed its end of the connection");
                    break;
                }
                Ok(Ok(Some(line))) => {
                    last_read = Instant::now();
                    if line.trim().is_empty() {
                        continue;
                    }
                    match codec::decode(&line) {
                        Ok(frame) => match in_tx.try_send(frame) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                let _ = signal_tx.send(Signal::Fault(ChannelError::QueueFull));
                            }
                            Err(TrySendError::Closed(_)) => break,
                        },
                        Err(e) => {
                            let _ = signal_tx.send(Signal::Fault(e.into()));
                            break;
                        }
                    }
                }
                Ok(Err(e)) => {
                    let _ = signal_tx.send(Signal::Fault(e.into()));
                    break;
                }
            },
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut out_rx: mpsc::UnboundedReceiver<Frame>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = closed.cancelled() => break,

            frame = out_rx.recv() => {
                let Some(frame) = frame else { break };
                let line = match codec::encode(&frame) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "could not encode outbound message");
                        continue;
                    }
                };
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    debug!(error = %e, "write failed; closing connection");
                    closed.cancel();
                    break;
                }
            }
        }
    }
    let _ = writer.shutdown().await;
}
