use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{trace, warn, Instrument, Span};

use crate::{
    runtime::{self, AsyncUdpSocket, Runtime},
    EngineConnection,
};

/// A fully encoded datagram waiting for the socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPacket {
    /// Encoded datagram
    pub contents: Bytes,
    /// Where it goes
    pub destination: SocketAddr,
    /// Earliest time it may leave, for paced sends
    pub not_before: Option<Instant>,
}

/// Counters shared by every send pipeline of an endpoint
#[derive(Debug, Default)]
pub struct SendStats {
    datagrams: AtomicU64,
    bytes: AtomicU64,
    failures: AtomicU64,
}

impl SendStats {
    /// Datagrams the socket accepted
    pub fn datagrams(&self) -> u64 {
        self.datagrams.load(Ordering::Relaxed)
    }

    /// Bytes the socket accepted
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Datagrams the socket refused
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Serializes one connection's outbound packets onto a shared socket
///
/// Packets are handed to a dedicated pipeline task, which writes them in the order they were
/// enqueued and never has more than one write in flight. A pacing deadline holds back that packet
/// and every packet behind it, but nothing belonging to another pipeline.
///
/// Cloning yields another handle to the same pipeline. The pipeline finishes the packets already
/// queued and exits once every handle is dropped.
#[derive(Debug, Clone)]
pub struct SendScheduler {
    tx: mpsc::UnboundedSender<Command>,
}

#[derive(Debug)]
enum Command {
    Send(PendingPacket),
    /// Signalled once every packet queued before it has been handed to the socket
    Barrier(oneshot::Sender<()>),
}

impl SendScheduler {
    /// Start a pipeline writing to `socket`
    pub fn spawn(
        runtime: &Arc<dyn Runtime>,
        socket: Arc<dyn AsyncUdpSocket>,
        stats: Arc<SendStats>,
        span: Span,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(Box::pin(
            drive_pipeline(runtime.clone(), socket, rx, stats).instrument(span),
        ));
        Self { tx }
    }

    /// Append `packet` to the pipeline
    pub fn enqueue(&self, packet: PendingPacket) {
        // The pipeline only exits once every sender is gone, so this cannot fail while `self`
        // exists unless the runtime itself is shutting down.
        if self.tx.send(Command::Send(packet)).is_err() {
            trace!("send pipeline gone, dropping packet");
        }
    }

    /// Resolves once every packet enqueued so far has been written or has failed
    ///
    /// Also resolves, with an error, if the pipeline is gone.
    pub fn flushed(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        // On failure `tx` is dropped with the command, which resolves `rx`
        let _ = self.tx.send(Command::Barrier(tx));
        rx
    }

    /// Move every packet `conn` currently wants to send into the pipeline
    ///
    /// `buf` is scratch space for a single packet. Returns the number of packets enqueued. An
    /// engine error ends the drain early; the packets produced before it are still sent.
    pub fn drain<C: EngineConnection>(&self, conn: &mut C, buf: &mut [u8]) -> usize {
        let mut count = 0;
        loop {
            match conn.next_outgoing_packet(buf) {
                Ok(Some((len, info))) => {
                    self.enqueue(PendingPacket {
                        contents: Bytes::copy_from_slice(&buf[..len]),
                        destination: info.to,
                        not_before: info.at,
                    });
                    count += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("failed to produce packet: {e}");
                    break;
                }
            }
        }
        count
    }
}

async fn drive_pipeline(
    runtime: Arc<dyn Runtime>,
    socket: Arc<dyn AsyncUdpSocket>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    stats: Arc<SendStats>,
) {
    while let Some(command) = rx.recv().await {
        let packet = match command {
            Command::Send(packet) => packet,
            Command::Barrier(done) => {
                let _ = done.send(());
                continue;
            }
        };
        if let Some(deadline) = packet.not_before {
            if deadline > runtime.now() {
                runtime::sleep_until(&*runtime, deadline).await;
            }
        }
        match runtime::send_to(&*socket, &packet.contents, packet.destination).await {
            Ok(_) => {
                stats.datagrams.fetch_add(1, Ordering::Relaxed);
                stats
                    .bytes
                    .fetch_add(packet.contents.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                // Loss recovery in the engine retransmits whatever this datagram carried
                warn!(destination = %packet.destination, "send failed: {e}");
                stats.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    trace!("send pipeline drained");
}
