use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    sync::Arc,
};

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, info_span, trace, warn};

use crate::{
    chunk_queue,
    connection::Connection,
    runtime::{self, default_runtime, AsyncUdpSocket, Runtime},
    Application, Chunk, ChunkReader, ChunkWriter, ClientConfig, ConnectionHandle, ConnectionId,
    ConnectionStats, Engine, EngineConnection, EngineError, SendScheduler, SendStats,
    TimeoutDriver, MAX_DATAGRAM_SIZE, MAX_SEND_UDP_PAYLOAD,
};

/// Drives a single outgoing connection
///
/// Application data flows through [`ClientStreams`]: bytes written to `send` go out on the
/// configured stream once the handshake completes, and everything the server sends on any
/// stream arrives on `recv`. The connection is closed once the server finishes its stream.
pub struct Client<E: Engine> {
    conn: Connection<E::Connection>,
    socket: Arc<dyn AsyncUdpSocket>,
    timers: TimeoutDriver,
    stream_id: u64,
    outbound: ChunkReader,
    /// Outbound data the stream had no room for yet
    unsent: Option<Chunk>,
    outbound_done: bool,
    inbound: Forward,
    established: bool,
    recv_buf: Box<[u8]>,
    send_buf: Box<[u8]>,
    stream_buf: Box<[u8]>,
}

/// The application side of a [`Client`]
#[derive(Debug)]
pub struct ClientStreams {
    /// Bytes to send to the server
    pub send: ChunkWriter,
    /// Bytes received from the server
    pub recv: ChunkReader,
}

impl<E: Engine> Client<E> {
    /// Start a connection to `server` over `socket`
    ///
    /// The first flight is queued before this returns. Must be called from within the runtime.
    pub fn connect(
        mut engine: E,
        socket: Arc<dyn AsyncUdpSocket>,
        runtime: Arc<dyn Runtime>,
        server: SocketAddr,
        config: ClientConfig,
    ) -> Result<(Self, ClientStreams), ClientError> {
        let local = socket.local_addr()?;
        let scid = ConnectionId::random(&mut rand::thread_rng());
        let engine_conn = engine.connect(config.server_name.as_deref(), &scid, local, server)?;
        debug!(%scid, %local, %server, "connecting");

        let sender = SendScheduler::spawn(
            &runtime,
            socket.clone(),
            Arc::new(SendStats::default()),
            info_span!("client", %scid),
        );
        let mut conn = Connection::new(
            ConnectionHandle::new(scid, 0),
            engine_conn,
            server,
            local,
            sender,
        );
        let timers = TimeoutDriver::new(runtime);
        let mut send_buf = vec![0; MAX_SEND_UDP_PAYLOAD].into_boxed_slice();
        conn.flush(&mut send_buf);
        conn.arm_timer(&timers);

        let (send, outbound) = chunk_queue();
        let (inbound, recv) = chunk_queue();
        let client = Self {
            conn,
            socket,
            timers,
            stream_id: config.stream_id,
            outbound,
            unsent: None,
            outbound_done: false,
            inbound: Forward {
                tx: inbound,
                peer_finished: false,
            },
            established: false,
            recv_buf: vec![0; MAX_DATAGRAM_SIZE].into_boxed_slice(),
            send_buf,
            stream_buf: vec![0; MAX_DATAGRAM_SIZE].into_boxed_slice(),
        };
        Ok((client, ClientStreams { send, recv }))
    }

    /// Bind an ephemeral local port and connect to `server` using the ambient runtime
    pub fn bind(
        engine: E,
        server: SocketAddr,
        config: ClientConfig,
    ) -> Result<(Self, ClientStreams), ClientError> {
        let runtime = default_runtime().ok_or(ClientError::NoRuntime)?;
        let local: SocketAddr = match server {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = runtime.wrap_udp_socket(UdpSocket::bind(local)?)?;
        Self::connect(engine, socket, runtime, server, config)
    }

    /// Drive the connection until it closes
    ///
    /// Returns the engine's counters for the connection, or [`ClientError::TimedOut`] if it
    /// closed before the handshake completed.
    pub async fn run(mut self) -> Result<ConnectionStats, ClientError> {
        while !self.conn.is_closed() {
            let may_send = self.established && self.unsent.is_none() && !self.outbound_done;
            tokio::select! {
                result = runtime::recv_from(&*self.socket, &mut self.recv_buf) => match result {
                    Ok((len, from)) if len >= self.recv_buf.len() => {
                        debug!(%from, len, "datagram may be truncated");
                    }
                    Ok((len, from)) => self.on_datagram(len, from),
                    Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {}
                    Err(e) => {
                        warn!("failed to receive: {e}");
                        return Err(e.into());
                    }
                },
                expired = self.timers.expired() => {
                    if self.conn.on_timeout(expired.epoch) {
                        self.conn.flush(&mut self.send_buf);
                        self.conn.arm_timer(&self.timers);
                    }
                }
                chunk = self.outbound.read(), if may_send => {
                    match chunk {
                        Some(chunk) => {
                            self.unsent = Some(chunk);
                            self.push_outbound();
                        }
                        None => self.outbound_done = true,
                    }
                    self.conn.flush(&mut self.send_buf);
                    self.conn.arm_timer(&self.timers);
                }
            }
        }

        let stats = self.conn.stats();
        info!("connection closed: {stats}");
        if !self.established {
            return Err(ClientError::TimedOut);
        }
        Ok(stats)
    }

    fn on_datagram(&mut self, len: usize, from: SocketAddr) {
        if let Err(e) = self.conn.receive(&mut self.recv_buf[..len], from) {
            debug!(%from, "engine rejected datagram: {e}");
            return;
        }
        if !self.established && self.conn.is_established() {
            self.established = true;
            info!(cid = %self.conn.cid(), "handshake completed");
        }
        self.conn
            .drain_readable(&mut self.inbound, &mut self.stream_buf);
        if self.inbound.peer_finished && !self.conn.is_closed() {
            trace!("server finished its stream, closing");
            if let Err(e) = self.conn.close(true, 0, b"") {
                debug!("failed to close: {e}");
            }
        } else if self.established {
            self.push_outbound();
        }
        self.conn.flush(&mut self.send_buf);
        self.conn.arm_timer(&self.timers);
    }

    /// Queue as much outbound data as the stream accepts
    fn push_outbound(&mut self) {
        loop {
            let chunk = match self.unsent.take() {
                Some(chunk) => chunk,
                None if self.outbound_done => return,
                None => match self.outbound.try_read() {
                    Some(chunk) => chunk,
                    None => return,
                },
            };
            let written = match self
                .conn
                .engine_mut()
                .stream_send(self.stream_id, &chunk.data, chunk.fin)
            {
                Ok(written) => written,
                Err(e) => {
                    warn!(stream_id = self.stream_id, "failed to send: {e}");
                    self.outbound_done = true;
                    return;
                }
            };
            if written < chunk.data.len() {
                self.unsent = Some(Chunk {
                    data: chunk.data.slice(written..),
                    fin: chunk.fin,
                });
                return;
            }
            if chunk.fin {
                self.outbound_done = true;
                return;
            }
        }
    }

    /// The connection ID the client chose for itself
    pub fn cid(&self) -> ConnectionId {
        self.conn.cid()
    }
}

/// Forwards every received chunk to the application's inbound queue
#[derive(Debug)]
struct Forward {
    tx: ChunkWriter,
    peer_finished: bool,
}

impl Application for Forward {
    fn on_stream_data<C: EngineConnection>(
        &mut self,
        _conn: &mut C,
        stream_id: u64,
        data: &[u8],
        fin: bool,
    ) -> Result<(), EngineError> {
        let chunk = Chunk {
            data: Bytes::copy_from_slice(data),
            fin,
        };
        if self.tx.write_chunk(chunk).is_err() {
            trace!(stream_id, "inbound queue closed, discarding");
        }
        if fin {
            self.peer_finished = true;
        }
        Ok(())
    }
}

/// Errors that end a [`Client`]
#[derive(Debug, Error)]
pub enum ClientError {
    /// The socket failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The engine could not start the connection
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    /// No async runtime was found
    #[error("no async runtime found")]
    NoRuntime,
    /// The connection closed before the handshake completed
    #[error("connection timed out before the handshake completed")]
    TimedOut,
}
