use std::{
    future::{poll_fn, Future},
    io,
    net::{SocketAddr, UdpSocket},
    sync::Arc,
};

use rand::{rngs::StdRng, SeedableRng};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, debug_span, info, trace, warn};

use crate::{
    connection::Connection,
    incoming::{Admission, Incoming},
    runtime::{self, default_runtime, AsyncTimer, AsyncUdpSocket, Runtime},
    AddressTokens, Application, ConnectionHandle, ConnectionId, ConnectionTable, Engine,
    EndpointConfig, SendScheduler, SendStats, TimeoutDriver, TimerExpired, LOCAL_CONN_ID_LEN,
    MAX_DATAGRAM_SIZE, MAX_SEND_UDP_PAYLOAD,
};

/// A server endpoint: one socket, one engine, many connections
///
/// All state is owned by the task driving the endpoint; see [`Endpoint::run`]. The synchronous
/// [`Endpoint::handle_datagram`] and [`Endpoint::handle_timeout`] are the two events that task
/// reacts to, exposed so they can be driven directly.
pub struct Endpoint<E: Engine, A> {
    engine: E,
    app: A,
    socket: Arc<dyn AsyncUdpSocket>,
    runtime: Arc<dyn Runtime>,
    local_addr: SocketAddr,
    config: EndpointConfig,
    table: ConnectionTable<Connection<E::Connection>>,
    tokens: AddressTokens,
    timers: TimeoutDriver,
    /// Pipeline for version negotiation and Retry packets, which belong to no connection
    responder: SendScheduler,
    rng: StdRng,
    send_buf: Box<[u8]>,
    stream_buf: Box<[u8]>,
    stats: EndpointStats,
    send_stats: Arc<SendStats>,
    accepting: bool,
}

impl<E: Engine, A: Application> Endpoint<E, A> {
    /// Serve connections on `socket`
    ///
    /// Must be called from within the runtime, which hosts the endpoint's send pipelines and
    /// timers.
    pub fn new(
        engine: E,
        app: A,
        socket: Arc<dyn AsyncUdpSocket>,
        runtime: Arc<dyn Runtime>,
        config: EndpointConfig,
    ) -> io::Result<Self> {
        let local_addr = socket.local_addr()?;
        let send_stats = Arc::new(SendStats::default());
        let responder = SendScheduler::spawn(
            &runtime,
            socket.clone(),
            send_stats.clone(),
            debug_span!("responder", local = %local_addr),
        );
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            engine,
            app,
            timers: TimeoutDriver::new(runtime.clone()),
            socket,
            runtime,
            local_addr,
            tokens: AddressTokens::new(config.token_prefix.clone()),
            config,
            table: ConnectionTable::new(),
            responder,
            rng,
            send_buf: vec![0; MAX_SEND_UDP_PAYLOAD].into_boxed_slice(),
            stream_buf: vec![0; MAX_DATAGRAM_SIZE].into_boxed_slice(),
            stats: EndpointStats::default(),
            send_stats,
            accepting: true,
        })
    }

    /// Bind a UDP socket to `addr` and serve connections on it using the ambient runtime
    pub fn bind(
        engine: E,
        app: A,
        addr: SocketAddr,
        config: EndpointConfig,
    ) -> Result<Self, EndpointError> {
        let runtime = default_runtime().ok_or(EndpointError::NoRuntime)?;
        let socket = runtime.wrap_udp_socket(UdpSocket::bind(addr)?)?;
        Ok(Self::new(engine, app, socket, runtime, config)?)
    }

    /// Process one inbound datagram from `from`
    ///
    /// Never fails: whatever goes wrong only affects this datagram, and is reported through the
    /// returned outcome.
    pub fn handle_datagram(&mut self, datagram: &mut [u8], from: SocketAddr) -> DatagramOutcome {
        self.stats.received += 1;
        let outcome = self.dispatch(datagram, from);
        if let DatagramOutcome::Dropped(reason) = outcome {
            trace!(%from, ?reason, "dropped datagram");
            self.stats.record_drop(reason);
        }
        outcome
    }

    fn dispatch(&mut self, datagram: &mut [u8], from: SocketAddr) -> DatagramOutcome {
        let header = match self.engine.parse_header(datagram, LOCAL_CONN_ID_LEN) {
            Ok(header) => header,
            Err(e) => {
                debug!(%from, "failed to parse header: {e}");
                return DatagramOutcome::Dropped(DropReason::MalformedHeader);
            }
        };
        trace!(%from, ?header, "got datagram");

        let known = ConnectionId::from_slice(&header.dcid).and_then(|cid| self.table.lookup(&cid));
        if let Some(handle) = known {
            return self.deliver(handle, datagram, from);
        }

        let admission = Incoming {
            engine: &mut self.engine,
            tokens: &self.tokens,
            rng: &mut self.rng,
            responder: &self.responder,
            buf: &mut self.send_buf,
            local: self.local_addr,
            accepting: self.accepting,
        }
        .admit(&header, from);

        match admission {
            Admission::Drop(reason) => DatagramOutcome::Dropped(reason),
            Admission::VersionNegotiation => {
                self.stats.version_negotiations += 1;
                DatagramOutcome::VersionNegotiation
            }
            Admission::Retry(new_cid) => {
                self.stats.retries += 1;
                DatagramOutcome::Retry { new_cid }
            }
            Admission::Accept { cid, conn } => {
                let sender = SendScheduler::spawn(
                    &self.runtime,
                    self.socket.clone(),
                    self.send_stats.clone(),
                    debug_span!("conn", %cid),
                );
                let local = self.local_addr;
                let Some(handle) = self.table.insert_with(cid, |handle| {
                    Connection::new(handle, conn, from, local, sender)
                }) else {
                    return DatagramOutcome::Dropped(DropReason::AcceptFailed);
                };
                self.stats.accepted += 1;
                debug!(%cid, peer = %from, "accepted connection");
                match self.deliver(handle, datagram, from) {
                    DatagramOutcome::Delivered(handle) => DatagramOutcome::Accepted(handle),
                    outcome => outcome,
                }
            }
        }
    }

    /// Feed a datagram to a known connection and react to what the engine did with it
    fn deliver(
        &mut self,
        handle: ConnectionHandle,
        datagram: &mut [u8],
        from: SocketAddr,
    ) -> DatagramOutcome {
        let Some(conn) = self.table.get_mut(handle) else {
            return DatagramOutcome::Dropped(DropReason::UnknownConnection);
        };
        let outcome = match conn.receive(datagram, from) {
            Ok(_) => {
                conn.drain_readable(&mut self.app, &mut self.stream_buf);
                DatagramOutcome::Delivered(handle)
            }
            Err(e) => {
                debug!(cid = %handle.cid(), "engine rejected datagram: {e}");
                self.stats.rejected += 1;
                DatagramOutcome::Rejected(handle)
            }
        };
        // Even a rejected datagram may leave the engine with packets to send, and a connection
        // must never sit in the table without a timer
        conn.flush(&mut self.send_buf);
        conn.arm_timer(&self.timers);
        if conn.is_closed() {
            self.reap(handle);
        }
        outcome
    }

    /// Process a timer expiry
    ///
    /// Expiries for connections that are gone, or for timers that were re-armed since, are
    /// ignored.
    pub fn handle_timeout(&mut self, expired: TimerExpired) -> TimeoutOutcome {
        let handle = expired.handle;
        let Some(conn) = self.table.get_mut(handle) else {
            trace!(cid = %handle.cid(), "timer for departed connection");
            return TimeoutOutcome::Stale;
        };
        if !conn.on_timeout(expired.epoch) {
            trace!(cid = %handle.cid(), epoch = expired.epoch, "superseded timer");
            return TimeoutOutcome::Stale;
        }
        conn.flush(&mut self.send_buf);
        if conn.is_closed() {
            self.reap(handle);
            return TimeoutOutcome::Closed;
        }
        conn.arm_timer(&self.timers);
        TimeoutOutcome::Fired
    }

    /// Wait for the next timer expiry
    pub async fn next_expired(&mut self) -> TimerExpired {
        self.timers.expired().await
    }

    fn reap(&mut self, handle: ConnectionHandle) {
        if let Some(conn) = self.table.remove(handle) {
            self.stats.closed += 1;
            info!(cid = %handle.cid(), peer = %conn.peer(), "connection closed: {}", conn.stats());
        }
    }

    /// Remove every closed connection from the table, returning how many were removed
    pub fn sweep(&mut self) -> usize {
        let removed = self.table.sweep(|conn| conn.is_closed());
        for (handle, conn) in &removed {
            info!(cid = %handle.cid(), peer = %conn.peer(), "connection closed: {}", conn.stats());
        }
        self.stats.closed += removed.len() as u64;
        removed.len()
    }

    /// Close every connection and stop accepting new ones
    ///
    /// The resulting CONNECTION_CLOSE packets are queued immediately. Connections stay in the
    /// table until the engine reports them closed.
    pub fn close(&mut self, error_code: u64, reason: &[u8]) {
        self.close_all(error_code, reason);
    }

    /// Close every connection, then wait for the packets this queued to leave
    ///
    /// Waits at most the configured drain timeout. Once this returns, dropping the runtime loses
    /// nothing that was already queued.
    pub async fn shutdown(&mut self, error_code: u64, reason: &[u8]) {
        let pending = self.close_all(error_code, reason);
        let mut timer = self
            .runtime
            .new_timer(self.runtime.now() + self.config.drain_timeout);
        let count = pending.len();
        tokio::select! {
            () = async {
                for flushed in pending {
                    let _ = flushed.await;
                }
            } => trace!(pipelines = count, "send pipelines drained"),
            () = poll_fn(|cx| timer.as_mut().poll(cx)) => {
                warn!(pipelines = count, "gave up waiting for send pipelines to drain");
            }
        }
    }

    /// Close every connection and stop accepting, returning a flush barrier per send pipeline
    fn close_all(&mut self, error_code: u64, reason: &[u8]) -> Vec<oneshot::Receiver<()>> {
        self.accepting = false;
        let mut pending = Vec::with_capacity(self.table.len() + 1);
        for (handle, conn) in self.table.iter_mut() {
            if let Err(e) = conn.close(true, error_code, reason) {
                debug!(cid = %handle.cid(), "failed to close connection: {e}");
            }
            conn.flush(&mut self.send_buf);
            conn.arm_timer(&self.timers);
            pending.push(conn.flushed());
        }
        pending.push(self.responder.flushed());
        self.sweep();
        pending
    }

    /// Drive the endpoint until `shutdown` completes
    ///
    /// On shutdown every connection is closed. Returns the endpoint's statistics, or the socket
    /// error that made receiving impossible.
    pub async fn run_until(
        &mut self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<EndpointStats, EndpointError> {
        tokio::pin!(shutdown);
        let mut recv_buf = vec![0; self.config.recv_buffer_size].into_boxed_slice();
        let interval = self.config.sweep_interval;
        let mut sweep_timer = self.runtime.new_timer(self.runtime.now() + interval);
        loop {
            tokio::select! {
                result = runtime::recv_from(&*self.socket, &mut recv_buf) => match result {
                    Ok((len, from)) if len >= recv_buf.len() => {
                        debug!(%from, len, "datagram may be truncated");
                        self.stats.received += 1;
                        self.stats.record_drop(DropReason::Truncated);
                    }
                    Ok((len, from)) => {
                        self.handle_datagram(&mut recv_buf[..len], from);
                    }
                    // Previously sent datagram was rejected by the peer; nothing to do
                    Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {}
                    Err(e) => {
                        warn!("failed to receive: {e}");
                        return Err(e.into());
                    }
                },
                expired = self.timers.expired() => {
                    self.handle_timeout(expired);
                }
                () = poll_fn(|cx| sweep_timer.as_mut().poll(cx)) => {
                    self.sweep();
                    sweep_timer.as_mut().reset(self.runtime.now() + interval);
                }
                () = &mut shutdown => {
                    info!(connections = self.table.len(), "shutting down");
                    self.shutdown(0, b"server shutdown").await;
                    return Ok(self.stats());
                }
            }
        }
    }

    /// Drive the endpoint forever, or until receiving fails
    pub async fn run(&mut self) -> Result<EndpointStats, EndpointError> {
        self.run_until(std::future::pending()).await
    }

    /// Snapshot of the endpoint's counters
    pub fn stats(&self) -> EndpointStats {
        EndpointStats {
            datagrams_sent: self.send_stats.datagrams(),
            send_failures: self.send_stats.failures(),
            ..self.stats.clone()
        }
    }

    /// The local address the socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connections in the table
    pub fn connection_count(&self) -> usize {
        self.table.len()
    }

    /// Whether a connection is routed by `cid`
    pub fn contains(&self, cid: &ConnectionId) -> bool {
        self.table.contains(cid)
    }

    /// The connection `handle` refers to, if it still exists
    pub fn connection(&self, handle: ConnectionHandle) -> Option<&Connection<E::Connection>> {
        self.table.get(handle)
    }

    /// Whether new connections are accepted
    pub fn is_accepting(&self) -> bool {
        self.accepting
    }
}

/// What became of a datagram handed to [`Endpoint::handle_datagram`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramOutcome {
    /// Silently discarded
    Dropped(DropReason),
    /// Answered with version negotiation
    VersionNegotiation,
    /// Answered with a Retry steering the client to `new_cid`
    Retry {
        /// Connection ID the client must use next
        new_cid: ConnectionId,
    },
    /// A new connection was created and the datagram was its first
    Accepted(ConnectionHandle),
    /// Processed by an existing connection
    Delivered(ConnectionHandle),
    /// The connection's engine refused the datagram; the connection is unaffected
    ///
    /// Also reported when the datagram that created the connection is refused. The connection
    /// then stays in the table with its idle timer armed.
    Rejected(ConnectionHandle),
}

/// Why a datagram was discarded without a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// It filled the receive buffer, so part of it may be missing
    Truncated,
    /// The engine could not parse its header
    MalformedHeader,
    /// It can only belong to an established connection, and there is none
    UnknownConnection,
    /// Its address-validation token was not minted for the sender
    InvalidToken,
    /// Its destination connection ID is not one this endpoint could have issued
    InvalidConnectionIdLength,
    /// The engine refused to create a connection for it
    AcceptFailed,
    /// The engine could not build the response
    PacketBuildFailed,
    /// The endpoint is closing
    NotAccepting,
}

/// What became of a timer expiry handed to [`Endpoint::handle_timeout`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome {
    /// The connection is gone or its timer was re-armed since
    Stale,
    /// The engine processed the timeout and the connection lives on
    Fired,
    /// The timeout closed the connection, which was removed
    Closed,
}

/// Endpoint counters
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EndpointStats {
    /// Datagrams read from the socket
    pub received: u64,
    /// Datagrams answered with version negotiation
    pub version_negotiations: u64,
    /// Datagrams answered with Retry
    pub retries: u64,
    /// Connections created
    pub accepted: u64,
    /// Connections removed after closing
    pub closed: u64,
    /// Datagrams an engine refused
    pub rejected: u64,
    /// Datagrams the socket accepted for sending
    pub datagrams_sent: u64,
    /// Datagrams the socket refused
    pub send_failures: u64,
    drops: FxHashMap<DropReason, u64>,
}

impl EndpointStats {
    /// Datagrams dropped for `reason`
    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.drops.get(&reason).copied().unwrap_or(0)
    }

    /// Datagrams dropped for any reason
    pub fn total_dropped(&self) -> u64 {
        self.drops.values().sum()
    }

    fn record_drop(&mut self, reason: DropReason) {
        *self.drops.entry(reason).or_default() += 1;
    }
}

/// Errors that stop an endpoint
#[derive(Debug, Error)]
pub enum EndpointError {
    /// No async runtime was found
    #[error("no async runtime found")]
    NoRuntime,
    /// The socket failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
