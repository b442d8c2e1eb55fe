use std::net::SocketAddr;

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::{
    Application, ConnectionHandle, ConnectionId, ConnectionStats, EngineConnection, EngineError,
    RecvInfo, SendScheduler, TimeoutDriver, TimerState,
};

/// Orchestration state of one QUIC connection
///
/// Owns the engine's per-connection state together with everything needed to feed it: where the
/// peer is, the pipeline its packets leave through, and its timer.
#[derive(Debug)]
pub struct Connection<C> {
    handle: ConnectionHandle,
    engine: C,
    peer: SocketAddr,
    local: SocketAddr,
    timer: TimerState,
    sender: SendScheduler,
}

impl<C: EngineConnection> Connection<C> {
    pub(crate) fn new(
        handle: ConnectionHandle,
        engine: C,
        peer: SocketAddr,
        local: SocketAddr,
        sender: SendScheduler,
    ) -> Self {
        Self {
            handle,
            engine,
            peer,
            local,
            timer: TimerState::default(),
            sender,
        }
    }

    /// Feed one datagram to the engine
    ///
    /// An error only means this datagram was rejected; the connection itself is unaffected.
    pub fn receive(&mut self, datagram: &mut [u8], from: SocketAddr) -> Result<usize, EngineError> {
        let info = RecvInfo {
            from,
            to: self.local,
        };
        let read = self.engine.recv(datagram, info)?;
        trace!(cid = %self.handle.cid(), read, "processed datagram");
        Ok(read)
    }

    /// Hand everything readable to `app`
    ///
    /// Does nothing until the handshake has completed. Each readable stream is read until it runs
    /// dry or reaches its FIN. Returns the number of chunks delivered.
    pub fn drain_readable<A: Application>(&mut self, app: &mut A, buf: &mut [u8]) -> usize {
        if !self.engine.is_established() {
            return 0;
        }
        let readable = self.engine.readable_streams().collect::<Vec<_>>();
        let mut chunks = 0;
        for stream_id in readable {
            loop {
                let (len, fin) = match self.engine.stream_recv(stream_id, buf) {
                    Ok(Some(read)) => read,
                    Ok(None) => break,
                    Err(e) => {
                        debug!(cid = %self.handle.cid(), stream_id, "stream read failed: {e}");
                        break;
                    }
                };
                chunks += 1;
                if let Err(e) = app.on_stream_data(&mut self.engine, stream_id, &buf[..len], fin) {
                    debug!(cid = %self.handle.cid(), stream_id, "application failed: {e}");
                }
                if fin || len == 0 {
                    break;
                }
            }
        }
        chunks
    }

    /// Move every packet the engine wants to send into the send pipeline
    pub fn flush(&mut self, buf: &mut [u8]) -> usize {
        self.sender.drain(&mut self.engine, buf)
    }

    /// Resolves once everything flushed so far has left through the send pipeline
    pub fn flushed(&self) -> oneshot::Receiver<()> {
        self.sender.flushed()
    }

    /// Arm the timer from the engine's next timeout
    pub fn arm_timer(&mut self, driver: &TimeoutDriver) {
        driver.arm(self.handle, &mut self.timer, &self.engine);
    }

    /// Process a timer expiry
    ///
    /// Returns `false`, without touching the engine, if `epoch` is not the armed timer.
    pub fn on_timeout(&mut self, epoch: u64) -> bool {
        if !self.timer.fire(epoch) {
            return false;
        }
        self.engine.on_timeout();
        true
    }

    /// Start closing the connection
    pub fn close(&mut self, app: bool, error_code: u64, reason: &[u8]) -> Result<(), EngineError> {
        self.engine.close(app, error_code, reason)
    }

    /// Whether the engine considers the connection finished
    pub fn is_closed(&self) -> bool {
        self.engine.is_closed()
    }

    /// Whether the handshake has completed
    pub fn is_established(&self) -> bool {
        self.engine.is_established()
    }

    /// The engine's counters for this connection
    pub fn stats(&self) -> ConnectionStats {
        self.engine.stats()
    }

    /// Whether a timer is armed
    pub fn timer_active(&self) -> bool {
        self.timer.is_active()
    }

    /// The handle the connection is reachable by
    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    /// The connection ID datagrams for this connection carry
    pub fn cid(&self) -> ConnectionId {
        self.handle.cid()
    }

    /// The peer's address
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// The engine's state
    pub fn engine(&self) -> &C {
        &self.engine
    }

    /// The engine's state, mutably
    pub fn engine_mut(&mut self) -> &mut C {
        &mut self.engine
    }
}
