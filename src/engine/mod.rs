//! The boundary to the QUIC protocol engine
//!
//! Everything protocol-level lives behind these traits: packet encoding, TLS, loss recovery,
//! congestion control and flow control. The orchestration layer only hands the engine opaque
//! buffers and acts on what it reports back.

use std::{
    fmt,
    net::SocketAddr,
    time::{Duration, Instant},
};

use bytes::Bytes;
use thiserror::Error;

use crate::ConnectionId;

#[cfg(feature = "quiche")]
pub mod quiche;

/// Long or short header packet type, as far as dispatch cares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Client's first flight
    Initial,
    /// Stateless retry
    Retry,
    /// Handshake
    Handshake,
    /// 0-RTT
    ZeroRtt,
    /// Short header, sent once the handshake is complete
    Short,
    /// Version negotiation
    VersionNegotiation,
}

impl PacketType {
    /// Whether a server may answer a packet of this type with version negotiation
    ///
    /// Short headers carry no version, and answering version negotiation with version
    /// negotiation would loop.
    pub fn is_long_handshake(self) -> bool {
        !matches!(self, Self::Short | Self::VersionNegotiation)
    }
}

/// Header fields extracted from an inbound datagram
#[derive(Clone, PartialEq, Eq)]
pub struct Header {
    /// Packet type
    pub ty: PacketType,
    /// Version field, zero for short headers
    pub version: u32,
    /// Destination connection ID
    pub dcid: Bytes,
    /// Source connection ID, empty for short headers
    pub scid: Bytes,
    /// Address-validation token of an Initial packet
    pub token: Option<Bytes>,
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("ty", &self.ty)
            .field("version", &format_args!("{:#010x}", self.version))
            .field("dcid", &Hex(&self.dcid))
            .field("scid", &Hex(&self.scid))
            .field("token_len", &self.token.as_ref().map(|t| t.len()))
            .finish()
    }
}

struct Hex<'a>(&'a [u8]);

impl fmt::Debug for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Addressing of a received datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvInfo {
    /// Peer the datagram came from
    pub from: SocketAddr,
    /// Local address it arrived on
    pub to: SocketAddr,
}

/// Addressing and pacing of a packet the engine wants sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendInfo {
    /// Where to send it
    pub to: SocketAddr,
    /// Not-before deadline, if the engine paces this packet
    pub at: Option<Instant>,
}

/// Counters reported when a connection ends
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Packets received
    pub recv: usize,
    /// Packets sent
    pub sent: usize,
    /// Packets declared lost
    pub lost: usize,
    /// Smoothed round-trip time of the active path
    pub rtt: Option<Duration>,
}

impl fmt::Display for ConnectionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "recv={} sent={} lost={}",
            self.recv, self.sent, self.lost
        )?;
        if let Some(rtt) = self.rtt {
            write!(f, " rtt={rtt:?}")?;
        }
        Ok(())
    }
}

/// Errors reported by the engine
///
/// The engine's "nothing more to do" condition is never an error here; operations that can run
/// dry return `Option` instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The supplied buffer cannot hold the result
    #[error("buffer too short")]
    BufferTooShort,
    /// The packet could not be parsed
    #[error("invalid packet")]
    InvalidPacket,
    /// The packet's version is not supported
    #[error("unknown version")]
    UnknownVersion,
    /// The operation is not valid in the connection's current state
    #[error("invalid state")]
    InvalidState,
    /// Packet protection failed
    #[error("cryptographic operation failed")]
    CryptoFail,
    /// The TLS handshake failed
    #[error("TLS failure")]
    TlsFail,
    /// The stream was stopped or reset by the peer
    #[error("stream {0} is no longer usable")]
    StreamClosed(u64),
    /// Anything else the engine reports
    #[error("{0}")]
    Other(String),
}

/// A QUIC protocol engine
///
/// One engine instance belongs to one endpoint and carries the configuration every connection it
/// creates is built from.
pub trait Engine {
    /// Per-connection engine state
    type Connection: EngineConnection;

    /// Extract the header fields of a datagram
    ///
    /// `dcid_len` is the length of connection IDs in short headers, which do not encode it.
    fn parse_header(&self, datagram: &mut [u8], dcid_len: usize) -> Result<Header, EngineError>;

    /// Whether `version` can be accepted without version negotiation
    fn is_version_supported(&self, version: u32) -> bool;

    /// Write a version negotiation packet answering a client's `scid`/`dcid` into `out`
    fn build_version_negotiation(
        &self,
        scid: &[u8],
        dcid: &[u8],
        out: &mut [u8],
    ) -> Result<usize, EngineError>;

    /// Write a Retry packet into `out`
    ///
    /// `new_cid` becomes the destination connection ID of the client's next Initial.
    fn build_retry(
        &self,
        scid: &[u8],
        dcid: &[u8],
        new_cid: &ConnectionId,
        token: &[u8],
        version: u32,
        out: &mut [u8],
    ) -> Result<usize, EngineError>;

    /// Create server-side state for a connection whose address was validated
    fn accept(
        &mut self,
        scid: &ConnectionId,
        odcid: &[u8],
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Result<Self::Connection, EngineError>;

    /// Create client-side state for a new outgoing connection
    fn connect(
        &mut self,
        server_name: Option<&str>,
        scid: &ConnectionId,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Result<Self::Connection, EngineError>;
}

/// Engine-side state of one connection
pub trait EngineConnection {
    /// Iterator over stream IDs with data to read
    type Readable: Iterator<Item = u64>;

    /// Process one received datagram, returning the number of bytes consumed
    fn recv(&mut self, datagram: &mut [u8], info: RecvInfo) -> Result<usize, EngineError>;

    /// Whether the handshake has completed
    fn is_established(&self) -> bool;

    /// Streams that currently have data to read
    fn readable_streams(&self) -> Self::Readable;

    /// Read from a stream into `out`
    ///
    /// Returns the number of bytes read and whether the stream's FIN was reached, or `None` if
    /// nothing is buffered.
    fn stream_recv(
        &mut self,
        stream_id: u64,
        out: &mut [u8],
    ) -> Result<Option<(usize, bool)>, EngineError>;

    /// Queue `data` on a stream, returning how much of it was accepted
    ///
    /// A stream without flow-control credit accepts zero bytes.
    fn stream_send(&mut self, stream_id: u64, data: &[u8], fin: bool)
        -> Result<usize, EngineError>;

    /// Write the next packet the connection wants to send into `out`
    ///
    /// Returns `None` once there is nothing more to send right now.
    fn next_outgoing_packet(
        &mut self,
        out: &mut [u8],
    ) -> Result<Option<(usize, SendInfo)>, EngineError>;

    /// Time until the connection's next timer event, if any
    fn next_timeout(&self) -> Option<Duration>;

    /// Tell the connection its timer expired
    fn on_timeout(&mut self);

    /// Whether the connection is finished and its state can be dropped
    fn is_closed(&self) -> bool;

    /// Start closing the connection
    fn close(&mut self, app: bool, error_code: u64, reason: &[u8]) -> Result<(), EngineError>;

    /// Counters for the closure report
    fn stats(&self) -> ConnectionStats;
}
