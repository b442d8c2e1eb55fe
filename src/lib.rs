//! Connection orchestration for a QUIC protocol engine
//!
//! This crate sits between a UDP socket and a QUIC protocol engine. The engine parses and builds
//! packets, runs the TLS handshake and performs loss recovery; this crate decides which
//! connection a datagram belongs to, answers version negotiation and stateless retry before any
//! connection state is allocated, keeps the table of live connections keyed by connection ID,
//! serializes each connection's outbound packets onto the socket, and drives the engine's
//! timers.
//!
//! The entry points are [`Endpoint`], which serves many connections on one socket, and
//! [`Client`], which drives exactly one outgoing connection. Both are generic over the
//! [`Engine`] trait; enable the `quiche` feature for an implementation backed by the `quiche`
//! crate.
//!
//! # Concurrency model
//!
//! An endpoint is owned by exactly one task and mutates its connection table without locking.
//! To use more cores, run one independent endpoint per thread on the same port with
//! [`shard::spawn_workers`]; nothing is shared between workers. Every connection gets its own
//! send pipeline task, so a packet that is held back for pacing never delays another
//! connection, and packets of one connection always leave in the order the engine produced them.
#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![warn(clippy::use_self)]

mod app;
mod cid;
mod client;
mod config;
mod connection;
mod endpoint;
pub mod engine;
mod incoming;
mod runtime;
mod send;
pub mod shard;
mod stream;
mod table;
mod timer;
mod token;

pub use crate::app::{Application, Echo, STREAM_FINISHED};
pub use crate::cid::ConnectionId;
pub use crate::client::{Client, ClientError, ClientStreams};
pub use crate::config::{ClientConfig, ConfigError, EndpointConfig, TransportConfig};
pub use crate::connection::Connection;
pub use crate::endpoint::{
    DatagramOutcome, DropReason, Endpoint, EndpointError, EndpointStats, TimeoutOutcome,
};
pub use crate::engine::{
    ConnectionStats, Engine, EngineConnection, EngineError, Header, PacketType, RecvInfo,
    SendInfo,
};
pub use crate::runtime::{default_runtime, AsyncTimer, AsyncUdpSocket, Runtime, TokioRuntime};
pub use crate::send::{PendingPacket, SendScheduler, SendStats};
pub use crate::stream::{chunk_queue, Chunk, ChunkReader, ChunkWriter, QueueClosed};
pub use crate::table::{ConnectionHandle, ConnectionTable};
pub use crate::timer::{TimeoutDriver, TimerExpired, TimerState};
pub use crate::token::{AddressTokens, DEFAULT_TOKEN_PREFIX};

#[cfg(test)]
mod tests;

/// Length of the connection IDs this crate generates and routes on
pub const LOCAL_CONN_ID_LEN: usize = 16;

/// Longest connection ID QUIC version 1 permits on the wire
pub const MAX_CONN_ID_LEN: usize = 20;

/// Size of the buffer inbound datagrams are received into
///
/// A datagram that fills this buffer completely may have been truncated by the kernel and is
/// dropped.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Size of the scratch buffer the engine writes each outgoing packet into
pub const MAX_SEND_UDP_PAYLOAD: usize = 1_350;

/// Size of the chunks the client splits an application payload into
pub const FILE_CHUNK: usize = 16_000;
