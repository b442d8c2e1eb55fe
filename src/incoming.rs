//! Datagrams for connection IDs the table does not know
//!
//! Nothing is allocated for such a datagram until its sender has proven, by echoing a Retry
//! token, that it can receive at the address it claims.

use std::net::SocketAddr;

use bytes::Bytes;
use rand::rngs::StdRng;
use tracing::{debug, trace};

use crate::{
    AddressTokens, ConnectionId, DropReason, Engine, Header, PacketType, PendingPacket,
    SendScheduler,
};

/// What to do with a datagram that matched no connection
pub(crate) enum Admission<C> {
    /// Ignore it
    Drop(DropReason),
    /// A version negotiation packet was queued
    VersionNegotiation,
    /// A Retry packet steering the client to `new_cid` was queued
    Retry(ConnectionId),
    /// The engine accepted a connection to be routed by `cid`
    Accept {
        cid: ConnectionId,
        conn: C,
    },
}

/// The endpoint state the handshake gate needs, borrowed for one datagram
pub(crate) struct Incoming<'a, E> {
    pub(crate) engine: &'a mut E,
    pub(crate) tokens: &'a AddressTokens,
    pub(crate) rng: &'a mut StdRng,
    pub(crate) responder: &'a SendScheduler,
    pub(crate) buf: &'a mut [u8],
    pub(crate) local: SocketAddr,
    pub(crate) accepting: bool,
}

impl<E: Engine> Incoming<'_, E> {
    /// Decide the fate of a datagram from `peer` whose destination connection ID is unknown
    ///
    /// Exactly one of version negotiation, retry or accept can happen, checked in that order. Any
    /// long header may trigger version negotiation; only an Initial packet may trigger the rest.
    pub(crate) fn admit(mut self, header: &Header, peer: SocketAddr) -> Admission<E::Connection> {
        if !self.accepting {
            trace!(%peer, "not accepting, dropping datagram");
            return Admission::Drop(DropReason::NotAccepting);
        }

        if !header.ty.is_long_handshake() {
            trace!(%peer, ty = ?header.ty, "no connection for datagram");
            return Admission::Drop(DropReason::UnknownConnection);
        }

        if !self.engine.is_version_supported(header.version) {
            return self.negotiate_version(header, peer);
        }

        // Handshake and 0-RTT packets only make sense for a connection that already exists
        if header.ty != PacketType::Initial {
            trace!(%peer, ty = ?header.ty, "no connection for non-initial packet");
            return Admission::Drop(DropReason::UnknownConnection);
        }

        let token = match &header.token {
            Some(token) if !token.is_empty() => token,
            _ => return self.retry(header, peer),
        };

        let Some(odcid) = self.tokens.validate(token, peer) else {
            debug!(%peer, "invalid address validation token");
            return Admission::Drop(DropReason::InvalidToken);
        };

        let Some(cid) = ConnectionId::from_slice(&header.dcid) else {
            debug!(%peer, len = header.dcid.len(), "unexpected connection ID length");
            return Admission::Drop(DropReason::InvalidConnectionIdLength);
        };

        match self.engine.accept(&cid, odcid, self.local, peer) {
            Ok(conn) => Admission::Accept { cid, conn },
            Err(e) => {
                debug!(%peer, "engine refused connection: {e}");
                Admission::Drop(DropReason::AcceptFailed)
            }
        }
    }

    fn negotiate_version(mut self, header: &Header, peer: SocketAddr) -> Admission<E::Connection> {
        debug!(%peer, version = format_args!("{:#010x}", header.version), "version negotiation");
        match self
            .engine
            .build_version_negotiation(&header.scid, &header.dcid, self.buf)
        {
            Ok(len) => {
                self.respond(&self.buf[..len], peer);
                Admission::VersionNegotiation
            }
            Err(e) => {
                debug!(%peer, "failed to build version negotiation: {e}");
                Admission::Drop(DropReason::PacketBuildFailed)
            }
        }
    }

    fn retry(mut self, header: &Header, peer: SocketAddr) -> Admission<E::Connection> {
        let token = self.tokens.mint(&header.dcid, peer);
        let new_cid = ConnectionId::random(self.rng);
        debug!(%peer, %new_cid, "stateless retry");
        match self.engine.build_retry(
            &header.scid,
            &header.dcid,
            &new_cid,
            &token,
            header.version,
            self.buf,
        ) {
            Ok(len) => {
                self.respond(&self.buf[..len], peer);
                Admission::Retry(new_cid)
            }
            Err(e) => {
                debug!(%peer, "failed to build retry: {e}");
                Admission::Drop(DropReason::PacketBuildFailed)
            }
        }
    }

    fn respond(&self, packet: &[u8], peer: SocketAddr) {
        self.responder.enqueue(PendingPacket {
            contents: Bytes::copy_from_slice(packet),
            destination: peer,
            not_before: None,
        });
    }
}
