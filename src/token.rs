use std::net::{IpAddr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};

use crate::MAX_CONN_ID_LEN;

/// Default marker every address-validation token starts with
pub const DEFAULT_TOKEN_PREFIX: &[u8] = b"quiche";

const IPV4_TAG: u8 = 4;
const IPV6_TAG: u8 = 6;

/// Stateless address-validation tokens for the Retry handshake
///
/// A token is `prefix || address || original destination connection ID`, where the address is a
/// family tag, the IP octets and the big-endian port. Nothing is stored: validation rebuilds the
/// expected address bytes for the peer the token arrived from and compares.
///
/// Tokens are not encrypted or authenticated, so they only prove that the peer can receive
/// datagrams at the address it claims.
#[derive(Debug, Clone)]
pub struct AddressTokens {
    prefix: Bytes,
}

impl AddressTokens {
    /// Tokens marked with `prefix`
    pub fn new(prefix: impl Into<Bytes>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Mint a token binding `odcid` to `peer`
    pub fn mint(&self, odcid: &[u8], peer: SocketAddr) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.prefix.len() + 19 + odcid.len());
        buf.put_slice(&self.prefix);
        encode_addr(&mut buf, peer);
        buf.put_slice(odcid);
        buf.freeze()
    }

    /// Check that `token` was minted for `peer`, returning the original destination connection
    /// ID it carries
    ///
    /// Returns `None` for foreign tokens, tokens minted for a different address, and tokens whose
    /// connection ID could not have appeared on the wire.
    pub fn validate<'a>(&self, token: &'a [u8], peer: SocketAddr) -> Option<&'a [u8]> {
        let rest = token.strip_prefix(&self.prefix[..])?;
        let mut addr = BytesMut::with_capacity(19);
        encode_addr(&mut addr, peer);
        let odcid = rest.strip_prefix(&addr[..])?;
        if odcid.len() > MAX_CONN_ID_LEN {
            return None;
        }
        Some(odcid)
    }
}

impl Default for AddressTokens {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_PREFIX)
    }
}

fn encode_addr(buf: &mut BytesMut, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(IPV4_TAG);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(IPV6_TAG);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16(addr.port());
}
