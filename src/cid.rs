use std::{fmt, ops::Deref};

use rand::RngCore;

use crate::LOCAL_CONN_ID_LEN;

/// Routing key of a connection
///
/// Connection IDs minted by this crate are always [`LOCAL_CONN_ID_LEN`] bytes long. Peers choose
/// their own IDs, which may have other lengths; those never match a table entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId([u8; LOCAL_CONN_ID_LEN]);

impl ConnectionId {
    /// Construct a connection ID from its raw bytes
    pub const fn new(bytes: [u8; LOCAL_CONN_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Interpret `bytes` as a connection ID, if it has the expected length
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes = <[u8; LOCAL_CONN_ID_LEN]>::try_from(bytes).ok()?;
        Some(Self(bytes))
    }

    /// Generate a fresh connection ID from `rng`
    pub fn random<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0; LOCAL_CONN_ID_LEN];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for ConnectionId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
