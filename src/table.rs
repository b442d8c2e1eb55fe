use std::collections::hash_map;

use rustc_hash::FxHashMap;

use crate::ConnectionId;

/// Identifies one incarnation of a connection in a [`ConnectionTable`]
///
/// A connection ID may be reused after its connection is removed, for example when a late
/// datagram restarts the handshake. The generation tells the two incarnations apart, so that a
/// timer armed for the old one can never act on the new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    cid: ConnectionId,
    generation: u64,
}

impl ConnectionHandle {
    pub(crate) const fn new(cid: ConnectionId, generation: u64) -> Self {
        Self { cid, generation }
    }

    /// The connection ID the connection is routed by
    pub fn cid(&self) -> ConnectionId {
        self.cid
    }

    /// The incarnation of `cid` this handle refers to
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Live connections keyed by connection ID
///
/// Owned by a single endpoint task, so no locking is needed. Lookups through a
/// [`ConnectionHandle`] fail once the connection it referred to has been removed.
#[derive(Debug)]
pub struct ConnectionTable<T> {
    entries: FxHashMap<ConnectionId, Slot<T>>,
    next_generation: u64,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u64,
    value: T,
}

impl<T> ConnectionTable<T> {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            entries: FxHashMap::default(),
            next_generation: 0,
        }
    }

    /// Insert `value` under `cid`
    ///
    /// Returns the value back if `cid` is already taken.
    pub fn insert(&mut self, cid: ConnectionId, value: T) -> Result<ConnectionHandle, T> {
        match self.entries.entry(cid) {
            hash_map::Entry::Occupied(_) => Err(value),
            hash_map::Entry::Vacant(vacant) => {
                let generation = self.next_generation;
                self.next_generation += 1;
                vacant.insert(Slot { generation, value });
                Ok(ConnectionHandle::new(cid, generation))
            }
        }
    }

    /// Insert the value built by `f` under `cid`, handing `f` the handle it will be reachable by
    ///
    /// Returns `None` without calling `f` if `cid` is already taken.
    pub fn insert_with(
        &mut self,
        cid: ConnectionId,
        f: impl FnOnce(ConnectionHandle) -> T,
    ) -> Option<ConnectionHandle> {
        match self.entries.entry(cid) {
            hash_map::Entry::Occupied(_) => None,
            hash_map::Entry::Vacant(vacant) => {
                let generation = self.next_generation;
                self.next_generation += 1;
                let handle = ConnectionHandle::new(cid, generation);
                vacant.insert(Slot {
                    generation,
                    value: f(handle),
                });
                Some(handle)
            }
        }
    }

    /// Handle of the connection currently routed by `cid`
    pub fn lookup(&self, cid: &ConnectionId) -> Option<ConnectionHandle> {
        self.entries
            .get(cid)
            .map(|entry| ConnectionHandle::new(*cid, entry.generation))
    }

    /// Whether a connection is currently routed by `cid`
    pub fn contains(&self, cid: &ConnectionId) -> bool {
        self.entries.contains_key(cid)
    }

    /// The connection `handle` refers to, if it is still in the table
    pub fn get(&self, handle: ConnectionHandle) -> Option<&T> {
        match self.entries.get(&handle.cid) {
            Some(entry) if entry.generation == handle.generation => Some(&entry.value),
            _ => None,
        }
    }

    /// The connection `handle` refers to, if it is still in the table
    pub fn get_mut(&mut self, handle: ConnectionHandle) -> Option<&mut T> {
        match self.entries.get_mut(&handle.cid) {
            Some(entry) if entry.generation == handle.generation => Some(&mut entry.value),
            _ => None,
        }
    }

    /// Remove the connection `handle` refers to
    ///
    /// A stale handle leaves a newer incarnation of the same connection ID untouched.
    pub fn remove(&mut self, handle: ConnectionHandle) -> Option<T> {
        match self.entries.get(&handle.cid) {
            Some(entry) if entry.generation == handle.generation => {
                self.entries.remove(&handle.cid).map(|entry| entry.value)
            }
            _ => None,
        }
    }

    /// Remove every connection for which `is_dead` holds, returning what was removed
    pub fn sweep(&mut self, mut is_dead: impl FnMut(&T) -> bool) -> Vec<(ConnectionHandle, T)> {
        let dead = self
            .entries
            .iter()
            .filter(|(_, entry)| is_dead(&entry.value))
            .map(|(cid, entry)| ConnectionHandle::new(*cid, entry.generation))
            .collect::<Vec<_>>();
        dead.into_iter()
            .filter_map(|handle| Some((handle, self.remove(handle)?)))
            .collect()
    }

    /// Handles of every connection in the table, in no particular order
    pub fn handles(&self) -> Vec<ConnectionHandle> {
        self.entries
            .iter()
            .map(|(cid, entry)| ConnectionHandle::new(*cid, entry.generation))
            .collect()
    }

    /// Iterate over every connection in the table
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ConnectionHandle, &mut T)> {
        self.entries.iter_mut().map(|(cid, entry)| {
            (
                ConnectionHandle::new(*cid, entry.generation),
                &mut entry.value,
            )
        })
    }

    /// Number of connections in the table
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table holds no connections
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for ConnectionTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
