//! Bounded table of live peer connections.

use crate::reactor::Token;
use bytes::BytesMut;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;
use thiserror::Error;

/// Opaque, monotonically allocated connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// The table is full; the rejected stream is handed back.
#[derive(Error)]
#[error("connection table full ({capacity} connections)")]
pub struct CapacityError<S> {
    /// Stream that could not be inserted.
    pub stream: S,
    /// Table capacity.
    pub capacity: usize,
}

impl<S> fmt::Debug for CapacityError<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapacityError")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

/// The handle is not (or no longer) in the table.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("no connection {0}")]
pub struct NotFound(pub ConnId);

/// One authenticated peer.
pub struct Connection<S> {
    /// Table handle.
    pub id: ConnId,
    /// Peer node name from the handshake.
    pub peer: String,
    /// Remote socket address.
    pub addr: SocketAddr,
    /// The socket, shared weakly with the reactor.
    pub stream: Rc<S>,
    /// Reactor registration, once registered.
    pub token: Option<Token>,
    /// Bytes received but not yet forming a complete frame.
    pub inbound: BytesMut,
    /// When the connection was admitted.
    pub connected_at: Instant,
}

/// Connection map with a fixed capacity.
pub struct ConnectionTable<S> {
    connections: HashMap<ConnId, Connection<S>>,
    capacity: usize,
    next_id: u64,
}

impl<S> ConnectionTable<S> {
    /// Creates an empty table holding at most `capacity` connections.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            connections: HashMap::with_capacity(capacity.min(1024)),
            capacity,
            next_id: 0,
        }
    }

    /// Admits a connection.
    ///
    /// # Errors
    ///
    /// Returns [`CapacityError`] carrying `stream` back when the table is full.
    pub fn insert(
        &mut self,
        stream: S,
        peer: impl Into<String>,
        addr: SocketAddr,
    ) -> Result<ConnId, CapacityError<S>> {
        if self.is_full() {
            return Err(CapacityError {
                stream,
                capacity: self.capacity,
            });
        }
        let id = ConnId(self.next_id);
        self.next_id += 1;
        self.connections.insert(
            id,
            Connection {
                id,
                peer: peer.into(),
                addr,
                stream: Rc::new(stream),
                token: None,
                inbound: BytesMut::new(),
                connected_at: Instant::now(),
            },
        );
        Ok(id)
    }

    /// Looks up a connection.
    ///
    /// # Errors
    ///
    /// Returns [`NotFound`] for an unknown handle.
    pub fn lookup(&self, id: ConnId) -> Result<&Connection<S>, NotFound> {
        self.connections.get(&id).ok_or(NotFound(id))
    }

    /// Mutable access to a connection, if present.
    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection<S>> {
        self.connections.get_mut(&id)
    }

    /// Removes a connection, returning it if it was present.
    pub fn remove(&mut self, id: ConnId) -> Option<Connection<S>> {
        self.connections.remove(&id)
    }

    /// Handles of every live connection, in admission order.
    #[must_use]
    pub fn ids(&self) -> Vec<ConnId> {
        let mut ids: Vec<ConnId> = self.connections.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Returns `true` if the table holds no connections.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns `true` when no further connection can be admitted.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.capacity
    }
}
