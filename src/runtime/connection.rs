//! Connection table and per-connection state machine.
//!
//! Each accepted socket lives in a slot of a slab-backed arena. The slot
//! owns the socket and the peer address for the connection's whole life.
//! The input/output buffers are owned by whichever actor currently holds
//! processing rights: they sit in the slot while the dispatch loop owns the
//! connection and are moved into a task while a worker runs it.

use crate::runtime::token::{ConnId, MAX_SLOTS};
use bytes::BytesMut;
use mio::net::TcpStream;
use slab::Slab;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Lifecycle of a connection. A free slot is simply absent from the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted, not yet registered for readiness.
    Idle,
    /// Registered for read readiness.
    AwaitingRead,
    /// Buffers handed to a worker; the socket is deregistered.
    Processing,
    /// Registered for write readiness with output pending.
    AwaitingWrite,
    /// Close requested while a worker held the buffers.
    Closing,
}

/// Input and output byte buffers of one connection.
#[derive(Debug, Default)]
pub struct Buffers {
    /// Bytes read from the peer, not yet consumed by the application.
    pub input: BytesMut,
    /// Bytes produced by the application, not yet written to the peer.
    pub output: BytesMut,
}

impl Buffers {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            input: BytesMut::with_capacity(capacity),
            output: BytesMut::with_capacity(capacity),
        }
    }
}

/// A single client connection.
#[derive(Debug)]
pub struct Slot {
    id: ConnId,
    peer: SocketAddr,
    /// Socket, owned by the dispatch loop for the connection's lifetime.
    pub stream: TcpStream,
    /// Current lifecycle state.
    pub state: ConnState,
    /// `None` while a worker holds the buffers.
    pub buffers: Option<Buffers>,
}

impl Slot {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Whether a worker currently holds this connection's buffers.
    pub fn is_processing(&self) -> bool {
        self.buffers.is_none()
    }
}

/// Fixed-capacity table of live connections.
///
/// Provides O(1) insert, lookup, and remove. Lookups validate the
/// generation encoded in the `ConnId`, so stale ids never match a reused
/// slot.
pub struct ConnectionTable {
    slots: Slab<Slot>,
    max_connections: usize,
    buffer_size: usize,
    next_generation: u32,
    live: Arc<AtomicUsize>,
}

impl ConnectionTable {
    /// Create a table holding at most `max_connections` connections, each
    /// starting with buffers of `buffer_size` bytes.
    pub fn new(max_connections: usize, buffer_size: usize) -> Self {
        let max_connections = max_connections.min(MAX_SLOTS);
        Self {
            slots: Slab::with_capacity(max_connections.min(4096)),
            max_connections,
            buffer_size,
            next_generation: 0,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Allocate a slot for a freshly accepted socket.
    ///
    /// Returns `None` at capacity; the stream is dropped, which closes it.
    pub fn insert(&mut self, stream: TcpStream, peer: SocketAddr) -> Option<ConnId> {
        if self.is_full() {
            return None;
        }

        let generation = self.next_generation;
        self.next_generation = self.next_generation.wrapping_add(1);

        let entry = self.slots.vacant_entry();
        let id = ConnId::new(entry.key(), generation);
        entry.insert(Slot {
            id,
            peer,
            stream,
            state: ConnState::Idle,
            buffers: Some(Buffers::with_capacity(self.buffer_size)),
        });
        self.live.store(self.slots.len(), Ordering::Release);
        Some(id)
    }

    /// Get an immutable reference to a connection.
    pub fn get(&self, id: ConnId) -> Option<&Slot> {
        self.slots.get(id.slot()).filter(|slot| slot.id == id)
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Slot> {
        self.slots.get_mut(id.slot()).filter(|slot| slot.id == id)
    }

    /// Check if a connection exists.
    pub fn contains(&self, id: ConnId) -> bool {
        self.get(id).is_some()
    }

    /// Remove a connection, freeing its slot.
    pub fn remove(&mut self, id: ConnId) -> Option<Slot> {
        if !self.contains(id) {
            return None;
        }
        let slot = self.slots.remove(id.slot());
        self.live.store(self.slots.len(), Ordering::Release);
        Some(slot)
    }

    /// Move the buffers out of a connection for a worker.
    ///
    /// Returns `None` if the connection is gone or a worker already holds
    /// them.
    pub fn take_buffers(&mut self, id: ConnId) -> Option<Buffers> {
        let slot = self.get_mut(id)?;
        let buffers = slot.buffers.take()?;
        slot.state = ConnState::Processing;
        Some(buffers)
    }

    /// Give the buffers back after a worker finished.
    ///
    /// Returns the buffers if the connection no longer exists.
    pub fn restore_buffers(&mut self, id: ConnId, buffers: Buffers) -> Result<(), Buffers> {
        match self.get_mut(id) {
            Some(slot) if slot.buffers.is_none() => {
                slot.buffers = Some(buffers);
                Ok(())
            }
            _ => Err(buffers),
        }
    }

    /// Ids of all live connections.
    pub fn ids(&self) -> Vec<ConnId> {
        self.slots.iter().map(|(_, slot)| slot.id).collect()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether a new connection would be rejected.
    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.max_connections
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Shared gauge mirroring `len()` for observers on other threads.
    pub fn live_gauge(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.live)
    }
}
