//! Connection identity and readiness token encoding.
//!
//! A connection is identified by its slot in the connection table plus the
//! generation the slot had when the connection was accepted. Both are packed
//! into the `mio::Token` the connection is registered under, so a readiness
//! event or worker completion that outlives its connection can be recognized
//! and dropped instead of being applied to the slot's next occupant.

use mio::Token;
use std::fmt;

// Slot and generation are packed side by side into the token's `usize`.
#[cfg(not(target_pointer_width = "64"))]
compile_error!("connection tokens need a 64-bit usize");

/// Token of the listening socket.
pub const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Token of the cross-thread waker (worker completions, shutdown).
pub const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Slot indices must stay below this to keep clear of the reserved tokens.
pub const MAX_SLOTS: usize = u32::MAX as usize - 1;

/// Stable identity of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    slot: u32,
    generation: u32,
}

impl ConnId {
    /// Build an id from a slot index and the generation assigned at accept.
    ///
    /// # Panics
    /// Panics if `slot` is not below `MAX_SLOTS`; the connection table never
    /// grows that far.
    pub fn new(slot: usize, generation: u32) -> Self {
        assert!(slot < MAX_SLOTS, "slot index out of range");
        Self {
            slot: slot as u32,
            generation,
        }
    }

    /// Slot index in the connection table.
    pub fn slot(self) -> usize {
        self.slot as usize
    }

    /// Generation of the slot at accept time.
    #[cfg(test)]
    pub fn generation(self) -> u32 {
        self.generation
    }

    /// Token to register the connection's socket under.
    pub fn token(self) -> Token {
        Token(((self.generation as u64) << 32 | self.slot as u64) as usize)
    }

    /// Decode a token back into a connection id.
    ///
    /// Returns `None` for the reserved tokens.
    pub fn from_token(token: Token) -> Option<Self> {
        if token == LISTENER_TOKEN || token == WAKER_TOKEN {
            return None;
        }
        let raw = token.0 as u64;
        Some(Self {
            slot: raw as u32,
            generation: (raw >> 32) as u32,
        })
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.slot, self.generation)
    }
}
