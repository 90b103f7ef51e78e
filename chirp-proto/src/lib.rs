//! State machine for the chirp message-passing protocol
//!
//! This crate performs no I/O. A [`Node`] consumes raw bytes read from TCP
//! streams, connect/accept notifications, write completions and timeouts; it
//! produces outgoing byte buffers via [`Node::poll_transmit`], socket requests
//! via [`Node::poll_io`] and application events via [`Node::poll_event`]. The
//! `chirp` crate drives a `Node` on top of tokio; tests drive it on an
//! in-memory network with simulated time.

use std::fmt;

mod coding;

mod config;
pub use crate::config::{Config, ConfigError};

mod connection;

mod crypto;
pub use crate::crypto::TlsContext;

mod error;
pub use crate::error::ErrorCode;

mod message;
pub use crate::message::Message;

mod node;
pub use crate::node::{Event, IoRequest, Node, SendOutcome, Transmit};

mod pool;

mod remote;
pub use crate::remote::RemoteKey;

mod timer;

mod wire;
pub use crate::wire::MessageType;

#[cfg(test)]
mod tests;

/// Size of a node or message identity in bytes
pub const ID_SIZE: usize = 16;

/// Size of the application-level handshake record on the wire
pub const HANDSHAKE_SIZE: usize = 18;

/// Size of the framed wire-message header
///
/// The meaningful fields occupy 27 bytes; the record is padded to 40 bytes so
/// that both sides can read it as a fixed-size, aligned block.
pub const WIRE_MSG_SIZE: usize = 40;

/// Hard upper bound on receive slots per connection
pub const MAX_SLOTS: u8 = 32;

pub(crate) const PREALLOC_HEADER: usize = 32;
pub(crate) const PREALLOC_DATA: usize = 512;

/// An identity, either of a node or of a message
///
/// Message identities are stable across ack round-trips: replying to a
/// message does not change its identity, so identities can be used to match
/// answers to requests.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct Identity(pub [u8; ID_SIZE]);

impl Identity {
    /// Generate a random identity
    pub fn random<R: rand::Rng>(rng: &mut R) -> Self {
        let mut id = [0; ID_SIZE];
        rng.fill_bytes(&mut id);
        Self(id)
    }

    /// Whether every byte is zero
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&x| x == 0)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<[u8; ID_SIZE]> for Identity {
    fn from(x: [u8; ID_SIZE]) -> Self {
        Self(x)
    }
}

/// Internal identifier for a connection within a [`Node`]
///
/// Handles are slab indices; they are reused after a connection is fully
/// freed, never while any I/O for the connection may still be reported.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionHandle(pub usize);

impl From<ConnectionHandle> for usize {
    fn from(x: ConnectionHandle) -> Self {
        x.0
    }
}
