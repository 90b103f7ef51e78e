use std::fmt;
use std::net::SocketAddr;
use std::ops;

use bytes::Bytes;

use crate::wire::{MessageType, WireHeader};
use crate::Identity;

/// A message, either to be sent or as delivered by a node
///
/// Outgoing messages are built with [`Message::new`] and consumed by
/// `send`; the node returns them through the send completion. Incoming
/// messages occupy a receive slot until released (see
/// [`Message::has_slot`]). The identity never changes after construction;
/// reply matching relies on that.
#[derive(Debug)]
pub struct Message {
    pub(crate) identity: Identity,
    pub(crate) serial: u32,
    pub(crate) ty: MessageType,
    pub(crate) header: Bytes,
    pub(crate) data: Bytes,
    pub(crate) peer: SocketAddr,
    pub(crate) remote_identity: Identity,
    pub(crate) flags: MessageFlags,
    pub(crate) slot: Option<SlotToken>,
}

impl Message {
    /// Create an empty message addressed to `peer` with a random identity
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            identity: Identity::random(&mut rand::thread_rng()),
            serial: 0,
            ty: MessageType::NONE,
            header: Bytes::new(),
            data: Bytes::new(),
            peer,
            remote_identity: Identity::default(),
            flags: MessageFlags::default(),
            slot: None,
        }
    }

    /// The message identity, stable across ack round-trips
    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Serial assigned by the sending remote; 0 until written
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// The wire type bits
    pub fn message_type(&self) -> MessageType {
        self.ty
    }

    /// Header bytes for upper-layer protocols
    pub fn header(&self) -> &Bytes {
        &self.header
    }

    /// The payload
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Replace the payload
    pub fn set_data(&mut self, data: impl Into<Bytes>) {
        self.data = data.into();
    }

    /// Replace the header
    pub fn set_header(&mut self, header: impl Into<Bytes>) {
        self.header = header.into();
    }

    /// Peer address: the sender for received messages, the destination for
    /// outgoing ones
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Redirect the message; useful to reply by reusing a received message
    pub fn set_peer(&mut self, peer: SocketAddr) {
        self.peer = peer;
    }

    /// Identity of the node the message was received from
    ///
    /// Changes when the peer restarts; peers sharing state can key it by
    /// this value to detect resets.
    pub fn remote_identity(&self) -> Identity {
        self.remote_identity
    }

    /// Whether this message occupies a receive slot and must be released
    pub fn has_slot(&self) -> bool {
        self.flags.contains(MessageFlags::HAS_SLOT)
    }

    pub(crate) fn wire_header(&self) -> WireHeader {
        WireHeader {
            identity: self.identity,
            serial: self.serial,
            ty: self.ty,
            header_len: self.header.len() as u16,
            data_len: self.data.len() as u32,
        }
    }
}

/// Internal message state bits
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub(crate) struct MessageFlags(u8);

impl MessageFlags {
    /// Enqueued or in flight; the carrier may not be reused
    pub(crate) const USED: MessageFlags = MessageFlags(1 << 0);
    /// The ack arrived, or was synthesized for messages not requesting one
    pub(crate) const ACK_RECEIVED: MessageFlags = MessageFlags(1 << 1);
    /// All bytes were handed to the transport
    pub(crate) const WRITE_DONE: MessageFlags = MessageFlags(1 << 2);
    /// Releasing the slot must send an ack back
    pub(crate) const SEND_ACK: MessageFlags = MessageFlags(1 << 3);
    /// The message came out of a slot pool
    pub(crate) const HAS_SLOT: MessageFlags = MessageFlags(1 << 4);
    /// The message was aborted; completion fires with the failure reason
    pub(crate) const FAILURE: MessageFlags = MessageFlags(1 << 5);

    pub(crate) fn contains(self, other: MessageFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) fn insert(&mut self, other: MessageFlags) {
        self.0 |= other.0;
    }

    pub(crate) fn remove(&mut self, other: MessageFlags) {
        self.0 &= !other.0;
    }
}

impl ops::BitOr for MessageFlags {
    type Output = MessageFlags;
    fn bitor(self, rhs: MessageFlags) -> MessageFlags {
        MessageFlags(self.0 | rhs.0)
    }
}

/// Location of a message's receive slot: pool index and slot id
#[derive(Copy, Clone, Eq, PartialEq)]
pub(crate) struct SlotToken {
    pub(crate) pool: usize,
    pub(crate) slot: u8,
}

impl fmt::Debug for SlotToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}/{}", self.pool, self.slot)
    }
}
