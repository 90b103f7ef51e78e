//! Codecs for the two wire records: the handshake and the message header.
//!
//! All integers are big-endian. The message header carries 27 bytes of
//! fields and is padded with zeroes to a fixed 40-byte block; both sides
//! read and write the padded form.

use std::fmt;
use std::ops;

use bytes::{Buf, BufMut};

use crate::coding::{self, BufExt, BufMutExt, Codec};
use crate::{Identity, WIRE_MSG_SIZE};

const WIRE_MSG_FIELDS: usize = 27;
const WIRE_MSG_PADDING: usize = WIRE_MSG_SIZE - WIRE_MSG_FIELDS;

/// Message type bitset
///
/// `ACK` and `NOOP` mark control messages; they carry no payload and must
/// not combine with `REQ_ACK`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct MessageType(pub(crate) u8);

impl MessageType {
    /// The sender requests an application-level acknowledgement
    pub const REQ_ACK: MessageType = MessageType(0x01);
    /// Acknowledges the message with the same identity
    pub const ACK: MessageType = MessageType(0x02);
    /// Keeps an idle remote alive ahead of garbage collection
    pub const NOOP: MessageType = MessageType(0x04);

    /// The empty bitset; a plain data message without ack request
    pub const NONE: MessageType = MessageType(0);

    pub fn contains(self, other: MessageType) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether this is an ACK or NOOP
    pub fn is_control(self) -> bool {
        self.0 & (Self::ACK.0 | Self::NOOP.0) != 0
    }
}

impl ops::BitOr for MessageType {
    type Output = MessageType;
    fn bitor(self, rhs: MessageType) -> MessageType {
        MessageType(self.0 | rhs.0)
    }
}

impl Codec for MessageType {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        Ok(MessageType(buf.get::<u8>()?))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write::<u8>(self.0);
    }
}

/// The fixed-size header preceding every message body
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct WireHeader {
    pub identity: Identity,
    pub serial: u32,
    pub ty: MessageType,
    pub header_len: u16,
    pub data_len: u32,
}

impl WireHeader {
    /// Total body length following this header
    pub fn body_len(&self) -> usize {
        self.header_len as usize + self.data_len as usize
    }
}

impl Codec for WireHeader {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        if buf.remaining() < WIRE_MSG_SIZE {
            return Err(coding::UnexpectedEnd);
        }
        let hdr = Self {
            identity: buf.get()?,
            serial: buf.get()?,
            ty: buf.get()?,
            header_len: buf.get()?,
            data_len: buf.get()?,
        };
        buf.advance(WIRE_MSG_PADDING);
        Ok(hdr)
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write(self.identity);
        buf.write(self.serial);
        buf.write(self.ty);
        buf.write(self.header_len);
        buf.write(self.data_len);
        buf.put_bytes(0, WIRE_MSG_PADDING);
    }
}

/// The record each side sends once, immediately after transport setup
///
/// Orthogonal to the TLS handshake: carries the sender's public port, so the
/// receiver can key the remote, and the sender's node identity.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Handshake {
    pub port: u16,
    pub identity: Identity,
}

impl Codec for Handshake {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        Ok(Self {
            port: buf.get()?,
            identity: buf.get()?,
        })
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write(self.port);
        buf.write(self.identity);
    }
}

impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handshake(port {}, id {})", self.port, self.identity)
    }
}
