use std::io::{Read, Write};
use std::net::SocketAddr;
use std::ops;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::timer::TimerTable;
use crate::wire::WireHeader;
use crate::{ErrorCode, Identity, WIRE_MSG_SIZE};

/// Connection lifecycle bits
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub(crate) struct ConnFlags(u16);

impl ConnFlags {
    /// The application-level handshake completed in both directions
    pub(crate) const CONNECTED: ConnFlags = ConnFlags(1 << 0);
    /// The TLS handshake is still running
    pub(crate) const TLS_HANDSHAKE: ConnFlags = ConnFlags(1 << 1);
    /// The peer dialed us
    pub(crate) const INCOMING: ConnFlags = ConnFlags(1 << 2);
    /// Bytes on the wire are TLS records
    pub(crate) const ENCRYPTED: ConnFlags = ConnFlags(1 << 3);
    /// Teardown started; reads are discarded, writes rejected
    pub(crate) const SHUTTING_DOWN: ConnFlags = ConnFlags(1 << 4);
    /// The reader ran out of slots and paused the stream
    pub(crate) const STOPPED: ConnFlags = ConnFlags(1 << 5);

    pub(crate) fn contains(self, other: ConnFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) fn insert(&mut self, other: ConnFlags) {
        self.0 |= other.0;
    }

    pub(crate) fn remove(&mut self, other: ConnFlags) {
        self.0 &= !other.0;
    }
}

impl ops::BitOr for ConnFlags {
    type Output = ConnFlags;
    fn bitor(self, rhs: ConnFlags) -> ConnFlags {
        ConnFlags(self.0 | rhs.0)
    }
}

/// States of the per-connection read machine
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum ReadState {
    /// Expecting the fixed handshake record
    Handshake,
    /// Expecting a wire-message header
    Wait,
    /// Header parsed; a slot must be acquired before reading the body
    Slot,
    /// Reading the message header buffer
    Header,
    /// Reading the message payload
    Data,
}

/// Read machine state, including partial-record progress
///
/// The reader owns the connection's slot pool (by index into the node's
/// pool table); `scratch` accumulates the fixed-size wire header, which
/// may arrive split across reads.
pub(crate) struct Reader {
    pub(crate) state: ReadState,
    pub(crate) pool: usize,
    pub(crate) bytes_read: usize,
    pub(crate) scratch: [u8; WIRE_MSG_SIZE],
    pub(crate) wire: Option<WireHeader>,
    pub(crate) slot: Option<u8>,
    pub(crate) header_buf: BytesMut,
    pub(crate) data_buf: BytesMut,
}

impl Reader {
    fn new(pool: usize) -> Self {
        Self {
            state: ReadState::Handshake,
            pool,
            bytes_read: 0,
            scratch: [0; WIRE_MSG_SIZE],
            wire: None,
            slot: None,
            header_buf: BytesMut::new(),
            data_buf: BytesMut::new(),
        }
    }
}

/// Write machine: at most one message is serialized at a time
#[derive(Default)]
pub(crate) struct Writer {
    pub(crate) current: Option<crate::remote::SendId>,
}

/// One TCP stream, optionally TLS-wrapped, owned by at most one remote
///
/// All transport mediation is local to this struct: raw input bytes go
/// through [`Connection::feed_transport`], which decrypts when needed and
/// appends plaintext to `pending_input` for the reader; outgoing records go
/// through [`Connection::write_record`], which encrypts when needed and
/// stages ciphertext in `outgoing` for the node to turn into transmits.
pub(crate) struct Connection {
    /// Peer address as seen on the socket; the port is ephemeral for
    /// incoming connections
    pub(crate) peer: SocketAddr,
    /// The peer's advertised public port, learned from the handshake for
    /// incoming connections
    pub(crate) port: u16,
    pub(crate) remote_identity: Identity,
    /// Key of the remote this connection currently serves
    pub(crate) remote: Option<crate::remote::RemoteKey>,
    pub(crate) flags: ConnFlags,
    pub(crate) timestamp: Instant,
    pub(crate) timers: TimerTable,
    pub(crate) reader: Reader,
    pub(crate) writer: Writer,
    tls: Option<rustls::Connection>,
    /// Plaintext not yet consumed by the read machine
    pub(crate) pending_input: BytesMut,
    /// Raw bytes received while the stream was stopped, not yet fed to TLS
    pub(crate) pending_transport: BytesMut,
    /// Encrypted (or raw) output staged for transmission
    pub(crate) outgoing: Vec<Bytes>,
    /// Transmits handed to the runtime whose flush is not yet confirmed
    pub(crate) awaiting_flush: usize,
    /// The current message write completes when all output is flushed
    pub(crate) write_pending_done: bool,
}

impl Connection {
    pub(crate) fn new(
        peer: SocketAddr,
        port: u16,
        flags: ConnFlags,
        pool: usize,
        now: Instant,
    ) -> Self {
        Self {
            peer,
            port,
            remote_identity: Identity::default(),
            remote: None,
            flags,
            timestamp: now,
            timers: TimerTable::default(),
            reader: Reader::new(pool),
            writer: Writer::default(),
            tls: None,
            pending_input: BytesMut::new(),
            pending_transport: BytesMut::new(),
            outgoing: Vec::new(),
            awaiting_flush: 0,
            write_pending_done: false,
        }
    }

    pub(crate) fn set_tls(&mut self, session: rustls::Connection) {
        debug_assert!(self.flags.contains(ConnFlags::ENCRYPTED));
        self.flags.insert(ConnFlags::TLS_HANDSHAKE);
        self.tls = Some(session);
    }

    /// Key fields identifying the peer remote, valid once the handshake set
    /// the advertised port
    pub(crate) fn remote_key(&self) -> crate::remote::RemoteKey {
        crate::remote::RemoteKey::from(SocketAddr::new(self.peer.ip(), self.port))
    }

    /// Feed raw bytes from the socket
    ///
    /// Decrypted (or raw) payload accumulates in `pending_input`; TLS
    /// output produced by handshake progress accumulates in `outgoing`.
    /// Returns whether the TLS handshake finished during this feed.
    pub(crate) fn feed_transport(&mut self, data: &[u8]) -> Result<bool, ErrorCode> {
        let Some(session) = self.tls.as_mut() else {
            self.pending_input.extend_from_slice(data);
            return Ok(false);
        };
        let was_handshaking = session.is_handshaking();
        let mut cursor = data;
        while !cursor.is_empty() {
            let n = session.read_tls(&mut cursor).map_err(|_| ErrorCode::TlsError)?;
            let state = session
                .process_new_packets()
                .map_err(|_| ErrorCode::TlsError)?;
            let plain = state.plaintext_bytes_to_read();
            if plain > 0 {
                let mut buf = vec![0; plain];
                session
                    .reader()
                    .read_exact(&mut buf)
                    .map_err(|_| ErrorCode::TlsError)?;
                self.pending_input.extend_from_slice(&buf);
            }
            Self::drain_tls(session, &mut self.outgoing)?;
            if state.peer_has_closed() {
                return Err(ErrorCode::ProtocolError);
            }
            if n == 0 {
                return Err(ErrorCode::TlsError);
            }
        }
        let finished = was_handshaking && !session.is_handshaking();
        if finished {
            self.flags.remove(ConnFlags::TLS_HANDSHAKE);
            trace!("TLS handshake successful");
        }
        Ok(finished)
    }

    /// Serialize one logical record from up to three buffers
    ///
    /// The parts travel as a single write: unencrypted they are copied into
    /// one buffer, under TLS they enter the session back to back and drain
    /// as one run of records.
    pub(crate) fn write_record(&mut self, bufs: &[&[u8]]) -> Result<(), ErrorCode> {
        match self.tls.as_mut() {
            None => {
                let len: usize = bufs.iter().map(|b| b.len()).sum();
                let mut out = BytesMut::with_capacity(len);
                for buf in bufs {
                    out.extend_from_slice(buf);
                }
                self.outgoing.push(out.freeze());
            }
            Some(session) => {
                for buf in bufs {
                    let mut offset = 0;
                    while offset < buf.len() {
                        let n = session
                            .writer()
                            .write(&buf[offset..])
                            .map_err(|_| ErrorCode::TlsError)?;
                        offset += n;
                        Self::drain_tls(session, &mut self.outgoing)?;
                        if n == 0 {
                            return Err(ErrorCode::TlsError);
                        }
                    }
                }
                Self::drain_tls(session, &mut self.outgoing)?;
            }
        }
        Ok(())
    }

    /// Move pending TLS output (handshake records, close notify) into the
    /// staging area
    pub(crate) fn flush_tls(&mut self) -> Result<(), ErrorCode> {
        if let Some(session) = self.tls.as_mut() {
            Self::drain_tls(session, &mut self.outgoing)?;
        }
        Ok(())
    }

    fn drain_tls(session: &mut rustls::Connection, outgoing: &mut Vec<Bytes>) -> Result<(), ErrorCode> {
        while session.wants_write() {
            let mut buf = Vec::new();
            session.write_tls(&mut buf).map_err(|_| ErrorCode::TlsError)?;
            if buf.is_empty() {
                break;
            }
            outgoing.push(Bytes::from(buf));
        }
        Ok(())
    }
}
