use std::collections::VecDeque;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Instant;

use rand::Rng;

use crate::ConnectionHandle;

/// Index of an accepted send in the node's in-flight table
///
/// A message that has been accepted by `send` lives in exactly one place:
/// a remote queue, the waiting-for-ack slot, or the writer. The table entry
/// is removed when the send completes and the message is handed back.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct SendId(pub(crate) usize);

/// Address family tag; ordered before address and port in the remote tree
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) enum IpFamily {
    V4,
    V6,
}

/// Key of a peer endpoint: family, address bytes, then port
///
/// An IPv4 address occupies the first four bytes; the rest stay zero so the
/// full-width comparison matches the family-specific one.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RemoteKey {
    family: IpFamily,
    addr: [u8; 16],
    port: u16,
}

impl RemoteKey {
    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        let ip = match self.family {
            IpFamily::V4 => {
                let mut octets = [0; 4];
                octets.copy_from_slice(&self.addr[..4]);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            IpFamily::V6 => IpAddr::V6(Ipv6Addr::from(self.addr)),
        };
        SocketAddr::new(ip, self.port)
    }
}

impl From<SocketAddr> for RemoteKey {
    fn from(x: SocketAddr) -> Self {
        let mut addr = [0; 16];
        let family = match x.ip() {
            IpAddr::V4(ip) => {
                addr[..4].copy_from_slice(&ip.octets());
                IpFamily::V4
            }
            IpAddr::V6(ip) => {
                addr.copy_from_slice(&ip.octets());
                IpFamily::V6
            }
        };
        Self {
            family,
            addr,
            port: x.port(),
        }
    }
}

impl fmt::Debug for RemoteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr())
    }
}

impl fmt::Display for RemoteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A known peer endpoint with its send state
///
/// At most one connection is current for a remote at any time; at most one
/// message sits in the waiting-for-ack slot. Control messages (acks, noops)
/// and data messages queue separately so acks can overtake data at dispatch
/// time without reordering either queue.
pub(crate) struct Remote {
    pub(crate) key: RemoteKey,
    pub(crate) conn: Option<ConnectionHandle>,
    /// Acks and noops; never throttled by the ack window
    pub(crate) cntl_queue: VecDeque<SendId>,
    /// User messages
    pub(crate) data_queue: VecDeque<SendId>,
    /// The one message whose ack is outstanding, in synchronous mode
    pub(crate) wait_ack: Option<SendId>,
    /// A liveness probe is already queued or in flight
    pub(crate) noop_queued: bool,
    /// Serial of the last written message; randomized at allocation
    pub(crate) serial: u32,
    /// Reconnect debounce: connects are blocked until the debounce timer
    /// clears the flag
    pub(crate) conn_blocked: bool,
    pub(crate) timestamp: Instant,
}

impl Remote {
    pub(crate) fn new<R: Rng>(key: RemoteKey, now: Instant, rng: &mut R) -> Self {
        Self {
            key,
            conn: None,
            cntl_queue: VecDeque::new(),
            data_queue: VecDeque::new(),
            wait_ack: None,
            noop_queued: false,
            serial: rng.gen(),
            conn_blocked: false,
            timestamp: now,
        }
    }

    pub(crate) fn has_queued(&self) -> bool {
        !self.cntl_queue.is_empty() || !self.data_queue.is_empty()
    }

    /// Next serial, wrapping at 2^32
    pub(crate) fn bump_serial(&mut self) -> u32 {
        self.serial = self.serial.wrapping_add(1);
        self.serial
    }
}
