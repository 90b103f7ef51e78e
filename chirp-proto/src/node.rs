use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use slab::Slab;
use tracing::{debug, trace, warn};

use crate::coding::Codec;
use crate::config::{Config, ConfigError};
use crate::connection::{ConnFlags, Connection, ReadState};
use crate::crypto::{is_loopback, TlsContext};
use crate::message::{Message, MessageFlags, SlotToken};
use crate::pool::SlotPool;
use crate::remote::{Remote, RemoteKey, SendId};
use crate::timer::Timer;
use crate::wire::{Handshake, MessageType, WireHeader};
use crate::{
    ConnectionHandle, ErrorCode, Identity, HANDSHAKE_SIZE, PREALLOC_DATA, PREALLOC_HEADER,
    WIRE_MSG_SIZE,
};

/// Bytes to write to one connection's stream
///
/// The runtime must report every transmit back through
/// [`Node::handle_flushed`] once the bytes have been handed to the socket,
/// in order; write completions and send timeouts depend on it.
#[derive(Debug)]
pub struct Transmit {
    pub handle: ConnectionHandle,
    pub contents: Bytes,
}

/// Socket operations requested from the runtime
#[derive(Debug)]
pub enum IoRequest {
    /// Dial `addr`; report the outcome via [`Node::handle_connected`] or
    /// [`Node::handle_connect_failed`]
    Connect {
        handle: ConnectionHandle,
        addr: SocketAddr,
    },
    /// Close the stream; confirm via [`Node::handle_closed`] after all
    /// pending transmits for this connection have been resolved
    Close { handle: ConnectionHandle },
    /// Stop reading from the stream until resumed
    PauseRead { handle: ConnectionHandle },
    /// Reading may continue
    ResumeRead { handle: ConnectionHandle },
    /// The node is closing; stop accepting connections
    StopListen,
}

/// Things the application needs to hear about
#[derive(Debug)]
pub enum Event {
    /// A message arrived; it occupies a receive slot until released via
    /// [`Node::release_slot`]
    Message(Message),
    /// A send accepted earlier completed with `status`, exactly once per
    /// accepted send
    MessageSent {
        token: u64,
        msg: Message,
        status: ErrorCode,
    },
    /// A slot release requested with a token finished
    Released { token: u64 },
    /// Close-down finished; every connection is gone
    Closed,
}

/// Immediate result of an accepted send
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendOutcome {
    /// The message was first in line on its remote
    Success,
    /// The message was placed behind others
    Queued,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum NodeState {
    Running,
    Closing,
    Closed,
}

struct SendEntry {
    msg: Message,
    /// Application token for the completion event; internal acks and noops
    /// have none
    token: Option<u64>,
}

/// The protocol root: remotes, connections, slots and in-flight sends
///
/// Performs no I/O. The runtime feeds it socket bytes and completions and
/// drains three queues: transmits, I/O requests and application events.
/// After any `handle_*` call, drain [`Node::poll_transmit`],
/// [`Node::poll_io`] and [`Node::poll_event`] until empty, and re-arm the
/// timer from [`Node::poll_timeout`].
pub struct Node {
    config: Arc<Config>,
    tls: Option<TlsContext>,
    identity: Identity,
    public_port: u16,
    rng: StdRng,
    state: NodeState,
    connections: Slab<Connection>,
    pools: Slab<SlotPool>,
    flight: Slab<SendEntry>,
    remotes: BTreeMap<RemoteKey, Remote>,
    handshake_conns: BTreeSet<ConnectionHandle>,
    old_connections: BTreeSet<ConnectionHandle>,
    reconnect_stack: Vec<RemoteKey>,
    debounce_at: Option<Instant>,
    gc_at: Instant,
    transmits: VecDeque<Transmit>,
    io: VecDeque<IoRequest>,
    events: VecDeque<Event>,
}

impl Node {
    /// Create a node; fails when the configuration is invalid or encryption
    /// is enabled without a TLS context
    pub fn new(
        config: Arc<Config>,
        tls: Option<TlsContext>,
        now: Instant,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if !config.disable_encryption && tls.is_none() {
            return Err(ConfigError::IllegalValue(
                "encryption enabled but no TLS context supplied",
            ));
        }
        let mut rng = StdRng::from_entropy();
        let identity = if config.identity.is_zero() {
            Identity::random(&mut rng)
        } else {
            config.identity
        };
        let gc_at = now + Self::gc_interval(&config, &mut rng);
        debug!(%identity, "node initialized");
        Ok(Self {
            public_port: config.port,
            config,
            tls,
            identity,
            rng,
            state: NodeState::Running,
            connections: Slab::new(),
            pools: Slab::new(),
            flight: Slab::new(),
            remotes: BTreeMap::new(),
            handshake_conns: BTreeSet::new(),
            old_connections: BTreeSet::new(),
            reconnect_stack: Vec::new(),
            debounce_at: None,
            gc_at,
            transmits: VecDeque::new(),
            io: VecDeque::new(),
            events: VecDeque::new(),
        })
    }

    /// The node identity, random unless configured
    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Override the port advertised in handshakes, for nodes behind port
    /// forwarding
    pub fn set_public_port(&mut self, port: u16) {
        self.public_port = port;
    }

    /// Next outgoing buffer, if any
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    /// Next socket request, if any
    pub fn poll_io(&mut self) -> Option<IoRequest> {
        self.io.pop_front()
    }

    /// Next application event, if any
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Earliest instant at which [`Node::handle_timeout`] must run
    pub fn poll_timeout(&self) -> Option<Instant> {
        let mut next = self
            .connections
            .iter()
            .filter_map(|(_, conn)| conn.timers.next_timeout())
            .min();
        if let Some(at) = self.debounce_at {
            next = Some(next.map_or(at, |x| x.min(at)));
        }
        if self.state == NodeState::Running {
            next = Some(next.map_or(self.gc_at, |x| x.min(self.gc_at)));
        }
        next
    }

    /// Fire every timer that expired at `now`
    pub fn handle_timeout(&mut self, now: Instant) {
        let mut expired = Vec::new();
        for (idx, conn) in self.connections.iter_mut() {
            for timer in conn.timers.expired(now) {
                expired.push((ConnectionHandle(idx), timer));
            }
        }
        for (ch, timer) in expired {
            match timer {
                Timer::Connect => {
                    debug!(conn = ch.0, "connect or handshake timed out");
                    self.shutdown_connection(ch, ErrorCode::Timeout, now);
                }
                Timer::Send => {
                    debug!(conn = ch.0, "write timed out");
                    self.shutdown_connection(ch, ErrorCode::Timeout, now);
                }
            }
        }
        if self.debounce_at.map_or(false, |at| at <= now) {
            self.debounce_at = None;
            self.reconnect_blocked(now);
        }
        if self.state == NodeState::Running && self.gc_at <= now {
            self.gc_sweep(now);
            let interval = Self::gc_interval(&self.config, &mut self.rng);
            self.gc_at = now + interval;
        }
    }

    /// Register an accepted incoming stream
    pub fn accept(&mut self, now: Instant, peer: SocketAddr) -> Result<ConnectionHandle, ErrorCode> {
        if self.state != NodeState::Running {
            return Err(ErrorCode::Shutdown);
        }
        let mut flags = ConnFlags::INCOMING;
        let mut session = None;
        if self.requires_tls(peer) {
            flags.insert(ConnFlags::ENCRYPTED);
            session = Some(
                self.tls
                    .as_ref()
                    .expect("encryption required without TLS context")
                    .accept_session()
                    .map_err(|_| ErrorCode::TlsError)?,
            );
        }
        let handle = ConnectionHandle(self.connections.vacant_key());
        let pool = self
            .pools
            .insert(SlotPool::new(handle, self.config.effective_max_slots()));
        let mut conn = Connection::new(peer, 0, flags, pool, now);
        conn.timers[Timer::Connect] = Some(now + self.config.timeout);
        if let Some(session) = session {
            conn.set_tls(session);
        }
        self.connections.insert(conn);
        self.handshake_conns.insert(handle);
        debug!(conn = handle.0, %peer, "accepted connection");
        if !flags.contains(ConnFlags::ENCRYPTED) {
            self.send_app_handshake(handle, now);
        }
        Ok(handle)
    }

    /// The dial for `handle` succeeded
    pub fn handle_connected(&mut self, ch: ConnectionHandle, now: Instant) {
        let Some(conn) = self.connections.get_mut(ch.0) else {
            return;
        };
        if conn.flags.contains(ConnFlags::SHUTTING_DOWN) {
            return;
        }
        debug!(conn = ch.0, peer = %conn.peer, "connected to remote");
        if conn.flags.contains(ConnFlags::ENCRYPTED) {
            let session = match self
                .tls
                .as_ref()
                .expect("encryption required without TLS context")
                .connect_session(conn.peer.ip())
            {
                Ok(session) => session,
                Err(_) => {
                    self.shutdown_connection(ch, ErrorCode::TlsError, now);
                    return;
                }
            };
            let conn = self.connections.get_mut(ch.0).expect("connection exists");
            conn.set_tls(session);
            if conn.flush_tls().is_err() {
                self.shutdown_connection(ch, ErrorCode::TlsError, now);
                return;
            }
            self.pump_outgoing(ch);
        } else {
            self.send_app_handshake(ch, now);
        }
    }

    /// The dial for `handle` failed
    pub fn handle_connect_failed(&mut self, ch: ConnectionHandle, now: Instant) {
        if let Some(conn) = self.connections.get(ch.0) {
            warn!(conn = ch.0, peer = %conn.peer, "connection to remote failed");
        }
        self.shutdown_connection(ch, ErrorCode::CannotConnect, now);
    }

    /// Bytes arrived on `handle`'s stream
    pub fn handle_input(&mut self, ch: ConnectionHandle, now: Instant, data: &[u8]) {
        let Some(conn) = self.connections.get_mut(ch.0) else {
            return;
        };
        if conn.flags.contains(ConnFlags::SHUTTING_DOWN) {
            return;
        }
        if conn.flags.contains(ConnFlags::STOPPED) {
            conn.pending_transport.extend_from_slice(data);
            return;
        }
        let fed = conn.feed_transport(data);
        self.pump_outgoing(ch);
        match fed {
            Ok(tls_finished) => {
                if tls_finished {
                    self.send_app_handshake(ch, now);
                }
                self.drive_reader(ch, now);
            }
            Err(code) => {
                self.shutdown_connection(ch, code, now);
            }
        }
    }

    /// The stream for `handle` hit EOF or a read error
    pub fn handle_stream_closed(&mut self, ch: ConnectionHandle, now: Instant) {
        let Some(conn) = self.connections.get(ch.0) else {
            return;
        };
        if conn.flags.contains(ConnFlags::SHUTTING_DOWN) {
            return;
        }
        trace!(conn = ch.0, "stream closed by peer");
        self.shutdown_connection(ch, ErrorCode::ProtocolError, now);
    }

    /// One transmit for `handle` was written out (or failed)
    pub fn handle_flushed(&mut self, ch: ConnectionHandle, now: Instant, result: Result<(), ()>) {
        let Some(conn) = self.connections.get_mut(ch.0) else {
            return;
        };
        conn.awaiting_flush = conn.awaiting_flush.saturating_sub(1);
        if conn.flags.contains(ConnFlags::SHUTTING_DOWN) {
            return;
        }
        if result.is_err() {
            self.shutdown_connection(ch, ErrorCode::WriteError, now);
            return;
        }
        if !(conn.write_pending_done && conn.awaiting_flush == 0 && conn.outgoing.is_empty()) {
            return;
        }
        conn.write_pending_done = false;
        let sid = conn
            .writer
            .current
            .take()
            .expect("write completed without a message");
        conn.timestamp = now;
        let key = conn.remote;
        if let Some(remote) = key.and_then(|k| self.remotes.get_mut(&k)) {
            remote.timestamp = now;
        }
        let entry = self.flight.get_mut(sid.0).expect("in-flight entry exists");
        if !entry.msg.ty.contains(MessageType::REQ_ACK) {
            // No ack will come; emulate it
            entry.msg.flags.insert(MessageFlags::ACK_RECEIVED);
        }
        entry.msg.flags.insert(MessageFlags::WRITE_DONE);
        self.finish_message(ch, sid, ErrorCode::Success, now);
    }

    /// The runtime confirmed that `handle`'s stream is closed and no more
    /// I/O will be reported for it
    pub fn handle_closed(&mut self, ch: ConnectionHandle) {
        if !self.connections.contains(ch.0) {
            return;
        }
        let conn = self.connections.remove(ch.0);
        trace!(conn = ch.0, "connection freed");
        if let Some(pool) = self.pools.get_mut(conn.reader.pool) {
            pool.conn = None;
            if pool.decref() {
                self.pools.remove(conn.reader.pool);
            }
        }
        self.check_closed();
    }

    /// Queue a message to its remote; the completion event carries `token`
    ///
    /// Immediately rejected when the node is closing; the message is handed
    /// back with the error.
    pub fn send(
        &mut self,
        now: Instant,
        mut msg: Message,
        token: u64,
    ) -> Result<SendOutcome, (Message, ErrorCode)> {
        if self.state != NodeState::Running {
            return Err((msg, ErrorCode::Shutdown));
        }
        // Synchronous mode forces the ack round-trip on every user message
        msg.ty = if self.config.synchronous {
            MessageType::REQ_ACK
        } else {
            MessageType::NONE
        };
        Ok(self.send_internal(msg, Some(token), now))
    }

    /// Release the slot held by a received message
    ///
    /// Sends the pending ack when the message requested one, restarts the
    /// stream when the reader was stopped on an exhausted pool, and emits
    /// [`Event::Released`] when a token is supplied.
    pub fn release_slot(&mut self, now: Instant, mut msg: Message, token: Option<u64>) {
        let Some(slot) = msg.slot.take() else {
            // Not a slot-bearing message; nothing to do
            if let Some(token) = token {
                self.events.push_back(Event::Released { token });
            }
            return;
        };
        msg.flags.remove(MessageFlags::HAS_SLOT);
        if msg.flags.contains(MessageFlags::SEND_ACK) && self.state == NodeState::Running {
            let mut ack = Message::new(msg.peer);
            ack.identity = msg.identity;
            ack.ty = MessageType::ACK;
            trace!(id = %ack.identity, "sending ack");
            self.send_internal(ack, None, now);
        }
        let conn = match self.pools.get_mut(slot.pool) {
            Some(pool) => {
                pool.release(slot.slot);
                let conn = pool.conn;
                if pool.decref() {
                    self.pools.remove(slot.pool);
                }
                conn
            }
            None => None,
        };
        if let Some(ch) = conn {
            self.resume_read(ch, now);
        }
        if let Some(token) = token {
            self.events.push_back(Event::Released { token });
        }
    }

    /// Begin node close-down
    ///
    /// Aborts every queued message with `Shutdown`, tears down every
    /// connection and remote, and emits [`Event::Closed`] once the last
    /// connection is confirmed gone.
    pub fn close(&mut self, now: Instant) -> Result<(), ErrorCode> {
        match self.state {
            NodeState::Closed => return Err(ErrorCode::Fatal),
            NodeState::Closing => return Err(ErrorCode::InProgress),
            NodeState::Running => {}
        }
        debug!("closing node");
        self.state = NodeState::Closing;
        self.io.push_back(IoRequest::StopListen);
        self.close_free_remotes(now, false);
        self.debounce_at = None;
        self.check_closed();
        Ok(())
    }

    /// Tear down connections, and unless `only_conns`, all remotes too
    pub fn close_free_remotes(&mut self, now: Instant, only_conns: bool) {
        let keys: Vec<RemoteKey> = self.remotes.keys().copied().collect();
        if only_conns {
            for key in keys {
                let conn = self.remotes.get(&key).and_then(|r| r.conn);
                if let Some(ch) = conn {
                    self.shutdown_connection(ch, ErrorCode::Shutdown, now);
                }
            }
        } else {
            for key in keys {
                self.abort_all_messages(key, ErrorCode::Shutdown);
                let conn = self.remotes.get(&key).and_then(|r| r.conn);
                if let Some(ch) = conn {
                    self.shutdown_connection(ch, ErrorCode::Shutdown, now);
                }
                self.remotes.remove(&key);
            }
            self.reconnect_stack.clear();
        }
        for ch in mem::take(&mut self.old_connections) {
            self.shutdown_connection(ch, ErrorCode::Shutdown, now);
        }
        for ch in mem::take(&mut self.handshake_conns) {
            self.shutdown_connection(ch, ErrorCode::Shutdown, now);
        }
    }

    // Sending internals

    fn send_internal(&mut self, mut msg: Message, token: Option<u64>, now: Instant) -> SendOutcome {
        debug_assert!(!msg.flags.contains(MessageFlags::USED), "message in use");
        msg.flags.insert(MessageFlags::USED);
        let key = RemoteKey::from(msg.peer);
        let control = msg.ty.is_control();
        let rng = &mut self.rng;
        self.remotes
            .entry(key)
            .or_insert_with(|| Remote::new(key, now, rng));
        self.enqueue_probe_if_needed(key, now);
        let sid = SendId(self.flight.insert(SendEntry { msg, token }));
        let remote = self.remotes.get_mut(&key).expect("remote exists");
        let queued = if control {
            let queued = !remote.cntl_queue.is_empty();
            remote.cntl_queue.push_back(sid);
            queued
        } else {
            let queued = !remote.data_queue.is_empty();
            remote.data_queue.push_back(sid);
            queued
        };
        self.process_queues(key, now);
        if queued {
            SendOutcome::Queued
        } else {
            SendOutcome::Success
        }
    }

    /// A remote idle for 3/4 of the reuse time gets a probe ahead of the
    /// next message, so a garbage-collection race on the peer hits the
    /// probe instead of the message
    fn enqueue_probe_if_needed(&mut self, key: RemoteKey, now: Instant) {
        let remote = self.remotes.get_mut(&key).expect("remote exists");
        if now.duration_since(remote.timestamp) <= self.config.probe_threshold() {
            return;
        }
        if remote.noop_queued {
            return;
        }
        remote.noop_queued = true;
        let mut noop = Message::new(key.addr());
        noop.identity = Identity::default();
        noop.ty = MessageType::NOOP;
        noop.flags.insert(MessageFlags::USED);
        trace!(remote = %key, "sending NOOP");
        let sid = SendId(self.flight.insert(SendEntry {
            msg: noop,
            token: None,
        }));
        let remote = self.remotes.get_mut(&key).expect("remote exists");
        remote.cntl_queue.push_back(sid);
    }

    /// The per-remote dispatcher: pick at most one message to write
    ///
    /// Control messages always go first. Data messages are gated on the
    /// waiting-for-ack slot in synchronous mode. With no connection and a
    /// non-empty queue, dial one unless the remote is debounce-blocked.
    fn process_queues(&mut self, key: RemoteKey, now: Instant) -> ErrorCode {
        let Some(remote) = self.remotes.get_mut(&key) else {
            return ErrorCode::Empty;
        };
        let Some(ch) = remote.conn else {
            if remote.conn_blocked {
                return ErrorCode::Busy;
            }
            if !remote.has_queued() {
                return ErrorCode::Empty;
            }
            return self.connect_remote(key, now);
        };
        let conn = self.connections.get(ch.0).expect("current connection exists");
        if !conn.flags.contains(ConnFlags::CONNECTED)
            || conn.flags.contains(ConnFlags::SHUTTING_DOWN)
        {
            return ErrorCode::Busy;
        }
        if conn.writer.current.is_some() {
            return ErrorCode::Busy;
        }
        let remote = self.remotes.get_mut(&key).expect("remote exists");
        if let Some(sid) = remote.cntl_queue.pop_front() {
            debug_assert!(
                self.flight[sid.0].msg.ty.is_control(),
                "control queue carries acks and noops only",
            );
            self.write_message(ch, sid, now);
            return ErrorCode::Success;
        }
        if self.config.synchronous {
            if remote.wait_ack.is_some() {
                if remote.data_queue.is_empty() {
                    return ErrorCode::Empty;
                }
                return ErrorCode::Busy;
            }
            match remote.data_queue.pop_front() {
                Some(sid) => {
                    remote.wait_ack = Some(sid);
                    self.write_message(ch, sid, now);
                    ErrorCode::Success
                }
                None => ErrorCode::Empty,
            }
        } else {
            match remote.data_queue.pop_front() {
                Some(sid) => {
                    debug_assert!(!self.flight[sid.0].msg.ty.contains(MessageType::REQ_ACK));
                    self.write_message(ch, sid, now);
                    ErrorCode::Success
                }
                None => ErrorCode::Empty,
            }
        }
    }

    fn connect_remote(&mut self, key: RemoteKey, now: Instant) -> ErrorCode {
        let addr = key.addr();
        let mut flags = ConnFlags::default();
        if self.requires_tls(addr) {
            flags.insert(ConnFlags::ENCRYPTED);
        }
        let handle = ConnectionHandle(self.connections.vacant_key());
        let pool = self
            .pools
            .insert(SlotPool::new(handle, self.config.effective_max_slots()));
        let mut conn = Connection::new(addr, key.port(), flags, pool, now);
        conn.remote = Some(key);
        conn.timers[Timer::Connect] = Some(now + self.config.timeout);
        self.connections.insert(conn);
        self.remotes.get_mut(&key).expect("remote exists").conn = Some(handle);
        debug!(conn = handle.0, remote = %key, "connecting to remote");
        self.io.push_back(IoRequest::Connect { handle, addr });
        ErrorCode::Success
    }

    fn write_message(&mut self, ch: ConnectionHandle, sid: SendId, now: Instant) {
        let conn = self.connections.get_mut(ch.0).expect("connection exists");
        debug_assert!(conn.writer.current.is_none(), "writer busy");
        conn.writer.current = Some(sid);
        let key = conn.remote.expect("write on unbound connection");
        let serial = self
            .remotes
            .get_mut(&key)
            .expect("remote exists")
            .bump_serial();
        let entry = self.flight.get_mut(sid.0).expect("in-flight entry exists");
        entry.msg.serial = serial;
        let wire = entry.msg.wire_header();
        let mut scratch = [0u8; WIRE_MSG_SIZE];
        wire.encode(&mut &mut scratch[..]);
        let header = entry.msg.header.clone();
        let data = entry.msg.data.clone();
        trace!(
            conn = ch.0,
            id = %entry.msg.identity,
            serial,
            len = wire.body_len(),
            "writing message",
        );
        let res = conn.write_record(&[&scratch, &header, &data]);
        conn.write_pending_done = true;
        conn.timers[Timer::Send] = Some(now + self.config.timeout);
        self.pump_outgoing(ch);
        if let Err(code) = res {
            self.shutdown_connection(ch, code, now);
        }
    }

    /// Fire the send completion exactly once, when the write is done and
    /// the ack (real or emulated) arrived, or the message was aborted; then
    /// let the remote dispatch its next message
    fn finish_message(&mut self, ch: ConnectionHandle, sid: SendId, status: ErrorCode, now: Instant) {
        let Some(entry) = self.flight.get(sid.0) else {
            return;
        };
        let flags = entry.msg.flags;
        let complete = (flags.contains(MessageFlags::ACK_RECEIVED)
            && flags.contains(MessageFlags::WRITE_DONE))
            || flags.contains(MessageFlags::FAILURE);
        if complete {
            let mut entry = self.flight.remove(sid.0);
            entry.msg.flags.remove(
                MessageFlags::ACK_RECEIVED
                    | MessageFlags::WRITE_DONE
                    | MessageFlags::USED
                    | MessageFlags::FAILURE,
            );
            if let Some(conn) = self.connections.get_mut(ch.0) {
                conn.timers[Timer::Send] = None;
            }
            if entry.msg.ty.contains(MessageType::NOOP) {
                let key = RemoteKey::from(entry.msg.peer);
                if let Some(remote) = self.remotes.get_mut(&key) {
                    remote.noop_queued = false;
                }
            }
            match entry.token {
                Some(token) => {
                    debug!(id = %entry.msg.identity, ?status, "finishing message");
                    self.events.push_back(Event::MessageSent {
                        token,
                        msg: entry.msg,
                        status,
                    });
                }
                None => {
                    trace!(id = %entry.msg.identity, ?status, "finished control message");
                }
            }
        }
        // Look the remote up by key when the connection was already
        // disassociated during shutdown
        let key = self
            .connections
            .get(ch.0)
            .map(|conn| conn.remote.unwrap_or_else(|| conn.remote_key()));
        if let Some(key) = key {
            self.process_queues(key, now);
        }
    }

    fn abort_one_message(&mut self, key: RemoteKey, err: ErrorCode) {
        let Some(remote) = self.remotes.get_mut(&key) else {
            return;
        };
        let sid = remote
            .cntl_queue
            .pop_front()
            .or_else(|| remote.data_queue.pop_front());
        if let Some(sid) = sid {
            self.abort_send(sid, err);
        }
    }

    fn abort_all_messages(&mut self, key: RemoteKey, err: ErrorCode) {
        let Some(remote) = self.remotes.get_mut(&key) else {
            return;
        };
        let data: Vec<SendId> = remote.data_queue.drain(..).collect();
        let cntl: Vec<SendId> = remote.cntl_queue.drain(..).collect();
        remote.noop_queued = false;
        for sid in data {
            self.abort_send(sid, err);
        }
        for sid in cntl {
            self.abort_send(sid, err);
        }
    }

    /// Complete a queued-but-unwritten send with an error
    fn abort_send(&mut self, sid: SendId, err: ErrorCode) {
        if !self.flight.contains(sid.0) {
            return;
        }
        let mut entry = self.flight.remove(sid.0);
        entry.msg.flags.remove(MessageFlags::USED);
        if let Some(token) = entry.token {
            debug!(id = %entry.msg.identity, ?err, "aborting message");
            self.events.push_back(Event::MessageSent {
                token,
                msg: entry.msg,
                status: err,
            });
        }
    }

    // Connection teardown

    /// Start the staged teardown of a connection; idempotent
    pub(crate) fn shutdown_connection(
        &mut self,
        ch: ConnectionHandle,
        reason: ErrorCode,
        now: Instant,
    ) {
        let Some(conn) = self.connections.get_mut(ch.0) else {
            return;
        };
        if conn.flags.contains(ConnFlags::SHUTTING_DOWN) {
            trace!(conn = ch.0, "shutdown already in progress");
            return;
        }
        debug!(conn = ch.0, ?reason, "shutdown connection");
        conn.flags.insert(ConnFlags::SHUTTING_DOWN);
        conn.flags.remove(ConnFlags::CONNECTED);
        conn.timers.stop_all();
        conn.pending_input.clear();
        conn.pending_transport.clear();
        conn.outgoing.clear();
        conn.write_pending_done = false;
        let msg = conn.writer.current.take();
        let remote_key = conn.remote.take().unwrap_or_else(|| conn.remote_key());
        self.handshake_conns.remove(&ch);
        self.old_connections.remove(&ch);
        self.debounce_remote(remote_key, now);
        let mut wam = None;
        if let Some(remote) = self.remotes.get_mut(&remote_key) {
            wam = remote.wait_ack.take();
            if remote.conn == Some(ch) {
                remote.conn = None;
            }
            // Acks and noops are useless once their connection is gone
            let cntl: Vec<SendId> = remote.cntl_queue.drain(..).collect();
            remote.noop_queued = false;
            for sid in cntl {
                if msg != Some(sid) && wam != Some(sid) {
                    self.flight.try_remove(sid.0);
                }
            }
        }
        if let Some(wam) = wam {
            if let Some(entry) = self.flight.get_mut(wam.0) {
                entry.msg.flags.insert(MessageFlags::FAILURE);
            }
            self.finish_message(ch, wam, reason, now);
        }
        if let Some(msg) = msg {
            if Some(msg) != wam {
                if let Some(entry) = self.flight.get_mut(msg.0) {
                    entry.msg.flags.insert(MessageFlags::FAILURE);
                    self.finish_message(ch, msg, reason, now);
                }
            }
        }
        if wam.is_none() && msg.is_none() {
            self.abort_one_message(remote_key, reason);
        }
        self.io.push_back(IoRequest::Close { handle: ch });
    }

    /// After a failed connection, block its remote from reconnecting for
    /// 50-550 ms; the debounce timer drains the whole stack at once
    fn debounce_remote(&mut self, key: RemoteKey, now: Instant) {
        if let Some(remote) = self.remotes.get_mut(&key) {
            if self.reconnect_stack.is_empty() && self.state == NodeState::Running {
                let jitter = Duration::from_millis(50 + self.rng.gen_range(0..500));
                self.debounce_at = Some(now + jitter);
            }
            if !remote.conn_blocked {
                remote.conn_blocked = true;
                self.reconnect_stack.push(key);
            }
        }
    }

    fn reconnect_blocked(&mut self, now: Instant) {
        let keys = mem::take(&mut self.reconnect_stack);
        for key in &keys {
            if let Some(remote) = self.remotes.get_mut(key) {
                remote.conn_blocked = false;
            }
        }
        for key in keys {
            trace!(remote = %key, "reconnect unblocked");
            self.process_queues(key, now);
        }
    }

    // Garbage collection

    fn gc_interval(config: &Config, rng: &mut StdRng) -> Duration {
        let half = (config.reuse_time.as_millis() as u64) / 2;
        Duration::from_millis(half + rng.gen_range(0..half.max(1)))
    }

    /// Shut down aged-out superseded connections, then drop remotes idle
    /// for longer than the reuse time
    fn gc_sweep(&mut self, now: Instant) {
        trace!("garbage-collecting connections and remotes");
        let reuse = self.config.reuse_time;
        let old: Vec<ConnectionHandle> = self.old_connections.iter().copied().collect();
        for ch in old {
            let stale = self
                .connections
                .get(ch.0)
                .map_or(false, |conn| now.duration_since(conn.timestamp) > reuse);
            if stale {
                debug!(conn = ch.0, "garbage-collecting connection");
                self.shutdown_connection(ch, ErrorCode::Shutdown, now);
            }
        }
        let stale: Vec<RemoteKey> = self
            .remotes
            .iter()
            .filter(|(_, remote)| {
                !remote.conn_blocked && now.duration_since(remote.timestamp) > reuse
            })
            .map(|(key, _)| *key)
            .collect();
        for key in stale {
            debug!(remote = %key, "garbage-collecting remote");
            self.abort_all_messages(key, ErrorCode::Shutdown);
            let conn = self.remotes.get(&key).and_then(|r| r.conn);
            if let Some(ch) = conn {
                // Block the doomed remote so teardown does not requeue it
                self.remotes.get_mut(&key).expect("remote exists").conn_blocked = true;
                self.shutdown_connection(ch, ErrorCode::Shutdown, now);
            }
            self.remotes.remove(&key);
            debug_assert!(!self.reconnect_stack.contains(&key));
        }
    }

    // Reading

    /// Run the read machine over the connection's pending plaintext
    fn drive_reader(&mut self, ch: ConnectionHandle, now: Instant) {
        let Some(conn) = self.connections.get_mut(ch.0) else {
            return;
        };
        if conn.flags.contains(ConnFlags::SHUTTING_DOWN) {
            conn.pending_input.clear();
            return;
        }
        let mut buf = mem::take(&mut conn.pending_input);
        let mut offset = 0;
        loop {
            let state = match self.connections.get(ch.0) {
                Some(conn) if !conn.flags.contains(ConnFlags::SHUTTING_DOWN) => conn.reader.state,
                _ => return,
            };
            trace!(conn = ch.0, ?state, offset, "reader step");
            let step = match state {
                ReadState::Handshake => self.read_handshake(ch, now, &buf, &mut offset),
                ReadState::Wait => self.read_wait(ch, now, &buf, &mut offset),
                ReadState::Slot => self.read_slot(ch, now),
                ReadState::Header => self.read_body(ch, now, &buf, &mut offset, BodyPart::Header),
                ReadState::Data => self.read_body(ch, now, &buf, &mut offset, BodyPart::Data),
            };
            match step {
                Ok(Step::Continue) => {}
                Ok(Step::NeedMore) => break,
                Ok(Step::Stopped) => {
                    let leftover = buf.split_off(offset);
                    if let Some(conn) = self.connections.get_mut(ch.0) {
                        conn.pending_input = leftover;
                    }
                    return;
                }
                Err(code) => {
                    self.shutdown_connection(ch, code, now);
                    return;
                }
            }
        }
        if offset < buf.len() {
            let leftover = buf.split_off(offset);
            if let Some(conn) = self.connections.get_mut(ch.0) {
                conn.pending_input = leftover;
            }
        }
    }

    /// The whole handshake record must arrive in one read
    fn read_handshake(
        &mut self,
        ch: ConnectionHandle,
        now: Instant,
        buf: &BytesMut,
        offset: &mut usize,
    ) -> Result<Step, ErrorCode> {
        let available = buf.len() - *offset;
        if available == 0 {
            return Ok(Step::NeedMore);
        }
        if available < HANDSHAKE_SIZE {
            warn!(conn = ch.0, available, "illegal handshake size");
            return Err(ErrorCode::ProtocolError);
        }
        let hs = Handshake::decode(&mut &buf[*offset..*offset + HANDSHAKE_SIZE])
            .map_err(|_| ErrorCode::ProtocolError)?;
        *offset += HANDSHAKE_SIZE;
        let conn = self.connections.get_mut(ch.0).expect("connection exists");
        conn.timers[Timer::Connect] = None;
        conn.flags.insert(ConnFlags::CONNECTED);
        conn.port = hs.port;
        conn.remote_identity = hs.identity;
        conn.reader.state = ReadState::Wait;
        let incoming = conn.flags.contains(ConnFlags::INCOMING);
        let key = conn.remote_key();
        conn.remote = Some(key);
        debug!(
            conn = ch.0,
            remote = %key,
            id = %hs.identity,
            "handshake with remote done",
        );
        if incoming {
            self.handshake_conns.remove(&ch);
        }
        let rng = &mut self.rng;
        let remote = self
            .remotes
            .entry(key)
            .or_insert_with(|| Remote::new(key, now, rng));
        // The connection completing its handshake last wins; the loser goes
        // to the old set for garbage collection. When both sides raced, our
        // own fresh connection may sit in that set: take it back out.
        let old = remote.conn.replace(ch);
        self.old_connections.remove(&ch);
        if let Some(old) = old {
            if old != ch {
                debug!(conn = ch.0, old = old.0, "connection replaced by network race");
                self.old_connections.insert(old);
            }
        }
        self.process_queues(key, now);
        Ok(Step::Continue)
    }

    /// Accumulate and validate a wire header, then dispatch on its type
    fn read_wait(
        &mut self,
        ch: ConnectionHandle,
        now: Instant,
        buf: &BytesMut,
        offset: &mut usize,
    ) -> Result<Step, ErrorCode> {
        let available = buf.len() - *offset;
        if available == 0 {
            return Ok(Step::NeedMore);
        }
        let conn = self.connections.get_mut(ch.0).expect("connection exists");
        let have = conn.reader.bytes_read;
        let take = (WIRE_MSG_SIZE - have).min(available);
        conn.reader.scratch[have..have + take].copy_from_slice(&buf[*offset..*offset + take]);
        conn.reader.bytes_read += take;
        *offset += take;
        if conn.reader.bytes_read < WIRE_MSG_SIZE {
            return Ok(Step::NeedMore);
        }
        conn.reader.bytes_read = 0;
        let wire =
            WireHeader::decode(&mut &conn.reader.scratch[..]).expect("scratch holds a full header");
        if wire.body_len() > self.config.max_msg_size as usize {
            warn!(
                conn = ch.0,
                len = wire.body_len(),
                "message size exceeds hard limit",
            );
            return Err(ErrorCode::ProtocolError);
        }
        if wire.ty.is_control() {
            if wire.header_len != 0 || wire.data_len != 0 {
                warn!(conn = ch.0, "ack or noop with payload");
                return Err(ErrorCode::ProtocolError);
            }
            if wire.ty.contains(MessageType::REQ_ACK) {
                warn!(conn = ch.0, "ack or noop requesting an ack");
                return Err(ErrorCode::ProtocolError);
            }
        }
        if wire.ty.contains(MessageType::NOOP) {
            trace!(conn = ch.0, "received NOOP");
            conn.timestamp = now;
            let key = conn.remote;
            if let Some(remote) = key.and_then(|k| self.remotes.get_mut(&k)) {
                remote.timestamp = now;
            }
            return Ok(Step::Continue);
        }
        if wire.ty.contains(MessageType::ACK) {
            let key = conn.remote;
            if let Some(remote) = key.and_then(|k| self.remotes.get_mut(&k)) {
                // Acks for an aborted waiting message are stale; ignore
                if let Some(wam) = remote.wait_ack {
                    let matches = self
                        .flight
                        .get(wam.0)
                        .map_or(false, |entry| entry.msg.identity == wire.identity);
                    if matches {
                        remote.wait_ack = None;
                        self.flight[wam.0]
                            .msg
                            .flags
                            .insert(MessageFlags::ACK_RECEIVED);
                        trace!(conn = ch.0, id = %wire.identity, "received ack");
                        self.finish_message(ch, wam, ErrorCode::Success, now);
                    }
                }
            }
            return Ok(Step::Continue);
        }
        let conn = self.connections.get_mut(ch.0).expect("connection exists");
        conn.reader.wire = Some(wire);
        conn.reader.state = ReadState::Slot;
        Ok(Step::Continue)
    }

    /// Acquire a slot for the parsed header, or stop the stream
    fn read_slot(&mut self, ch: ConnectionHandle, now: Instant) -> Result<Step, ErrorCode> {
        let conn = self.connections.get_mut(ch.0).expect("connection exists");
        if conn.reader.slot.is_none() {
            let pool = self
                .pools
                .get_mut(conn.reader.pool)
                .expect("reader pool exists");
            match pool.acquire() {
                Some(id) => conn.reader.slot = Some(id),
                None => {
                    if !conn.flags.contains(ConnFlags::STOPPED) {
                        debug!(conn = ch.0, "slots exhausted, stopping stream");
                    }
                    conn.flags.insert(ConnFlags::STOPPED);
                    self.io.push_back(IoRequest::PauseRead { handle: ch });
                    return Ok(Step::Stopped);
                }
            }
        }
        let wire = conn.reader.wire.as_ref().expect("header parsed");
        let header_len = wire.header_len as usize;
        let data_len = wire.data_len as usize;
        conn.reader.header_buf =
            BytesMut::with_capacity(if header_len <= PREALLOC_HEADER {
                PREALLOC_HEADER
            } else {
                header_len
            });
        conn.reader.data_buf = BytesMut::with_capacity(if data_len <= PREALLOC_DATA {
            PREALLOC_DATA
        } else {
            data_len
        });
        if header_len > 0 {
            conn.reader.state = ReadState::Header;
            Ok(Step::Continue)
        } else if data_len > 0 {
            conn.reader.state = ReadState::Data;
            Ok(Step::Continue)
        } else {
            self.deliver(ch, now)
        }
    }

    /// Copy body bytes into the slot's buffer, handling partial reads
    fn read_body(
        &mut self,
        ch: ConnectionHandle,
        now: Instant,
        buf: &BytesMut,
        offset: &mut usize,
        part: BodyPart,
    ) -> Result<Step, ErrorCode> {
        let available = buf.len() - *offset;
        if available == 0 {
            return Ok(Step::NeedMore);
        }
        let conn = self.connections.get_mut(ch.0).expect("connection exists");
        let wire = conn.reader.wire.as_ref().expect("header parsed");
        let (expected, data_len) = match part {
            BodyPart::Header => (wire.header_len as usize, wire.data_len as usize),
            BodyPart::Data => (wire.data_len as usize, 0),
        };
        let target = match part {
            BodyPart::Header => &mut conn.reader.header_buf,
            BodyPart::Data => &mut conn.reader.data_buf,
        };
        let take = (expected - target.len()).min(available);
        target.extend_from_slice(&buf[*offset..*offset + take]);
        *offset += take;
        if target.len() < expected {
            return Ok(Step::NeedMore);
        }
        match part {
            BodyPart::Header if data_len > 0 => {
                conn.reader.state = ReadState::Data;
                Ok(Step::Continue)
            }
            _ => self.deliver(ch, now),
        }
    }

    /// Hand the completed slot to the application
    fn deliver(&mut self, ch: ConnectionHandle, now: Instant) -> Result<Step, ErrorCode> {
        let conn = self.connections.get_mut(ch.0).expect("connection exists");
        let wire = conn.reader.wire.take().expect("header parsed");
        let slot = conn.reader.slot.take().expect("slot acquired");
        let header = mem::take(&mut conn.reader.header_buf).freeze();
        let data = mem::take(&mut conn.reader.data_buf).freeze();
        conn.reader.state = ReadState::Wait;
        conn.timestamp = now;
        let mut flags = MessageFlags::HAS_SLOT;
        if wire.ty.contains(MessageType::REQ_ACK) {
            flags.insert(MessageFlags::SEND_ACK);
        }
        let msg = Message {
            identity: wire.identity,
            serial: wire.serial,
            ty: wire.ty,
            header,
            data,
            peer: SocketAddr::new(conn.peer.ip(), conn.port),
            remote_identity: conn.remote_identity,
            flags,
            slot: Some(SlotToken {
                pool: conn.reader.pool,
                slot,
            }),
        };
        debug!(
            conn = ch.0,
            id = %msg.identity,
            serial = msg.serial,
            data_len = msg.data.len(),
            "read message",
        );
        let pool = conn.reader.pool;
        let key = conn.remote;
        if let Some(remote) = key.and_then(|k| self.remotes.get_mut(&k)) {
            remote.timestamp = now;
        }
        // The pool must survive until the application releases the slot,
        // even if the connection dies first
        self.pools
            .get_mut(pool)
            .expect("reader pool exists")
            .incref();
        self.events.push_back(Event::Message(msg));
        Ok(Step::Continue)
    }

    /// Restart a stream stopped on slot exhaustion, consuming buffered
    /// input first
    fn resume_read(&mut self, ch: ConnectionHandle, now: Instant) {
        let Some(conn) = self.connections.get_mut(ch.0) else {
            return;
        };
        if !conn.flags.contains(ConnFlags::STOPPED)
            || conn.flags.contains(ConnFlags::SHUTTING_DOWN)
        {
            return;
        }
        trace!(conn = ch.0, "resume reading");
        conn.flags.remove(ConnFlags::STOPPED);
        let raw = mem::take(&mut conn.pending_transport);
        self.drive_reader(ch, now);
        if !raw.is_empty() {
            let stopped_again = self
                .connections
                .get(ch.0)
                .map_or(true, |conn| conn.flags.contains(ConnFlags::STOPPED));
            if stopped_again {
                if let Some(conn) = self.connections.get_mut(ch.0) {
                    debug_assert!(conn.pending_transport.is_empty());
                    conn.pending_transport = raw;
                }
                return;
            }
            self.handle_input(ch, now, &raw);
        }
        let resumed = self
            .connections
            .get(ch.0)
            .map_or(false, |conn| !conn.flags.contains(ConnFlags::STOPPED));
        if resumed {
            trace!(conn = ch.0, "restart stream");
            self.io.push_back(IoRequest::ResumeRead { handle: ch });
        }
    }

    // Helpers

    fn requires_tls(&self, addr: SocketAddr) -> bool {
        if self.config.disable_encryption {
            return false;
        }
        self.config.always_encrypt || !is_loopback(addr.ip())
    }

    fn send_app_handshake(&mut self, ch: ConnectionHandle, now: Instant) {
        let hs = Handshake {
            port: self.public_port,
            identity: self.identity,
        };
        let mut buf = [0u8; HANDSHAKE_SIZE];
        hs.encode(&mut &mut buf[..]);
        let Some(conn) = self.connections.get_mut(ch.0) else {
            return;
        };
        trace!(conn = ch.0, "sending handshake");
        let res = conn.write_record(&[&buf]);
        self.pump_outgoing(ch);
        if res.is_err() {
            self.shutdown_connection(ch, ErrorCode::TlsError, now);
        }
    }

    /// Move staged output into the transmit queue
    fn pump_outgoing(&mut self, ch: ConnectionHandle) {
        let Some(conn) = self.connections.get_mut(ch.0) else {
            return;
        };
        for contents in conn.outgoing.drain(..) {
            conn.awaiting_flush += 1;
            self.transmits.push_back(Transmit {
                handle: ch,
                contents,
            });
        }
    }

    fn check_closed(&mut self) {
        if self.state == NodeState::Closing && self.connections.is_empty() {
            debug!("node closed");
            self.state = NodeState::Closed;
            self.events.push_back(Event::Closed);
        }
    }
}

#[cfg(test)]
impl Node {
    pub(crate) fn remote_count(&self) -> usize {
        self.remotes.len()
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub(crate) fn old_connection_count(&self) -> usize {
        self.old_connections.len()
    }

    pub(crate) fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub(crate) fn remote_blocked(&self, addr: SocketAddr) -> Option<bool> {
        self.remotes
            .get(&RemoteKey::from(addr))
            .map(|remote| remote.conn_blocked)
    }

    pub(crate) fn remote_connection(&self, addr: SocketAddr) -> Option<ConnectionHandle> {
        self.remotes
            .get(&RemoteKey::from(addr))
            .and_then(|remote| remote.conn)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Step {
    /// State advanced; run the machine again
    Continue,
    /// Out of input for the current record
    NeedMore,
    /// Slots exhausted; the stream is paused
    Stopped,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum BodyPart {
    Header,
    Data,
}
