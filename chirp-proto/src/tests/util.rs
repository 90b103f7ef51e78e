use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::info_span;
use tracing_subscriber::EnvFilter;

use super::*;

/// Capture tracing output for one test
pub fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .finish();
    tracing::subscriber::set_default(sub)
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Side {
    A,
    B,
}

impl Side {
    fn other(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Side::A => "a",
            Side::B => "b",
        }
    }
}

struct TestStream {
    /// Handle of the matching connection on the other node
    peer: Option<ConnectionHandle>,
    /// Bytes sent to us but not yet fed to the node
    rx: VecDeque<Bytes>,
    paused: bool,
    closed: bool,
}

impl TestStream {
    fn connected(peer: ConnectionHandle) -> Self {
        Self {
            peer: Some(peer),
            rx: VecDeque::new(),
            paused: false,
            closed: false,
        }
    }

    fn pending() -> Self {
        Self {
            peer: None,
            rx: VecDeque::new(),
            paused: false,
            closed: false,
        }
    }
}

pub struct TestNode {
    pub node: Node,
    pub addr: SocketAddr,
    pub listening: bool,
    pub events: Vec<Event>,
    streams: HashMap<usize, TestStream>,
}

impl TestNode {
    fn new(config: Config, tls: Option<TlsContext>, addr: SocketAddr, now: Instant) -> Self {
        let node = Node::new(Arc::new(config), tls, now).unwrap();
        Self {
            node,
            addr,
            listening: true,
            events: Vec::new(),
            streams: HashMap::new(),
        }
    }

    /// Whether the runtime was asked to pause this connection's stream
    pub fn is_paused(&self, ch: ConnectionHandle) -> bool {
        self.streams.get(&ch.0).map_or(false, |s| s.paused)
    }

    pub fn take_messages(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        let mut rest = Vec::new();
        for event in self.events.drain(..) {
            match event {
                Event::Message(msg) => out.push(msg),
                other => rest.push(other),
            }
        }
        self.events = rest;
        out
    }

    pub fn take_sent(&mut self, token: u64) -> Option<(Message, ErrorCode)> {
        let idx = self.events.iter().position(
            |event| matches!(event, Event::MessageSent { token: t, .. } if *t == token),
        )?;
        match self.events.remove(idx) {
            Event::MessageSent { msg, status, .. } => Some((msg, status)),
            _ => unreachable!(),
        }
    }

    pub fn closed(&self) -> bool {
        self.events.iter().any(|e| matches!(e, Event::Closed))
    }
}

/// Two nodes joined by an in-memory network with simulated time
///
/// Transmits are delivered instantly unless the receiving stream is
/// paused; timers only fire through [`Pair::advance`].
pub struct Pair {
    pub time: Instant,
    pub a: TestNode,
    pub b: TestNode,
    next_port: u16,
    /// Dial targets that never answer
    pub blackholes: Vec<SocketAddr>,
}

impl Pair {
    pub fn new(config_a: Config, config_b: Config) -> Self {
        Self::new_tls(config_a, None, config_b, None)
    }

    pub fn new_tls(
        config_a: Config,
        tls_a: Option<TlsContext>,
        config_b: Config,
        tls_b: Option<TlsContext>,
    ) -> Self {
        let now = Instant::now();
        let addr_a = SocketAddr::new("127.0.0.1".parse().unwrap(), config_a.port);
        let addr_b = SocketAddr::new("127.0.0.1".parse().unwrap(), config_b.port);
        Self {
            time: now,
            a: TestNode::new(config_a, tls_a, addr_a, now),
            b: TestNode::new(config_b, tls_b, addr_b, now),
            next_port: 40_000,
            blackholes: Vec::new(),
        }
    }

    pub fn side(&self, side: Side) -> &TestNode {
        match side {
            Side::A => &self.a,
            Side::B => &self.b,
        }
    }

    pub fn side_mut(&mut self, side: Side) -> &mut TestNode {
        match side {
            Side::A => &mut self.a,
            Side::B => &mut self.b,
        }
    }

    pub fn send(
        &mut self,
        side: Side,
        msg: Message,
        token: u64,
    ) -> Result<SendOutcome, (Message, ErrorCode)> {
        let now = self.time;
        let res = self.side_mut(side).node.send(now, msg, token);
        self.drive();
        res
    }

    pub fn release(&mut self, side: Side, msg: Message) {
        let now = self.time;
        self.side_mut(side).node.release_slot(now, msg, None);
        self.drive();
    }

    /// Pump both nodes until the network is quiescent, without advancing
    /// time
    pub fn drive(&mut self) {
        loop {
            let mut progress = false;
            progress |= self.service(Side::A);
            progress |= self.service(Side::B);
            if !progress {
                break;
            }
        }
    }

    /// Move the clock forward and fire what expired
    pub fn advance(&mut self, by: Duration) {
        self.drive();
        self.time += by;
        let now = self.time;
        self.a.node.handle_timeout(now);
        self.b.node.handle_timeout(now);
        self.drive();
    }

    fn service(&mut self, side: Side) -> bool {
        let span = info_span!("node", side = side.name());
        let _guard = span.enter();
        let mut progress = false;
        loop {
            let transmit = self.side_mut(side).node.poll_transmit();
            let Some(transmit) = transmit else {
                break;
            };
            progress = true;
            self.deliver(side, transmit);
        }
        loop {
            let req = self.side_mut(side).node.poll_io();
            let Some(req) = req else {
                break;
            };
            progress = true;
            self.handle_io(side, req);
        }
        progress |= self.pump_rx(side);
        loop {
            let event = self.side_mut(side).node.poll_event();
            let Some(event) = event else {
                break;
            };
            self.side_mut(side).events.push(event);
        }
        progress
    }

    fn deliver(&mut self, from: Side, transmit: Transmit) {
        let now = self.time;
        let peer = self
            .side(from)
            .streams
            .get(&transmit.handle.0)
            .and_then(|s| if s.closed { None } else { s.peer });
        match peer {
            Some(peer) => {
                let to = from.other();
                self.side_mut(to)
                    .streams
                    .get_mut(&peer.0)
                    .expect("peer stream exists")
                    .rx
                    .push_back(transmit.contents);
                self.side_mut(from)
                    .node
                    .handle_flushed(transmit.handle, now, Ok(()));
            }
            None => {
                self.side_mut(from)
                    .node
                    .handle_flushed(transmit.handle, now, Err(()));
            }
        }
    }

    fn pump_rx(&mut self, side: Side) -> bool {
        let now = self.time;
        let mut progress = false;
        let handles: Vec<usize> = self.side(side).streams.keys().copied().collect();
        for handle in handles {
            loop {
                let chunk = {
                    let Some(stream) = self.side_mut(side).streams.get_mut(&handle) else {
                        break;
                    };
                    if stream.paused || stream.closed {
                        break;
                    }
                    stream.rx.pop_front()
                };
                let Some(chunk) = chunk else {
                    break;
                };
                progress = true;
                self.side_mut(side)
                    .node
                    .handle_input(ConnectionHandle(handle), now, &chunk);
            }
        }
        progress
    }

    fn handle_io(&mut self, side: Side, req: IoRequest) {
        let now = self.time;
        match req {
            IoRequest::Connect { handle, addr } => {
                let other = side.other();
                let accepts = self.side(other).listening && addr == self.side(other).addr;
                if accepts {
                    let ephemeral =
                        SocketAddr::new(self.side(side).addr.ip(), self.alloc_port());
                    match self.side_mut(other).node.accept(now, ephemeral) {
                        Ok(peer) => {
                            self.side_mut(other)
                                .streams
                                .insert(peer.0, TestStream::connected(handle));
                            self.side_mut(side)
                                .streams
                                .insert(handle.0, TestStream::connected(peer));
                            self.side_mut(side).node.handle_connected(handle, now);
                        }
                        Err(_) => {
                            self.side_mut(side).node.handle_connect_failed(handle, now);
                        }
                    }
                } else if self.blackholes.contains(&addr) {
                    self.side_mut(side)
                        .streams
                        .insert(handle.0, TestStream::pending());
                } else {
                    self.side_mut(side).node.handle_connect_failed(handle, now);
                }
            }
            IoRequest::Close { handle } => {
                let peer = self
                    .side_mut(side)
                    .streams
                    .remove(&handle.0)
                    .and_then(|s| s.peer);
                if let Some(peer) = peer {
                    let other = side.other();
                    if let Some(stream) = self.side_mut(other).streams.get_mut(&peer.0) {
                        stream.closed = true;
                        stream.peer = None;
                    }
                    self.side_mut(other).node.handle_stream_closed(peer, now);
                }
                self.side_mut(side).node.handle_closed(handle);
            }
            IoRequest::PauseRead { handle } => {
                if let Some(stream) = self.side_mut(side).streams.get_mut(&handle.0) {
                    stream.paused = true;
                }
            }
            IoRequest::ResumeRead { handle } => {
                if let Some(stream) = self.side_mut(side).streams.get_mut(&handle.0) {
                    stream.paused = false;
                }
            }
            IoRequest::StopListen => {
                self.side_mut(side).listening = false;
            }
        }
    }

    fn alloc_port(&mut self) -> u16 {
        self.next_port += 1;
        self.next_port
    }
}

/// An asynchronous-mode config listening on `port`, encryption off
pub fn async_config(port: u16) -> Config {
    Config {
        port,
        synchronous: false,
        disable_encryption: true,
        ..Config::default()
    }
}

/// A synchronous-mode config listening on `port`, encryption off
pub fn sync_config(port: u16) -> Config {
    Config {
        port,
        synchronous: true,
        disable_encryption: true,
        ..Config::default()
    }
}

/// Self-signed credentials on disk, plus session contexts for both nodes
pub struct TlsFixture {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    cert: rcgen::Certificate,
}

impl TlsFixture {
    pub fn new(tag: &str) -> Self {
        let cert = rcgen::generate_simple_self_signed(vec!["chirp.test".into()]).unwrap();
        let dir = std::env::temp_dir();
        let cert_path = dir.join(format!("chirp-proto-{tag}-{}.cert.pem", std::process::id()));
        let key_path = dir.join(format!("chirp-proto-{tag}-{}.key.pem", std::process::id()));
        std::fs::write(&cert_path, cert.serialize_pem().unwrap()).unwrap();
        std::fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();
        Self {
            cert_path,
            key_path,
            cert,
        }
    }

    pub fn context(&self) -> TlsContext {
        TlsContext::new(
            vec![rustls::Certificate(self.cert.serialize_der().unwrap())],
            rustls::PrivateKey(self.cert.serialize_private_key_der()),
        )
        .unwrap()
    }

    /// A synchronous-mode config with these credentials
    pub fn config(&self, port: u16) -> Config {
        Config {
            port,
            synchronous: true,
            cert_chain_pem: Some(self.cert_path.clone()),
            private_key_pem: Some(self.key_path.clone()),
            ..Config::default()
        }
    }
}

impl Drop for TlsFixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.cert_path);
        let _ = std::fs::remove_file(&self.key_path);
    }
}

/// An outgoing message with fixed identity and payload
pub fn test_message(to: SocketAddr, id: u8, data: &'static [u8]) -> Message {
    let mut msg = Message::new(to);
    let mut identity = [0u8; crate::ID_SIZE];
    identity[crate::ID_SIZE - 1] = id;
    msg.identity = Identity(identity);
    msg.set_data(data);
    msg
}
