//! The driver task owning the protocol state machine and all sockets.
//!
//! One task runs [`Driver::run`]; it is the single place that touches the
//! `chirp_proto::Node`. Listeners, dial attempts and per-connection stream
//! pumps are separate tasks that talk to the driver over channels, so the
//! protocol state stays single-threaded while I/O proceeds concurrently.

use std::collections::HashMap;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use chirp_proto::{
    Config, ConnectionHandle, ErrorCode, Event, IoRequest, Message, Node, Transmit,
};

use crate::node::{InitError, ReceivedMessage};
use crate::tls;

/// Initial TCP keep-alive interval on every established socket
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);

/// Requests from [`crate::Chirp`] handles to the driver
pub(crate) enum Command {
    Send {
        msg: Message,
        resp: oneshot::Sender<(Message, ErrorCode)>,
    },
    Release {
        msg: Message,
        resp: Option<oneshot::Sender<()>>,
    },
    Close {
        resp: oneshot::Sender<()>,
    },
    SetPublicPort(u16),
}

/// Reports from listener, dial and stream-pump tasks
enum ConnEvent {
    Accepted {
        stream: TcpStream,
        peer: SocketAddr,
    },
    Connected {
        handle: usize,
        epoch: u64,
        result: io::Result<TcpStream>,
    },
    Data {
        handle: usize,
        epoch: u64,
        bytes: Vec<u8>,
    },
    Eof {
        handle: usize,
        epoch: u64,
    },
    Flushed {
        handle: usize,
        epoch: u64,
        result: Result<(), ()>,
    },
    Closed {
        handle: usize,
        epoch: u64,
    },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ReadCtl {
    Run,
    Pause,
    Close,
}

enum WriteOp {
    Write(Bytes),
    Close,
}

enum ConnIo {
    /// Dial in progress; no stream yet
    Connecting,
    Running {
        write: mpsc::UnboundedSender<WriteOp>,
        read_ctl: watch::Sender<ReadCtl>,
    },
    /// Close requested; waiting for the writer task to confirm
    Draining,
}

struct ConnEntry {
    /// Distinguishes incarnations after the protocol layer reuses a handle
    epoch: u64,
    io: ConnIo,
}

pub(crate) struct Driver {
    node: Node,
    config: Arc<Config>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<ConnEvent>,
    events_rx: mpsc::UnboundedReceiver<ConnEvent>,
    messages: mpsc::UnboundedSender<ReceivedMessage>,
    conns: HashMap<usize, ConnEntry>,
    next_epoch: u64,
    next_token: u64,
    pending_sends: HashMap<u64, oneshot::Sender<(Message, ErrorCode)>>,
    pending_releases: HashMap<u64, oneshot::Sender<()>>,
    close_waiters: Vec<oneshot::Sender<()>>,
    listeners: Vec<JoinHandle<()>>,
    done: bool,
}

impl Driver {
    /// Bind both listeners and set up the protocol state
    pub(crate) async fn bind(
        config: Config,
        cmd_tx: mpsc::UnboundedSender<Command>,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
        messages: mpsc::UnboundedSender<ReceivedMessage>,
    ) -> Result<Driver, InitError> {
        let tls = if config.disable_encryption {
            None
        } else {
            Some(tls::load_context(&config)?)
        };
        let config = Arc::new(config);
        let node = Node::new(config.clone(), tls, Instant::now())?;
        let v4 = bind_listener(
            SocketAddr::new(config.bind_v4.into(), config.port),
            config.backlog,
            false,
        )
        .map_err(InitError::AddrInUse)?;
        let v6 = bind_listener(
            SocketAddr::new(config.bind_v6.into(), config.port),
            config.backlog,
            true,
        )
        .map_err(InitError::AddrInUse)?;
        debug!(port = config.port, "listening");
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let listeners = vec![
            tokio::spawn(accept_loop(v4, events_tx.clone())),
            tokio::spawn(accept_loop(v6, events_tx.clone())),
        ];
        if !config.disable_signals {
            spawn_signal_handlers(cmd_tx.clone());
        }
        Ok(Driver {
            node,
            config,
            cmd_tx,
            cmd_rx,
            events_tx,
            events_rx,
            messages,
            conns: HashMap::new(),
            next_epoch: 0,
            next_token: 0,
            pending_sends: HashMap::new(),
            pending_releases: HashMap::new(),
            close_waiters: Vec::new(),
            listeners,
            done: false,
        })
    }

    pub(crate) fn identity(&self) -> chirp_proto::Identity {
        self.node.identity()
    }

    pub(crate) fn port(&self) -> u16 {
        self.config.port
    }

    pub(crate) async fn run(mut self) {
        loop {
            self.drain();
            if self.done {
                break;
            }
            let deadline = self
                .node
                .poll_timeout()
                .map(tokio::time::Instant::from_std)
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                Some(cmd) = self.cmd_rx.recv() => self.handle_command(cmd),
                Some(event) = self.events_rx.recv() => self.handle_conn_event(event),
                _ = tokio::time::sleep_until(deadline) => {
                    self.node.handle_timeout(Instant::now());
                }
            }
        }
        for listener in &self.listeners {
            listener.abort();
        }
        debug!("node driver finished");
    }

    /// Push transmits, socket requests and application events out until the
    /// protocol layer is quiescent
    fn drain(&mut self) {
        loop {
            let mut progress = false;
            while let Some(transmit) = self.node.poll_transmit() {
                progress = true;
                self.dispatch_transmit(transmit);
            }
            while let Some(req) = self.node.poll_io() {
                progress = true;
                self.handle_io(req);
            }
            while let Some(event) = self.node.poll_event() {
                progress = true;
                self.handle_event(event);
            }
            if !progress {
                break;
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        let now = Instant::now();
        match cmd {
            Command::Send { msg, resp } => {
                let token = self.next_token;
                self.next_token += 1;
                self.pending_sends.insert(token, resp);
                if let Err((msg, code)) = self.node.send(now, msg, token) {
                    if let Some(resp) = self.pending_sends.remove(&token) {
                        let _ = resp.send((msg, code));
                    }
                }
            }
            Command::Release { msg, resp } => match resp {
                Some(resp) => {
                    let token = self.next_token;
                    self.next_token += 1;
                    self.pending_releases.insert(token, resp);
                    self.node.release_slot(now, msg, Some(token));
                }
                None => self.node.release_slot(now, msg, None),
            },
            Command::Close { resp } => {
                self.close_waiters.push(resp);
                match self.node.close(now) {
                    Ok(()) | Err(ErrorCode::InProgress) => {}
                    Err(_) => {
                        // Already closed
                        for waiter in self.close_waiters.drain(..) {
                            let _ = waiter.send(());
                        }
                    }
                }
            }
            Command::SetPublicPort(port) => self.node.set_public_port(port),
        }
    }

    fn handle_conn_event(&mut self, event: ConnEvent) {
        let now = Instant::now();
        match event {
            ConnEvent::Accepted { stream, peer } => match self.node.accept(now, peer) {
                Ok(handle) => self.setup_stream(handle, stream),
                Err(err) => {
                    trace!(%peer, %err, "rejecting connection");
                }
            },
            ConnEvent::Connected {
                handle,
                epoch,
                result,
            } => {
                let connecting = self.conns.get(&handle).map_or(false, |entry| {
                    entry.epoch == epoch && matches!(entry.io, ConnIo::Connecting)
                });
                if !connecting {
                    // The protocol layer gave up on this dial already
                    return;
                }
                match result {
                    Ok(stream) => {
                        self.setup_stream(ConnectionHandle(handle), stream);
                        self.node.handle_connected(ConnectionHandle(handle), now);
                    }
                    Err(err) => {
                        debug!(conn = handle, %err, "dial failed");
                        self.node.handle_connect_failed(ConnectionHandle(handle), now);
                    }
                }
            }
            ConnEvent::Data {
                handle,
                epoch,
                bytes,
            } => {
                if self.valid(handle, epoch) {
                    self.node
                        .handle_input(ConnectionHandle(handle), now, &bytes);
                }
            }
            ConnEvent::Eof { handle, epoch } => {
                if self.valid(handle, epoch) {
                    self.node.handle_stream_closed(ConnectionHandle(handle), now);
                }
            }
            ConnEvent::Flushed {
                handle,
                epoch,
                result,
            } => {
                if self.valid(handle, epoch) {
                    self.node
                        .handle_flushed(ConnectionHandle(handle), now, result);
                }
            }
            ConnEvent::Closed { handle, epoch } => {
                if self.valid(handle, epoch) {
                    self.conns.remove(&handle);
                    self.node.handle_closed(ConnectionHandle(handle));
                }
            }
        }
    }

    fn handle_io(&mut self, req: IoRequest) {
        match req {
            IoRequest::Connect { handle, addr } => {
                let epoch = self.alloc_epoch();
                self.conns.insert(
                    handle.0,
                    ConnEntry {
                        epoch,
                        io: ConnIo::Connecting,
                    },
                );
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    let result = TcpStream::connect(addr).await;
                    let _ = events.send(ConnEvent::Connected {
                        handle: handle.0,
                        epoch,
                        result,
                    });
                });
            }
            IoRequest::Close { handle } => match self.conns.get_mut(&handle.0) {
                Some(entry) => match mem::replace(&mut entry.io, ConnIo::Draining) {
                    ConnIo::Running { write, read_ctl } => {
                        let _ = read_ctl.send(ReadCtl::Close);
                        if write.send(WriteOp::Close).is_err() {
                            self.conns.remove(&handle.0);
                            self.node.handle_closed(handle);
                        }
                    }
                    ConnIo::Connecting => {
                        self.conns.remove(&handle.0);
                        self.node.handle_closed(handle);
                    }
                    ConnIo::Draining => {}
                },
                None => self.node.handle_closed(handle),
            },
            IoRequest::PauseRead { handle } => {
                if let Some(ConnEntry {
                    io: ConnIo::Running { read_ctl, .. },
                    ..
                }) = self.conns.get(&handle.0)
                {
                    let _ = read_ctl.send(ReadCtl::Pause);
                }
            }
            IoRequest::ResumeRead { handle } => {
                if let Some(ConnEntry {
                    io: ConnIo::Running { read_ctl, .. },
                    ..
                }) = self.conns.get(&handle.0)
                {
                    let _ = read_ctl.send(ReadCtl::Run);
                }
            }
            IoRequest::StopListen => {
                for listener in &self.listeners {
                    listener.abort();
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Message(msg) => {
                let received = ReceivedMessage::new(msg, self.cmd_tx.clone());
                if let Err(err) = self.messages.send(received) {
                    // No receiver: behave like a node without a receive
                    // callback and release right away
                    let msg = err.0.into_message();
                    self.node.release_slot(Instant::now(), msg, None);
                }
            }
            Event::MessageSent { token, msg, status } => {
                if let Some(resp) = self.pending_sends.remove(&token) {
                    let _ = resp.send((msg, status));
                }
            }
            Event::Released { token } => {
                if let Some(resp) = self.pending_releases.remove(&token) {
                    let _ = resp.send(());
                }
            }
            Event::Closed => {
                for waiter in self.close_waiters.drain(..) {
                    let _ = waiter.send(());
                }
                self.pending_sends.clear();
                self.pending_releases.clear();
                self.done = true;
            }
        }
    }

    fn dispatch_transmit(&mut self, transmit: Transmit) {
        let sent = match self.conns.get(&transmit.handle.0) {
            Some(ConnEntry {
                io: ConnIo::Running { write, .. },
                ..
            }) => write.send(WriteOp::Write(transmit.contents)).is_ok(),
            _ => false,
        };
        if !sent {
            self.node
                .handle_flushed(transmit.handle, Instant::now(), Err(()));
        }
    }

    fn setup_stream(&mut self, handle: ConnectionHandle, stream: TcpStream) {
        if let Err(err) = configure_stream(&stream) {
            warn!(conn = handle.0, %err, "could not set socket options");
        }
        let epoch = match self.conns.get(&handle.0) {
            Some(entry) if matches!(entry.io, ConnIo::Connecting) => entry.epoch,
            _ => self.alloc_epoch(),
        };
        let (rd, wr) = stream.into_split();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (ctl_tx, ctl_rx) = watch::channel(ReadCtl::Run);
        let buffer_size = self.config.effective_buffer_size();
        tokio::spawn(read_loop(
            handle.0,
            epoch,
            rd,
            ctl_rx,
            self.events_tx.clone(),
            buffer_size,
        ));
        tokio::spawn(write_loop(
            handle.0,
            epoch,
            wr,
            write_rx,
            self.events_tx.clone(),
        ));
        self.conns.insert(
            handle.0,
            ConnEntry {
                epoch,
                io: ConnIo::Running {
                    write: write_tx,
                    read_ctl: ctl_tx,
                },
            },
        );
    }

    fn valid(&self, handle: usize, epoch: u64) -> bool {
        self.conns
            .get(&handle)
            .map_or(false, |entry| entry.epoch == epoch)
    }

    fn alloc_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }
}

async fn accept_loop(listener: TcpListener, events: mpsc::UnboundedSender<ConnEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if events.send(ConnEvent::Accepted { stream, peer }).is_err() {
                    return;
                }
            }
            Err(err) => {
                warn!(%err, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn read_loop(
    handle: usize,
    epoch: u64,
    mut rd: OwnedReadHalf,
    mut ctl: watch::Receiver<ReadCtl>,
    events: mpsc::UnboundedSender<ConnEvent>,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size];
    loop {
        loop {
            let state = *ctl.borrow();
            match state {
                ReadCtl::Run => break,
                ReadCtl::Pause => {
                    if ctl.changed().await.is_err() {
                        return;
                    }
                }
                ReadCtl::Close => return,
            }
        }
        tokio::select! {
            res = rd.read(&mut buf) => match res {
                Ok(0) | Err(_) => {
                    let _ = events.send(ConnEvent::Eof { handle, epoch });
                    return;
                }
                Ok(n) => {
                    let bytes = buf[..n].to_vec();
                    if events.send(ConnEvent::Data { handle, epoch, bytes }).is_err() {
                        return;
                    }
                }
            },
            res = ctl.changed() => {
                if res.is_err() {
                    return;
                }
            }
        }
    }
}

async fn write_loop(
    handle: usize,
    epoch: u64,
    mut wr: OwnedWriteHalf,
    mut ops: mpsc::UnboundedReceiver<WriteOp>,
    events: mpsc::UnboundedSender<ConnEvent>,
) {
    while let Some(op) = ops.recv().await {
        match op {
            WriteOp::Write(bytes) => {
                let result = wr.write_all(&bytes).await.map_err(|_| ());
                if events
                    .send(ConnEvent::Flushed {
                        handle,
                        epoch,
                        result,
                    })
                    .is_err()
                {
                    return;
                }
            }
            WriteOp::Close => {
                let _ = wr.shutdown().await;
                let _ = events.send(ConnEvent::Closed { handle, epoch });
                return;
            }
        }
    }
}

fn spawn_signal_handlers(cmd: mpsc::UnboundedSender<Command>) {
    let on_signal = move |cmd: &mpsc::UnboundedSender<Command>| {
        let (resp, _rx) = oneshot::channel();
        let _ = cmd.send(Command::Close { resp });
    };
    #[cfg(unix)]
    {
        let cmd = cmd.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let Ok(mut term) = signal(SignalKind::terminate()) else {
                return;
            };
            if term.recv().await.is_some() {
                debug!("SIGTERM, closing node");
                on_signal(&cmd);
            }
        });
    }
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("interrupted, closing node");
            on_signal(&cmd);
        }
    });
}

fn bind_listener(addr: SocketAddr, backlog: u32, v6only: bool) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if v6only {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;
    TcpListener::from_std(socket.into())
}

fn configure_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new().with_time(TCP_KEEPALIVE);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}
