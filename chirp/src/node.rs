use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use chirp_proto::{Config, ConfigError, ErrorCode, Identity, Message};

use crate::endpoint::{Command, Driver};

/// A running chirp node
///
/// Cloning is cheap; all clones drive the same node. The node runs until
/// [`Chirp::close`] is called or SIGINT/SIGTERM arrives (unless signal
/// handling is disabled in the config).
#[derive(Clone)]
pub struct Chirp {
    pub(crate) cmd: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

struct Shared {
    identity: Identity,
    port: u16,
}

impl Chirp {
    /// Validate the configuration, bind the IPv4 and IPv6 listeners and
    /// start the node
    ///
    /// Returns the cloneable handle and the stream of received messages.
    pub async fn with_config(config: Config) -> Result<(Chirp, Messages), InitError> {
        config.validate()?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let driver = Driver::bind(config, cmd_tx.clone(), cmd_rx, msg_tx).await?;
        let shared = Arc::new(Shared {
            identity: driver.identity(),
            port: driver.port(),
        });
        tokio::spawn(driver.run());
        Ok((
            Chirp {
                cmd: cmd_tx,
                shared,
            },
            Messages { rx: msg_rx },
        ))
    }

    /// Queue a message to its peer
    ///
    /// Completes once the message reaches a final state: written out (and
    /// acknowledged, in synchronous mode) or failed. The message is handed
    /// back either way so it can be reused or, for received messages sent
    /// onwards, released.
    pub async fn send(&self, msg: Message) -> Result<Message, SendError> {
        let (resp, rx) = oneshot::channel();
        if let Err(err) = self.cmd.send(Command::Send { msg, resp }) {
            let Command::Send { msg, .. } = err.0 else {
                unreachable!()
            };
            return Err(SendError {
                code: ErrorCode::Shutdown,
                msg: Some(msg),
            });
        }
        match rx.await {
            Ok((msg, ErrorCode::Success)) => Ok(msg),
            Ok((msg, code)) => Err(SendError {
                code,
                msg: Some(msg),
            }),
            Err(_) => Err(SendError {
                code: ErrorCode::Shutdown,
                msg: None,
            }),
        }
    }

    /// Release the receive slot held by a message obtained from
    /// [`Messages`]
    ///
    /// Usually called through [`ReceivedMessage::release`]; use this form
    /// after [`ReceivedMessage::into_message`], for example when a received
    /// message was sent onwards first.
    pub async fn release_slot(&self, msg: Message) {
        let (resp, rx) = oneshot::channel();
        if self
            .cmd
            .send(Command::Release {
                msg,
                resp: Some(resp),
            })
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Close the node down
    ///
    /// Aborts every pending send with `Shutdown`, tears down all
    /// connections and resolves once the last one is gone. Safe to call
    /// from any task, more than once.
    pub async fn close(&self) {
        let (resp, rx) = oneshot::channel();
        if self.cmd.send(Command::Close { resp }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Advertise `port` instead of the configured one in handshakes, for
    /// nodes behind port forwarding
    pub fn set_public_port(&self, port: u16) {
        let _ = self.cmd.send(Command::SetPublicPort(port));
    }

    /// The node identity peers learn from the handshake
    pub fn identity(&self) -> Identity {
        self.shared.identity
    }

    /// The configured listening port
    pub fn local_port(&self) -> u16 {
        self.shared.port
    }
}

impl std::fmt::Debug for Chirp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chirp")
            .field("identity", &self.shared.identity)
            .field("port", &self.shared.port)
            .finish_non_exhaustive()
    }
}

/// Stream of messages received by a node
pub struct Messages {
    rx: mpsc::UnboundedReceiver<ReceivedMessage>,
}

impl Messages {
    /// The next received message, or `None` once the node has closed
    pub async fn recv(&mut self) -> Option<ReceivedMessage> {
        self.rx.recv().await
    }
}

/// A received message occupying one of its connection's receive slots
///
/// The slot is given back when this is released or dropped; releasing also
/// sends the acknowledgement when the sender requested one. Holding on to
/// received messages exerts backpressure: once a connection's slots are
/// all held, the node stops reading from it.
pub struct ReceivedMessage {
    msg: Option<Message>,
    cmd: mpsc::UnboundedSender<Command>,
}

impl ReceivedMessage {
    pub(crate) fn new(msg: Message, cmd: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            msg: Some(msg),
            cmd,
        }
    }

    /// The message itself
    pub fn message(&self) -> &Message {
        self.msg.as_ref().expect("message present until released")
    }

    /// The payload
    pub fn data(&self) -> &bytes::Bytes {
        self.message().data()
    }

    /// The header used by upper-layer protocols
    pub fn header(&self) -> &bytes::Bytes {
        self.message().header()
    }

    /// Address of the sending node
    pub fn peer(&self) -> SocketAddr {
        self.message().peer()
    }

    /// Identity of the message, stable across replies
    pub fn identity(&self) -> Identity {
        self.message().identity()
    }

    /// Identity of the sending node
    pub fn remote_identity(&self) -> Identity {
        self.message().remote_identity()
    }

    /// Release the slot and send the pending acknowledgement, waiting
    /// until the node has processed it
    pub async fn release(mut self) {
        if let Some(msg) = self.msg.take() {
            let (resp, rx) = oneshot::channel();
            if self
                .cmd
                .send(Command::Release {
                    msg,
                    resp: Some(resp),
                })
                .is_ok()
            {
                let _ = rx.await;
            }
        }
    }

    /// Take the message out, disarming the automatic release
    ///
    /// The caller becomes responsible for calling [`Chirp::release_slot`]
    /// once the message is no longer needed.
    pub fn into_message(mut self) -> Message {
        self.msg.take().expect("message present until released")
    }
}

impl Drop for ReceivedMessage {
    fn drop(&mut self) {
        if let Some(msg) = self.msg.take() {
            let _ = self.cmd.send(Command::Release { msg, resp: None });
        }
    }
}

impl std::fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("msg", &self.msg)
            .finish_non_exhaustive()
    }
}

/// A send reached a final state other than success
#[derive(Debug, Error)]
#[error("send failed: {code}")]
pub struct SendError {
    /// Why the send failed
    pub code: ErrorCode,
    /// The message, handed back for reuse when available
    pub msg: Option<Message>,
}

/// Failure to start a node
#[derive(Debug, Error)]
pub enum InitError {
    /// The configuration is invalid
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Binding or listening failed; usually the port is in use
    #[error("could not listen on port: {0}")]
    AddrInUse(#[source] std::io::Error),
    /// The TLS credentials could not be read
    #[error("could not read TLS credentials: {0}")]
    Credentials(#[source] std::io::Error),
    /// The TLS credentials were rejected
    #[error("invalid TLS credentials: {0}")]
    Tls(#[from] rustls::Error),
}
