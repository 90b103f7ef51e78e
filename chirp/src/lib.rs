//! Message-passing over TCP with transparent TLS, acknowledgements and
//! backpressure
//!
//! Every process runs a [`Chirp`] node that listens on one port (IPv4 and
//! IPv6) and dials peers on demand when the application sends to them.
//! Messages carry a 16-byte identity, an optional header for upper-layer
//! protocols and a binary payload; in synchronous mode (the default) each
//! send completes only after the receiving application has released the
//! message, giving end-to-end delivery confirmation. Connections to
//! non-loopback peers are upgraded to TLS transparently.
//!
//! ```no_run
//! use chirp::{Chirp, Config, Message};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), chirp::InitError> {
//!     let config = Config {
//!         port: 2998,
//!         disable_encryption: true,
//!         ..Config::default()
//!     };
//!     let (chirp, mut messages) = Chirp::with_config(config).await?;
//!
//!     let mut msg = Message::new("127.0.0.1:2999".parse().unwrap());
//!     msg.set_data(&b"hello"[..]);
//!     let _ = chirp.send(msg).await;
//!
//!     while let Some(received) = messages.recv().await {
//!         println!("{} bytes from {}", received.data().len(), received.peer());
//!         received.release().await;
//!     }
//!     Ok(())
//! }
//! ```

mod endpoint;
mod node;
mod tls;

pub use chirp_proto::{Config, ConfigError, ErrorCode, Identity, Message, MessageType};

pub use crate::node::{Chirp, InitError, Messages, ReceivedMessage, SendError};

/// Version of the chirp crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
