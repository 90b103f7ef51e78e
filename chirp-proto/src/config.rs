use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::{Identity, HANDSHAKE_SIZE, MAX_SLOTS, WIRE_MSG_SIZE};

/// Default listening port
pub const DEFAULT_PORT: u16 = 2998;
/// Default listen backlog
pub const DEFAULT_BACKLOG: u32 = 100;
/// Default connect/write/handshake timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default idle bound for remote garbage collection
pub const DEFAULT_REUSE_TIME: Duration = Duration::from_secs(30);
/// Default number of receive slots per connection when not synchronous
pub const DEFAULT_MAX_SLOTS: u8 = 16;
/// Default per-connection buffer size
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
/// Upper bound for the TLS plaintext scratch buffer; one TLS record
pub const ENC_BUFFER_SIZE: usize = 16 * 1024;
/// Default bound on `header_len + data_len` of a wire message
pub const DEFAULT_MAX_MSG_SIZE: u32 = 1024 * 1024;

/// The smallest admissible buffer size must hold the handshake record, the
/// framed wire header and the fixed part of an internal message record.
pub const MIN_BUFFER_SIZE: usize = 128;

const _: () = assert!(MIN_BUFFER_SIZE >= HANDSHAKE_SIZE && MIN_BUFFER_SIZE >= WIRE_MSG_SIZE);

/// Parameters governing a chirp node
///
/// The defaults match the reference deployment: synchronous mode, port 2998,
/// 5 second timeouts and a 30 second remote-reuse window. Validation happens
/// once, when the node is created.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port to listen on; must exceed 1024
    pub port: u16,
    /// IPv4 listen address; unspecified binds 0.0.0.0
    pub bind_v4: Ipv4Addr,
    /// IPv6 listen address; unspecified binds `::` (with `IPV6_V6ONLY`)
    pub bind_v6: Ipv6Addr,
    /// Listen backlog; must stay below 128
    pub backlog: u32,
    /// Bound on connects, handshakes and writes; valid in [0.1, 60] seconds
    pub timeout: Duration,
    /// Idle interval after which a remote is garbage collected; valid in
    /// [0.5, 3600] seconds and must be at least `timeout`. A probe is sent
    /// when a remote has been idle for 3/4 of this interval.
    pub reuse_time: Duration,
    /// When set, every user message requires an ack and at most one data
    /// message is in flight per remote; forces `max_slots` to 1
    pub synchronous: bool,
    /// Receive slots per connection in 1..=32; 0 selects the default (16
    /// when asynchronous). Ignored under `synchronous`.
    pub max_slots: u8,
    /// Per-connection buffer size in bytes; 0 selects the default
    pub buffer_size: usize,
    /// Bound on `header_len + data_len`, enforced when reading
    pub max_msg_size: u32,
    /// Node identity; all-zero selects a random identity
    pub identity: Identity,
    /// Path to the PEM certificate chain; required unless encryption is
    /// disabled
    pub cert_chain_pem: Option<PathBuf>,
    /// Path to the PEM private key; required unless encryption is disabled
    pub private_key_pem: Option<PathBuf>,
    /// Encrypt loopback connections too; they are plaintext by default.
    /// Conflicts with `disable_encryption`.
    pub always_encrypt: bool,
    /// Do not install SIGINT/SIGTERM handlers in the runtime layer
    pub disable_signals: bool,
    /// Disable TLS for all peers, not just loopback
    pub disable_encryption: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_v4: Ipv4Addr::UNSPECIFIED,
            bind_v6: Ipv6Addr::UNSPECIFIED,
            backlog: DEFAULT_BACKLOG,
            timeout: DEFAULT_TIMEOUT,
            reuse_time: DEFAULT_REUSE_TIME,
            synchronous: true,
            max_slots: 0,
            buffer_size: 0,
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
            identity: Identity::default(),
            cert_chain_pem: None,
            private_key_pem: None,
            always_encrypt: false,
            disable_signals: false,
            disable_encryption: false,
        }
    }
}

impl Config {
    /// Check all invariants described on the fields
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port <= 1024 {
            return Err(ConfigError::IllegalValue("port must be greater than 1024"));
        }
        if self.backlog >= 128 {
            return Err(ConfigError::IllegalValue("backlog must be less than 128"));
        }
        let timeout = self.timeout.as_secs_f64();
        if !(0.1..=60.0).contains(&timeout) {
            return Err(ConfigError::IllegalValue(
                "timeout must be within [0.1, 60] seconds",
            ));
        }
        let reuse = self.reuse_time.as_secs_f64();
        if !(0.5..=3600.0).contains(&reuse) {
            return Err(ConfigError::IllegalValue(
                "reuse time must be within [0.5, 3600] seconds",
            ));
        }
        if self.reuse_time < self.timeout {
            return Err(ConfigError::IllegalValue(
                "reuse time must not be smaller than timeout",
            ));
        }
        if self.max_slots > MAX_SLOTS {
            return Err(ConfigError::IllegalValue("max slots must be at most 32"));
        }
        if self.buffer_size != 0 && self.buffer_size < MIN_BUFFER_SIZE {
            return Err(ConfigError::IllegalValue(
                "buffer size too small for handshake and wire records",
            ));
        }
        if self.always_encrypt && self.disable_encryption {
            return Err(ConfigError::IllegalValue(
                "always encrypt conflicts with disabled encryption",
            ));
        }
        if !self.disable_encryption {
            let cert = self
                .cert_chain_pem
                .as_ref()
                .ok_or(ConfigError::IllegalValue("certificate chain must be set"))?;
            let key = self
                .private_key_pem
                .as_ref()
                .ok_or(ConfigError::IllegalValue("private key must be set"))?;
            if !cert.exists() {
                return Err(ConfigError::MissingFile(cert.clone()));
            }
            if !key.exists() {
                return Err(ConfigError::MissingFile(key.clone()));
            }
        }
        Ok(())
    }

    /// Slots per connection after applying mode rules
    pub fn effective_max_slots(&self) -> u8 {
        if self.synchronous {
            1
        } else if self.max_slots == 0 {
            DEFAULT_MAX_SLOTS
        } else {
            self.max_slots
        }
    }

    /// Buffer size after applying the default
    pub fn effective_buffer_size(&self) -> usize {
        if self.buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            self.buffer_size
        }
    }

    /// Idle age beyond which a probe precedes the next send
    pub fn probe_threshold(&self) -> Duration {
        self.reuse_time / 4 * 3
    }
}

/// Errors in the application's configuration
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A value was outside its permitted range
    #[error("{0}")]
    IllegalValue(&'static str),
    /// A configured file does not exist
    #[error("configured file {0:?} does not exist")]
    MissingFile(PathBuf),
}
