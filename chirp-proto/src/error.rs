use thiserror::Error;

/// Status codes surfaced through send completions and connection teardown
///
/// The subset used as completion statuses is small (`Success`, `Timeout`,
/// `Shutdown`, `ProtocolError`, `WriteError`, `TlsError`, `CannotConnect`);
/// the remaining variants appear as immediate results of API calls or in
/// logs.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum ErrorCode {
    /// No error
    #[error("success")]
    Success,
    /// Supplied value is not allowed
    #[error("invalid value")]
    ValueError,
    /// A loop or handle operation failed in the runtime layer
    #[error("event-loop error")]
    UvError,
    /// Bad values received or the remote died unexpectedly
    #[error("protocol error")]
    ProtocolError,
    /// The chirp port is already in use
    #[error("address in use")]
    AddrInUse,
    /// Error the environment should never produce in normal operation
    #[error("fatal error")]
    Fatal,
    /// Any TLS error
    #[error("TLS error")]
    TlsError,
    /// Writing to the socket failed
    #[error("write error")]
    WriteError,
    /// The node or another object is not initialized
    #[error("not initialized")]
    Uninit,
    /// The action is already in progress
    #[error("already in progress")]
    InProgress,
    /// A connect, handshake or write timed out
    #[error("timeout")]
    Timeout,
    /// Could not allocate memory
    #[error("out of memory")]
    OutOfMemory,
    /// The node is closing, or the connection carrying the message was torn
    /// down mid-write
    #[error("shutting down")]
    Shutdown,
    /// The remote refused the connection or could not be reached
    #[error("cannot connect")]
    CannotConnect,
    /// The message was placed behind others on the remote's queue
    #[error("queued")]
    Queued,
    /// The message is already in use
    #[error("message in use")]
    Used,
    /// Partial progress; more input is needed
    #[error("more input needed")]
    More,
    /// The dispatcher skipped because a writer or ack slot was occupied
    #[error("busy")]
    Busy,
    /// The dispatcher found nothing to send
    #[error("queues empty")]
    Empty,
    /// Initializing a resource failed
    #[error("initialization failed")]
    InitFail,
}

impl ErrorCode {
    /// Whether this code indicates an accepted send (`Success` or `Queued`)
    pub fn is_ok(self) -> bool {
        matches!(self, ErrorCode::Success | ErrorCode::Queued)
    }
}
