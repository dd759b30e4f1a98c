//! Error types for the Homa receive path.

use std::fmt;

/// Error type surfaced by receive operations.
///
/// Internal packet-level problems (corrupt segments, unknown RPC ids and the
/// like) never reach this type; they are metered and the packet is dropped.
/// Only the blocking receive path returns errors to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HomaError {
    /// The socket has been shut down (ESHUTDOWN).
    Shutdown,
    /// No message is ready and the caller asked not to block (EAGAIN).
    WouldBlock,
    /// The wait was interrupted by a signal (EINTR).
    Interrupted,
    /// The id passed to a receive call does not name a client RPC (EINVAL).
    InvalidId(u64),
    /// The RPC was aborted; carries the negative errno recorded on it.
    Aborted(i32),
    /// Receive buffer space could not be located during copy-out.
    NoBufferSpace { id: u64, offset: i64 },
    /// A wire packet was too short or carried an unusable field.
    BadPacket(&'static str),
}

impl fmt::Display for HomaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HomaError::Shutdown => write!(f, "socket has been shut down"),
            HomaError::WouldBlock => write!(f, "no message ready"),
            HomaError::Interrupted => write!(f, "wait interrupted by signal"),
            HomaError::InvalidId(id) => write!(f, "id {} does not name a client RPC", id),
            HomaError::Aborted(errno) => write!(f, "RPC aborted with error {}", errno),
            HomaError::NoBufferSpace { id, offset } => {
                write!(f, "no buffer space for RPC {} at offset {}", id, offset)
            }
            HomaError::BadPacket(what) => write!(f, "bad packet: {}", what),
        }
    }
}

impl std::error::Error for HomaError {}

/// Result type for Homa operations.
pub type Result<T> = std::result::Result<T, HomaError>;
