//! IPC error types.

use thiserror::Error;

/// IPC error type.
#[derive(Error, Debug)]
pub enum IpcError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Socket error
    #[error("Socket error: {0}")]
    Socket(String),

    /// A process binds at most one destination
    #[error("Already bound to destination {0}")]
    AlreadyBound(u64),

    /// poll/recv before bind
    #[error("Not bound to any destination")]
    NotBound,

    /// Destination has no listener and the context does not enqueue
    #[error("Destination {0} is not available")]
    PeerUnavailable(u64),

    /// Message exceeds the configured maximum
    #[error("Message too large: {size} bytes, maximum {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Context has been shut down
    #[error("IPC context has been shut down")]
    Shutdown,
}

/// Result type alias using IpcError.
pub type IpcResult<T> = Result<T, IpcError>;
