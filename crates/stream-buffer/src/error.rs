//! Error types for stream-buffer.

use thiserror::Error;

/// Errors that can occur during stream buffer operations.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Failed to create or open shared memory
    #[error("shared memory error: {0}")]
    SharedMemory(String),

    /// Failed to map shared memory into address space
    #[error("memory mapping error: {0}")]
    Mmap(String),

    /// Invalid shared memory header (wrong magic, version or size)
    #[error("invalid stream buffer header: {0}")]
    InvalidHeader(String),

    /// Buffer configuration cannot be used
    #[error("invalid stream buffer config: {0}")]
    InvalidConfig(String),

    /// A single event can never fit, even in an empty buffer
    #[error("event too large: {size} bytes, buffer capacity {capacity} bytes")]
    EventTooLarge { size: usize, capacity: usize },

    /// Stream names are stored with a 16-bit length
    #[error("stream name too long: {0} bytes")]
    StreamNameTooLong(usize),

    /// Reader id outside `0..MAX_READERS`
    #[error("invalid reader id {0}")]
    InvalidReader(usize),

    /// Append gave up waiting for readers to release space
    #[error("append timed out after {waited_ms}ms waiting for eviction")]
    EvictionTimeout { waited_ms: u64 },

    /// Buffer has been shut down
    #[error("stream buffer has been shut down")]
    Shutdown,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for stream buffer operations.
pub type StreamResult<T> = Result<T, StreamError>;
