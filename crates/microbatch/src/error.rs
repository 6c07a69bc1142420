//! Error types for micro-batch handling.

use pipeline_ipc::IpcError;
use stream_buffer::StreamError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MicrobatchError {
    /// Malformed or unsupported wire data
    #[error("codec error: {0}")]
    Codec(String),

    /// A single tuple can never fit in one micro-batch
    #[error("tuple too large: {size} bytes, at most {max} bytes fit in a micro-batch")]
    TupleTooLarge { size: usize, max: usize },

    /// No destination for a micro-batch
    #[error("routing error: {0}")]
    Routing(String),

    /// Every record of the acknowledgment table is in use
    #[error("acknowledgment table full ({0} records)")]
    AckTableFull(usize),

    /// Shared memory failure backing the acknowledgment table
    #[error("shared memory error: {0}")]
    Stream(#[from] StreamError),

    /// Transport failure
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),
}

pub type MicrobatchResult<T> = Result<T, MicrobatchError>;
