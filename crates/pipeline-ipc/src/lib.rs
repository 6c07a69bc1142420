//! IPC layer for moving micro-batches between pipeline processes.
//!
//! This crate provides:
//! - One Unix domain socket listener per bound destination id
//! - Length-prefixed framing
//! - Cached, bounded outbound queues per destination
//!
//! Every process owns an explicit [`IpcContext`]; nothing is global.

mod context;
mod error;
mod frame;

pub use context::{purge_socket_dir, IpcConfig, IpcContext};
pub use error::{IpcError, IpcResult};
pub use frame::{encode_frame, read_frame, write_frame, FRAME_HEADER_SIZE};
