//! Configuration, filesystem layout and logging setup shared by the stream
//! pipeline crates and binaries.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{Config, BLOCK_SIZE, DEFAULT_LOG_LEVEL, MAX_STREAM_BUFFER_BLOCKS};
pub use error::{CoreError, CoreResult};
pub use logging::init_logging_for_service;
pub use paths::Paths;
