//! # Observability
//!
//! Logging setup shared by every process that takes part in the stream
//! pipeline (writers, workers, combiners and the `pipelinectl` tool).
//!
//! Processes call [`init`] or [`init_with_config`] once at startup and then
//! use plain `tracing` macros. Where the output goes is decided here:
//!
//! - With a `log_path`, every process appends structured JSONL lines to the
//!   same file, so `tail -f <base>/logs/pipeline.jsonl | jq` follows writers
//!   and workers side by side. An optional compact stderr layer mirrors it.
//! - Without one, logs go to stderr in the compact human format.
//!
//! `RUST_LOG` always wins over the configured default level.
//!
//! ```rust,ignore
//! observability::init_with_config(observability::LogConfig {
//!     service_name: "worker".into(),
//!     default_level: "debug".into(),
//!     log_path: Some(paths.log_file()),
//!     also_stderr: true,
//! });
//! tracing::info!(worker_id = 3, "worker started");
//! ```

mod file_sink;
mod json_layer;

use std::path::PathBuf;

pub use file_sink::CentralLogWriter;
pub use json_layer::{JsonLayer, LogEntry};

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the process role (e.g., "writer", "worker", "combiner").
    /// Included in every JSONL line for filtering.
    pub service_name: String,

    /// Default log level filter (e.g., "debug", "info", "warn").
    /// Can be overridden by `RUST_LOG` environment variable.
    pub default_level: String,

    /// Central JSONL file. `None` logs to stderr only.
    pub log_path: Option<PathBuf>,

    /// Mirror JSONL output to stderr in compact form.
    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            log_path: None,
            also_stderr: false,
        }
    }
}

/// Initialize logging with default settings (stderr, `info`).
pub fn init(service_name: &str) {
    init_with_config(LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    });
}

/// Initialize logging with custom configuration.
///
/// Installing a second global subscriber is a no-op, so tests and embedded
/// callers may call this more than once.
pub fn init_with_config(config: LogConfig) {
    match &config.log_path {
        Some(path) => {
            if let Err(e) = file_sink::init_file_subscriber(&config, path) {
                eprintln!(
                    "observability: cannot open {}: {}, falling back to stderr",
                    path.display(),
                    e
                );
                init_stderr(&config);
            }
        }
        None => init_stderr(&config),
    }
}

fn init_stderr(config: &LogConfig) {
    use tracing_subscriber::util::SubscriberInitExt;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(&config.default_level))
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .finish()
        .try_init();
}

pub(crate) fn env_filter(default_level: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level))
}

/// Default central log location (`~/.pipeline/logs/pipeline.jsonl`).
pub fn default_log_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".pipeline").join("logs").join("pipeline.jsonl"))
}

pub use tracing::{debug, error, info, instrument, trace, warn};
pub use tracing::Level;
