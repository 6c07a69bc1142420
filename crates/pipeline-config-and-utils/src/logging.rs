//! Logging initialization.
//!
//! Thin wrapper over the observability crate: every pipeline process writes
//! structured JSONL to the shared log file and mirrors it to stderr.

use crate::Paths;
use observability::LogConfig;

/// Initialize logging for a process role.
///
/// `RUST_LOG` overrides `level`. With `paths`, JSONL goes to
/// `<base>/logs/pipeline.jsonl`; without, only stderr is used.
pub fn init_logging_for_service(service_name: &str, level: &str, paths: Option<&Paths>) {
    observability::init_with_config(LogConfig {
        service_name: service_name.into(),
        default_level: level.into(),
        log_path: paths.map(Paths::log_file),
        also_stderr: true,
    });
}
