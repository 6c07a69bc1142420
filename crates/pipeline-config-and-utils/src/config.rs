//! Configuration for stream pipeline processes.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Unit of `stream_buffer_blocks`.
pub const BLOCK_SIZE: usize = 8192;

/// Largest accepted `stream_buffer_blocks`. Slot offsets are 32-bit.
pub const MAX_STREAM_BUFFER_BLOCKS: usize = u32::MAX as usize / BLOCK_SIZE;

/// Smallest accepted `max_message_size`.
const MIN_MESSAGE_SIZE: usize = 4096;

/// Pipeline configuration.
///
/// Stored as JSON at `<base>/config.json`. Every field is optional in the
/// file; missing fields take the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Stream buffer capacity in 8 KiB blocks.
    pub stream_buffer_blocks: usize,
    /// Sleep between eviction checks while an append waits for readers.
    pub eviction_sleep_ms: u64,
    /// Give up on an append after waiting this long. `None` waits until the
    /// slot is released or the buffer shuts down.
    pub max_eviction_wait_ms: Option<u64>,
    /// Per-socket high-water mark (queued messages).
    pub ipc_hwm: usize,
    /// Largest micro-batch accepted on the wire, in bytes.
    pub max_message_size: usize,
    /// Tuple budget for one pull, and tuple cap for one micro-batch.
    pub batch_size: usize,
    /// Byte budget for one pull, in KiB.
    pub batch_mem_kb: usize,
    /// How long one pull keeps collecting before returning.
    pub batch_wait_ms: u64,
    /// Consume single receive-level acks locally instead of forwarding them.
    pub ack_fast_path: bool,
    /// Number of records in the shared acknowledgment table.
    pub ack_table_capacity: usize,
    /// Queue outgoing messages while the destination is not yet bound.
    pub enqueue_sends: bool,
    /// Worker processes; worker `i` is destination id `i`.
    pub num_workers: usize,
    /// Combiner processes; combiner `j` is destination id `num_workers + j`.
    pub num_combiners: usize,
    /// How long a failed non-blocking micro-batch send keeps retrying.
    pub send_fallback_wait_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            stream_buffer_blocks: 1024,
            eviction_sleep_ms: 1,
            max_eviction_wait_ms: None,
            ipc_hwm: 10,
            max_message_size: 8 * 1024 * 1024,
            batch_size: 10_000,
            batch_mem_kb: 256 * 1024,
            batch_wait_ms: 50,
            ack_fast_path: false,
            ack_table_capacity: 1024,
            enqueue_sends: false,
            num_workers: 1,
            num_combiners: 1,
            send_fallback_wait_ms: 100,
        }
    }
}

impl Config {
    /// Defaults, then environment overrides.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load `<base>/config.json` (defaults if missing), apply environment
    /// overrides and validate.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to `<base>/config.json`.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> CoreResult<()> {
        if self.stream_buffer_blocks == 0 {
            return Err(CoreError::Config("stream_buffer_blocks must be > 0".into()));
        }
        if self.stream_buffer_blocks > MAX_STREAM_BUFFER_BLOCKS {
            return Err(CoreError::Config(format!(
                "stream_buffer_blocks must be at most {}, got {}",
                MAX_STREAM_BUFFER_BLOCKS, self.stream_buffer_blocks
            )));
        }
        if self.ipc_hwm == 0 {
            return Err(CoreError::Config("ipc_hwm must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(CoreError::Config("batch_size must be > 0".into()));
        }
        if self.ack_table_capacity == 0 {
            return Err(CoreError::Config("ack_table_capacity must be > 0".into()));
        }
        if self.num_workers == 0 || self.num_combiners == 0 {
            return Err(CoreError::Config(
                "num_workers and num_combiners must be > 0".into(),
            ));
        }
        if self.max_message_size < MIN_MESSAGE_SIZE {
            return Err(CoreError::Config(format!(
                "max_message_size must be at least {} bytes, got {}",
                MIN_MESSAGE_SIZE, self.max_message_size
            )));
        }
        Ok(())
    }

    /// Stream buffer capacity in bytes. Saturates for block counts that
    /// `validate` rejects.
    pub fn stream_buffer_capacity(&self) -> usize {
        self.stream_buffer_blocks.saturating_mul(BLOCK_SIZE)
    }

    /// The level to log at: an explicit choice such as a CLI flag wins over
    /// `log_level`.
    pub fn effective_log_level<'a>(&'a self, explicit: Option<&'a str>) -> &'a str {
        explicit.unwrap_or(&self.log_level)
    }

    pub fn eviction_sleep(&self) -> Duration {
        Duration::from_millis(self.eviction_sleep_ms)
    }

    pub fn max_eviction_wait(&self) -> Option<Duration> {
        self.max_eviction_wait_ms.map(Duration::from_millis)
    }

    pub fn batch_wait(&self) -> Duration {
        Duration::from_millis(self.batch_wait_ms)
    }

    pub fn send_fallback_wait(&self) -> Duration {
        Duration::from_millis(self.send_fallback_wait_ms)
    }

    /// Byte budget for one pull.
    pub fn batch_mem(&self) -> usize {
        self.batch_mem_kb * 1024
    }

    fn load_from_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `PIPELINE_*` overrides from `lookup`. Unparsable numbers are
    /// logged and ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("PIPELINE_LOG_LEVEL") {
            self.log_level = level;
        }
        override_number(&lookup, "PIPELINE_STREAM_BUFFER_BLOCKS", &mut self.stream_buffer_blocks);
        override_number(&lookup, "PIPELINE_IPC_HWM", &mut self.ipc_hwm);
        override_number(&lookup, "PIPELINE_BATCH_SIZE", &mut self.batch_size);
        override_number(&lookup, "PIPELINE_BATCH_WAIT_MS", &mut self.batch_wait_ms);
        override_number(&lookup, "PIPELINE_NUM_WORKERS", &mut self.num_workers);
        override_number(&lookup, "PIPELINE_NUM_COMBINERS", &mut self.num_combiners);
    }
}

fn override_number<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => warn!(key = %key, value = %raw, "ignoring unparsable override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.stream_buffer_capacity(), 1024 * BLOCK_SIZE);
        assert_eq!(config.ipc_hwm, 10);
        assert_eq!(config.batch_wait(), Duration::from_millis(50));
        assert!(config.max_eviction_wait().is_none());
        assert!(!config.ack_fast_path);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_load_partial_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(
            &config_path,
            r#"{ "log_level": "debug", "stream_buffer_blocks": 16, "max_eviction_wait_ms": 250 }"#,
        )
        .unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.stream_buffer_capacity(), 16 * BLOCK_SIZE);
        assert_eq!(config.max_eviction_wait(), Some(Duration::from_millis(250)));
        assert_eq!(config.batch_size, Config::default().batch_size);
    }

    #[test]
    fn test_config_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let config = Config {
            batch_size: 128,
            ack_fast_path: true,
            ..Config::default()
        };
        config.save(&paths).unwrap();

        let loaded = Config::load(&paths).unwrap();
        assert_eq!(loaded.batch_size, 128);
        assert!(loaded.ack_fast_path);
    }

    #[test]
    fn test_config_load_nonexistent_uses_defaults() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let config = Config::load(&paths).unwrap();
        assert_eq!(config.ipc_hwm, Config::default().ipc_hwm);
    }

    #[test]
    fn test_config_rejects_invalid_file() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());
        paths.ensure_dirs().unwrap();
        std::fs::write(paths.config_file(), r#"{ "ipc_hwm": 0 }"#).unwrap();

        assert!(matches!(Config::load(&paths), Err(CoreError::Config(_))));
    }

    #[test]
    fn test_validate_small_message_size() {
        let config = Config {
            max_message_size: 100,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn test_validate_caps_stream_buffer_blocks() {
        let mut config = Config {
            stream_buffer_blocks: MAX_STREAM_BUFFER_BLOCKS,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
        assert!(config.stream_buffer_capacity() <= u32::MAX as usize);

        // 4 GiB exactly no longer fits 32-bit slot offsets.
        config.stream_buffer_blocks = 524_288;
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));

        config.stream_buffer_blocks = usize::MAX;
        assert_eq!(config.stream_buffer_capacity(), usize::MAX);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_topology() {
        let config = Config {
            num_combiners: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn test_effective_log_level() {
        let config = Config {
            log_level: "debug".into(),
            ..Config::default()
        };
        assert_eq!(config.effective_log_level(None), "debug");
        assert_eq!(config.effective_log_level(Some("warn")), "warn");
    }

    #[test]
    fn test_log_level_from_file_and_env() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());
        Config {
            log_level: "debug".into(),
            ..Config::default()
        }
        .save(&paths)
        .unwrap();

        let mut config = Config::load_from_file(&paths.config_file()).unwrap();
        assert_eq!(config.effective_log_level(None), "debug");

        config.apply_overrides(|key| (key == "PIPELINE_LOG_LEVEL").then(|| "error".to_string()));
        assert_eq!(config.effective_log_level(None), "error");
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("PIPELINE_LOG_LEVEL", "trace"),
            ("PIPELINE_IPC_HWM", "64"),
            ("PIPELINE_BATCH_SIZE", "not-a-number"),
            ("PIPELINE_NUM_WORKERS", "4"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.log_level, "trace");
        assert_eq!(config.ipc_hwm, 64);
        assert_eq!(config.batch_size, Config::default().batch_size);
        assert_eq!(config.num_workers, 4);
    }
}
