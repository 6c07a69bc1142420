//! File system layout for pipeline processes.

use crate::{CoreError, CoreResult};
use std::path::PathBuf;

/// Manages file system paths under one base directory.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Base directory (~/.pipeline)
    base_dir: PathBuf,
}

impl Paths {
    /// Use `~/.pipeline` as the base directory.
    pub fn new() -> CoreResult<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::Path("Could not determine home directory".to_string()))?;

        Ok(Self {
            base_dir: home.join(".pipeline"),
        })
    }

    /// Create a new Paths instance with a custom base directory.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Config file (`<base>/config.json`).
    pub fn config_file(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// Central JSONL log shared by all pipeline processes.
    pub fn log_file(&self) -> PathBuf {
        self.logs_dir().join("pipeline.jsonl")
    }

    /// Directory holding one socket per bound destination id.
    pub fn ipc_dir(&self) -> PathBuf {
        self.base_dir.join("pipeline").join("ipc")
    }

    /// Ensure all required directories exist.
    pub fn ensure_dirs(&self) -> CoreResult<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.ipc_dir())?;
        Ok(())
    }
}
