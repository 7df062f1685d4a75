//! File system paths for the delivery layer.

use crate::{CoreError, CoreResult};
use std::path::PathBuf;

const BASE_DIR_NAME: &str = ".naarscars";
const OUTBOX_DATABASE_NAME: &str = "outbox.sqlite";

/// Manages file system paths for the outbound queue, attachments, and logs.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Base directory (~/.naarscars)
    base_dir: PathBuf,
}

impl Paths {
    /// Create a new Paths instance rooted at `~/.naarscars`.
    pub fn new() -> CoreResult<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::Path("Could not determine home directory".to_string()))?;

        Ok(Self {
            base_dir: home.join(BASE_DIR_NAME),
        })
    }

    /// Create a new Paths instance with a custom base directory.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Get the base directory (~/.naarscars).
    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Get the config file path (~/.naarscars/config.json).
    pub fn config_file(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// Get the durable outbound queue database (~/.naarscars/outbox.sqlite).
    pub fn outbox_database_file(&self) -> PathBuf {
        self.base_dir.join(OUTBOX_DATABASE_NAME)
    }

    /// Get the directory holding locally staged media (~/.naarscars/attachments).
    pub fn attachments_dir(&self) -> PathBuf {
        self.base_dir.join("attachments")
    }

    /// Get the logs directory (~/.naarscars/logs).
    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// Ensure all required directories exist.
    pub fn ensure_dirs(&self) -> CoreResult<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::create_dir_all(self.attachments_dir())?;
        std::fs::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}
