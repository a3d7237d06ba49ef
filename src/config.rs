use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::error::{MetaError, Result};

#[derive(Parser, Debug)]
#[command(name = "chunkmeta", about = "Transactional metadata engine for chunked file data")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a concurrent workload against the in-memory backend and verify invariants
    Stress {
        /// Number of worker threads
        #[arg(long, default_value_t = 8)]
        threads: usize,

        /// Operations per worker
        #[arg(long, default_value_t = 2000)]
        ops: usize,

        /// Files shared by all workers
        #[arg(long, default_value_t = 4)]
        files: usize,

        /// Space quota (bytes) placed on the workload directory, 0 for none
        #[arg(long, default_value_t = 0)]
        quota_space: i64,

        /// JSON file with engine configuration overrides
        #[arg(long)]
        config: Option<PathBuf>,

        /// Log file path
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
    /// Walk through the reference scenarios and print what the engine does
    Demo {
        /// Log file path
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    /// Identifier of this client session; owns its locks.
    pub session_id: u64,
    /// Attempts per transaction before a conflict is surfaced.
    pub retries: u32,
    /// Upper bound of the randomized sleep between attempts.
    pub max_backoff_ms: u64,
    pub read_only: bool,
    pub quota_flush_period_ms: u64,
    pub cleanup_period_ms: u64,
    /// Reads of a chunk with at least this many log entries trigger compaction.
    pub compact_read_threshold: usize,
    /// Writes trigger compaction whenever the log length hits `n * modulus - 1`.
    pub compact_write_modulus: usize,
    pub max_compacting: usize,
    /// Volume space limit in bytes, 0 for unlimited.
    pub capacity: u64,
    /// Volume inode limit, 0 for unlimited.
    pub max_inodes: u64,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            session_id: 1,
            retries: 50,
            max_backoff_ms: 100,
            read_only: false,
            quota_flush_period_ms: 3000,
            cleanup_period_ms: 60_000,
            compact_read_threshold: 5,
            compact_write_modulus: 100,
            max_compacting: 10,
            capacity: 0,
            max_inodes: 0,
        }
    }
}

impl MetaConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: MetaConfig = serde_json::from_str(&text)
            .map_err(|e| MetaError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retries == 0 {
            return Err(MetaError::Config("retries must be at least 1".into()));
        }
        if self.compact_write_modulus < 2 {
            return Err(MetaError::Config(
                "compact_write_modulus must be at least 2".into(),
            ));
        }
        Ok(())
    }

    pub fn quota_flush_period(&self) -> Duration {
        Duration::from_millis(self.quota_flush_period_ms)
    }

    pub fn cleanup_period(&self) -> Duration {
        Duration::from_millis(self.cleanup_period_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}
