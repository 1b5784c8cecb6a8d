//! # Engine configuration
//!
//! Tunables for the partition write path, compaction and replication. Every
//! field can be overridden through the environment:
//!
//! ```text
//!  PARTITION_MAX_ARENA_RECORDS  head arena records before an urgent commit (65536)
//!  PARTITION_MAX_ARENA_BYTES    head arena payload bytes before an urgent commit (64 MiB)
//!  PARTITION_TABLES_SOFT_LIMIT  table count above which compaction runs (2)
//!  PARTITION_TABLES_HARD_LIMIT  table count above which compaction runs inline (10)
//!  REPLICATION_BATCH_ROWS       max rows per replication request (8192)
//!  REPLICATION_BATCH_BYTES      max payload bytes per replication request (50 MiB)
//!  REPLICATION_TIMEOUT_MS       per-request replication timeout (30000)
//!  PARTITION_FSYNC              fsync table files and snapshots ("true")
//! ```
//!
//! Values that fail to parse fall back to the default.

use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Head arena size that triggers a synchronous commit on the insert path.
    pub max_arena_records: usize,
    /// Head arena payload bytes that trigger a synchronous commit.
    pub max_arena_bytes: usize,
    /// `needs_compaction` is true above this many tables.
    pub compaction_soft_limit: usize,
    /// `needs_urgent_compaction` is true above this many tables.
    pub compaction_hard_limit: usize,
    pub replication_batch_rows: usize,
    pub replication_batch_bytes: usize,
    /// Per-request timeout of the HTTP replication transport.
    pub replication_timeout: Duration,
    pub fsync: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_arena_records: 65_536,
            max_arena_bytes: 64 * 1024 * 1024,
            compaction_soft_limit: 2,
            compaction_hard_limit: 10,
            replication_batch_rows: 8192,
            replication_batch_bytes: 50 * 1024 * 1024,
            replication_timeout: Duration::from_secs(30),
            fsync: true,
        }
    }
}

impl EngineConfig {
    /// Builds a config from the defaults, overridden by environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_arena_records: env_or("PARTITION_MAX_ARENA_RECORDS", d.max_arena_records),
            max_arena_bytes: env_or("PARTITION_MAX_ARENA_BYTES", d.max_arena_bytes),
            compaction_soft_limit: env_or("PARTITION_TABLES_SOFT_LIMIT", d.compaction_soft_limit),
            compaction_hard_limit: env_or("PARTITION_TABLES_HARD_LIMIT", d.compaction_hard_limit),
            replication_batch_rows: env_or("REPLICATION_BATCH_ROWS", d.replication_batch_rows),
            replication_batch_bytes: env_or("REPLICATION_BATCH_BYTES", d.replication_batch_bytes),
            replication_timeout: Duration::from_millis(env_or(
                "REPLICATION_TIMEOUT_MS",
                d.replication_timeout.as_millis() as u64,
            )),
            fsync: env_or("PARTITION_FSYNC", d.fsync),
        }
    }

    pub fn with_compaction_limits(mut self, soft: usize, hard: usize) -> Self {
        self.compaction_soft_limit = soft;
        self.compaction_hard_limit = hard;
        self
    }

    pub fn with_max_arena_records(mut self, n: usize) -> Self {
        self.max_arena_records = n;
        self
    }

    pub fn with_max_arena_bytes(mut self, n: usize) -> Self {
        self.max_arena_bytes = n;
        self
    }

    pub fn with_replication_timeout(mut self, timeout: Duration) -> Self {
        self.replication_timeout = timeout;
        self
    }

    pub fn with_replication_batch(mut self, rows: usize, bytes: usize) -> Self {
        self.replication_batch_rows = rows;
        self.replication_batch_bytes = bytes;
        self
    }
}

/// Reads a configuration value from the environment, falling back to `default`.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
