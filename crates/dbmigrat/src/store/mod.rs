//! Persistence of the migration log.
//!
//! The `dbmigrat_log` table holds one row per applied migration. A
//! [`LogStore`] owns at most one open transaction; every operation issued
//! between [`LogStore::begin`] and [`LogStore::commit`] or
//! [`LogStore::rollback`] runs inside it. Stores hold no decision logic.

mod memory;
mod sqlite;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::migration::Repo;

pub use memory::MemoryLogStore;
pub use sqlite::SqliteLogStore;

/// SQL to create the log table (SQLite).
pub const CREATE_LOG_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS dbmigrat_log (
    idx INTEGER NOT NULL,
    repo VARCHAR(255) NOT NULL,
    migration_serial INTEGER NOT NULL,
    checksum TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now')),
    description TEXT NOT NULL,
    PRIMARY KEY (idx, repo)
)
"#;

/// A row of the migration log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationLog {
    /// Position of the migration inside its repo.
    pub idx: i64,
    /// Repo the migration belongs to.
    pub repo: Repo,
    /// Serial of the run that applied the migration.
    pub migration_serial: i64,
    /// Hex-encoded SHA-1 of the up script at apply time.
    pub checksum: String,
    /// When the migration was applied.
    pub applied_at: DateTime<Utc>,
    /// Description copied from the migration.
    pub description: String,
}

impl MigrationLog {
    /// Returns the primary key of this row.
    #[must_use]
    pub fn key(&self) -> LogKey {
        LogKey {
            idx: self.idx,
            repo: self.repo.clone(),
        }
    }
}

/// Primary key of a log row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogKey {
    /// Position of the migration inside its repo.
    pub idx: i64,
    /// Repo the migration belongs to.
    pub repo: Repo,
}

/// Storage for the migration log plus script execution.
#[async_trait]
pub trait LogStore: Send {
    /// Creates the log table if it doesn't exist.
    async fn create_log_table(&mut self) -> Result<()>;

    /// Opens a transaction.
    async fn begin(&mut self) -> Result<()>;

    /// Commits the open transaction.
    async fn commit(&mut self) -> Result<()>;

    /// Rolls back the open transaction.
    async fn rollback(&mut self) -> Result<()>;

    /// Executes a migration script.
    async fn exec(&mut self, script: &str) -> Result<()>;

    /// Inserts log rows as a single write.
    async fn insert_logs(&mut self, logs: &[MigrationLog]) -> Result<()>;

    /// Returns every log row ordered by serial, repo and index.
    async fn fetch_all_logs(&mut self) -> Result<Vec<MigrationLog>>;

    /// Returns the highest serial, or `None` for an empty log.
    async fn fetch_last_serial(&mut self) -> Result<Option<i64>>;

    /// Returns the highest applied index of each repo in the log.
    async fn fetch_last_indexes(&mut self) -> Result<HashMap<Repo, i64>>;

    /// Returns, per repo, the indexes applied after `serial`, highest first.
    async fn fetch_reverse_indexes_after_serial(
        &mut self,
        serial: i64,
    ) -> Result<HashMap<Repo, Vec<i64>>>;

    /// Deletes the given rows as a single write.
    async fn delete_logs(&mut self, keys: &[LogKey]) -> Result<()>;
}
