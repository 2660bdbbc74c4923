//! In-memory log store.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use crate::error::{MigrateError, Result};
use crate::migration::Repo;

use super::{LogKey, LogStore, MigrationLog};

/// Log store that keeps rows in memory and records scripts instead of
/// running them.
///
/// Seeded with the rows of a real log, it previews what an engine call
/// would execute without touching the database.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    committed: Vec<MigrationLog>,
    working: Option<Vec<MigrationLog>>,
    executed: Vec<String>,
    failing_scripts: HashSet<String>,
}

impl MemoryLogStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding the given committed rows.
    #[must_use]
    pub fn with_logs(logs: Vec<MigrationLog>) -> Self {
        Self {
            committed: logs,
            ..Self::default()
        }
    }

    /// Makes [`LogStore::exec`] fail whenever it receives `script`.
    #[must_use]
    pub fn fail_on(mut self, script: impl Into<String>) -> Self {
        self.failing_scripts.insert(script.into());
        self
    }

    /// Scripts passed to [`LogStore::exec`], in call order, including
    /// failed ones and ones later rolled back.
    #[must_use]
    pub fn executed(&self) -> &[String] {
        &self.executed
    }

    /// Committed rows, in insertion order.
    #[must_use]
    pub fn logs(&self) -> &[MigrationLog] {
        &self.committed
    }

    fn rows(&self) -> &[MigrationLog] {
        self.working.as_deref().unwrap_or(self.committed.as_slice())
    }

    fn rows_mut(&mut self) -> &mut Vec<MigrationLog> {
        match self.working {
            Some(ref mut working) => working,
            None => &mut self.committed,
        }
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn create_log_table(&mut self) -> Result<()> {
        Ok(())
    }

    async fn begin(&mut self) -> Result<()> {
        if self.working.is_some() {
            return Err(MigrateError::InvalidState(
                "Transaction already open".to_string(),
            ));
        }
        self.working = Some(self.committed.clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let working = self
            .working
            .take()
            .ok_or_else(|| MigrateError::InvalidState("No open transaction".to_string()))?;
        self.committed = working;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.working
            .take()
            .ok_or_else(|| MigrateError::InvalidState("No open transaction".to_string()))?;
        Ok(())
    }

    async fn exec(&mut self, script: &str) -> Result<()> {
        self.executed.push(script.to_string());
        if self.failing_scripts.contains(script) {
            return Err(MigrateError::Store(format!("script rejected: {script}")));
        }
        Ok(())
    }

    async fn insert_logs(&mut self, logs: &[MigrationLog]) -> Result<()> {
        let mut keys: HashSet<LogKey> = self.rows().iter().map(MigrationLog::key).collect();
        for log in logs {
            if !keys.insert(log.key()) {
                return Err(MigrateError::Store(format!(
                    "duplicate log row {}/{}",
                    log.repo, log.idx
                )));
            }
        }
        self.rows_mut().extend_from_slice(logs);
        Ok(())
    }

    async fn fetch_all_logs(&mut self) -> Result<Vec<MigrationLog>> {
        let mut logs = self.rows().to_vec();
        logs.sort_by(|a, b| {
            (a.migration_serial, &a.repo, a.idx).cmp(&(b.migration_serial, &b.repo, b.idx))
        });
        Ok(logs)
    }

    async fn fetch_last_serial(&mut self) -> Result<Option<i64>> {
        Ok(self.rows().iter().map(|log| log.migration_serial).max())
    }

    async fn fetch_last_indexes(&mut self) -> Result<HashMap<Repo, i64>> {
        let mut indexes: HashMap<Repo, i64> = HashMap::new();
        for log in self.rows() {
            let last = indexes.entry(log.repo.clone()).or_insert(log.idx);
            *last = (*last).max(log.idx);
        }
        Ok(indexes)
    }

    async fn fetch_reverse_indexes_after_serial(
        &mut self,
        serial: i64,
    ) -> Result<HashMap<Repo, Vec<i64>>> {
        let mut indexes: HashMap<Repo, Vec<i64>> = HashMap::new();
        for log in self.rows().iter().filter(|log| log.migration_serial > serial) {
            indexes.entry(log.repo.clone()).or_default().push(log.idx);
        }
        for repo_indexes in indexes.values_mut() {
            repo_indexes.sort_unstable_by(|a, b| b.cmp(a));
        }
        Ok(indexes)
    }

    async fn delete_logs(&mut self, keys: &[LogKey]) -> Result<()> {
        let doomed: HashSet<&LogKey> = keys.iter().collect();
        let rows = self.rows_mut();
        let before = rows.len();
        rows.retain(|log| !doomed.contains(&log.key()));
        let deleted = before - rows.len();

        if deleted != doomed.len() {
            return Err(MigrateError::InvalidState(format!(
                "Expected to delete {} log rows, deleted {}",
                doomed.len(),
                deleted
            )));
        }
        Ok(())
    }
}
