//! Migration executor.
//!
//! This module applies and reverses migrations against a [`LogStore`].
//! Every `migrate` or `rollback` call runs inside a single transaction:
//! either all of its scripts and log writes commit, or none do.
//!
//! Run serials and per-repo high-water marks are read from the log on
//! every call and never cached.
//!
//! Callers must ensure only one run at a time touches a given log table.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{MigrateError, Result};
use crate::integrity::{check_log_table_integrity, IntegrityReport};
use crate::migration::{Direction, Migration, Migrations, Repo, RepoOrder};
use crate::store::{LogKey, LogStore, MemoryLogStore, MigrationLog};

/// A migration `migrate` would apply next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMigration {
    /// Repo the migration belongs to.
    pub repo: Repo,
    /// Position of the migration inside its repo.
    pub index: usize,
    /// Migration description.
    pub description: String,
}

/// Applies and reverses migrations, tracking them in a log store.
pub struct MigrationExecutor<S: LogStore> {
    store: S,
}

impl<S: LogStore> MigrationExecutor<S> {
    /// Creates a new migration executor.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Returns the log store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Consumes the executor and returns the log store.
    pub fn into_store(self) -> S {
        self.store
    }

    /// Ensures the log table exists.
    pub async fn init(&mut self) -> Result<()> {
        self.store.create_log_table().await
    }

    /// Applies every pending migration of the repos in `repo_order`.
    ///
    /// All rows written by one call share a serial one greater than the
    /// previous maximum. Returns the number of applied migrations.
    pub async fn migrate(
        &mut self,
        migrations: &Migrations,
        repo_order: &RepoOrder,
    ) -> Result<usize> {
        self.begin().await?;
        let outcome = apply_pending(&mut self.store, migrations, repo_order).await;
        let applied = self.finish(outcome).await?;

        if applied > 0 {
            info!(applied, "Migrations applied successfully");
        } else {
            debug!("No pending migrations");
        }
        Ok(applied)
    }

    /// Reverses every migration applied by runs with a serial greater than
    /// `to_serial`.
    ///
    /// Repos are visited in `repo_order` as given; pass the reverse of the
    /// apply order. Inside a repo, the highest index is reversed first.
    /// The supplied migrations must still match the log: the index bound
    /// is checked, reordered content is not detected.
    ///
    /// Returns the number of reversed migrations.
    pub async fn rollback(
        &mut self,
        migrations: &Migrations,
        repo_order: &RepoOrder,
        to_serial: i64,
    ) -> Result<usize> {
        self.begin().await?;
        let outcome = reverse_after(&mut self.store, migrations, repo_order, to_serial).await;
        let reversed = self.finish(outcome).await?;

        if reversed > 0 {
            info!(reversed, to_serial, "Migrations rolled back successfully");
        }
        Ok(reversed)
    }

    /// Reverses the most recent run only.
    pub async fn rollback_last(
        &mut self,
        migrations: &Migrations,
        repo_order: &RepoOrder,
    ) -> Result<usize> {
        match self.last_serial().await? {
            Some(last) => self.rollback(migrations, repo_order, last - 1).await,
            None => Ok(0),
        }
    }

    /// Returns the migrations `migrate` would apply, in execution order.
    pub async fn pending(
        &mut self,
        migrations: &Migrations,
        repo_order: &RepoOrder,
    ) -> Result<Vec<PendingMigration>> {
        let last_indexes = self.store.fetch_last_indexes().await?;
        Ok(pending_ranges(migrations, repo_order, &last_indexes)
            .into_iter()
            .flat_map(|(repo, first, pending)| {
                pending
                    .iter()
                    .enumerate()
                    .map(move |(offset, migration)| PendingMigration {
                        repo: repo.clone(),
                        index: first + offset,
                        description: migration.description.clone(),
                    })
            })
            .collect())
    }

    /// Returns an executor over an in-memory copy of the log.
    ///
    /// The log table is created first if missing. Scripts run by the copy
    /// are only recorded, see [`MemoryLogStore::executed`].
    pub async fn preview(&mut self) -> Result<MigrationExecutor<MemoryLogStore>> {
        self.init().await?;
        let logs = self.applied().await?;
        Ok(MigrationExecutor::new(MemoryLogStore::with_logs(logs)))
    }

    /// Returns every log row.
    pub async fn applied(&mut self) -> Result<Vec<MigrationLog>> {
        self.store.fetch_all_logs().await
    }

    /// Returns the serial of the most recent run.
    pub async fn last_serial(&mut self) -> Result<Option<i64>> {
        self.store.fetch_last_serial().await
    }

    /// Compares the log against `migrations`. See [`check_log_table_integrity`].
    pub async fn check_log_table_integrity(
        &mut self,
        migrations: &Migrations,
    ) -> Result<IntegrityReport> {
        check_log_table_integrity(&mut self.store, migrations).await
    }

    async fn begin(&mut self) -> Result<()> {
        self.store
            .begin()
            .await
            .map_err(|e| MigrateError::transaction("begin", e))
    }

    async fn finish<T>(&mut self, outcome: Result<T>) -> Result<T> {
        match outcome {
            Ok(value) => {
                self.store
                    .commit()
                    .await
                    .map_err(|e| MigrateError::transaction("commit", e))?;
                Ok(value)
            }
            Err(err) => {
                warn!(error = %err, "Migration run failed, rolling back");
                match self.store.rollback().await {
                    Ok(()) => Err(err),
                    Err(rollback_err) => {
                        warn!(error = %rollback_err, "Transaction rollback failed");
                        Err(MigrateError::Multiple(vec![
                            err,
                            MigrateError::transaction("rollback", rollback_err),
                        ]))
                    }
                }
            }
        }
    }
}

/// Splits every repo into its first pending index and the migrations from
/// there on. Repos with nothing pending are left out, repeated repos are
/// planned once.
fn pending_ranges<'a>(
    migrations: &'a Migrations,
    repo_order: &'a RepoOrder,
    last_indexes: &HashMap<Repo, i64>,
) -> Vec<(&'a Repo, usize, &'a [Migration])> {
    let mut visited = HashSet::new();
    let mut ranges = Vec::new();
    for repo in repo_order {
        if !visited.insert(repo) {
            continue;
        }
        let Some(repo_migrations) = migrations.get(repo) else {
            continue;
        };
        let first = last_indexes
            .get(repo)
            .and_then(|&last| usize::try_from(last).ok())
            .map_or(0, |last| last + 1);
        if repo_migrations.len() <= first {
            continue;
        }
        ranges.push((repo, first, &repo_migrations[first..]));
    }
    ranges
}

async fn apply_pending<S: LogStore>(
    store: &mut S,
    migrations: &Migrations,
    repo_order: &RepoOrder,
) -> Result<usize> {
    let serial = store.fetch_last_serial().await?.map_or(0, |last| last + 1);
    let last_indexes = store.fetch_last_indexes().await?;
    let applied_at = Utc::now();

    let mut applied = 0;
    for (repo, first, pending) in pending_ranges(migrations, repo_order, &last_indexes) {
        let mut logs = Vec::with_capacity(pending.len());
        for (offset, migration) in pending.iter().enumerate() {
            let index = first + offset;
            info!(
                repo = %repo,
                index,
                description = %migration.description,
                "Applying migration"
            );
            store
                .exec(&migration.up)
                .await
                .map_err(|source| MigrateError::Script {
                    repo: repo.clone(),
                    index,
                    direction: Direction::Up,
                    source: Box::new(source),
                })?;
            logs.push(MigrationLog {
                idx: i64::try_from(index).map_err(|_| {
                    MigrateError::InvalidState(format!("Index {index} does not fit the log"))
                })?,
                repo: repo.clone(),
                migration_serial: serial,
                checksum: migration.checksum(),
                applied_at,
                description: migration.description.clone(),
            });
        }
        store.insert_logs(&logs).await?;
        applied += logs.len();
    }

    debug!(serial, applied, "Migration run prepared");
    Ok(applied)
}

async fn reverse_after<S: LogStore>(
    store: &mut S,
    migrations: &Migrations,
    repo_order: &RepoOrder,
    to_serial: i64,
) -> Result<usize> {
    let mut reverse_indexes = store.fetch_reverse_indexes_after_serial(to_serial).await?;

    // Resolve every script before running any of them.
    let mut plan = Vec::new();
    for repo in repo_order {
        let Some(indexes) = reverse_indexes.remove(repo) else {
            continue;
        };
        let repo_migrations = migrations.get(repo).map_or(&[][..], Vec::as_slice);
        for idx in indexes {
            let (index, migration) = usize::try_from(idx)
                .ok()
                .and_then(|index| repo_migrations.get(index).map(|m| (index, m)))
                .ok_or_else(|| MigrateError::OutOfSync {
                    repo: repo.clone(),
                    index: idx,
                })?;
            let down = migration
                .down
                .as_deref()
                .ok_or_else(|| MigrateError::NotReversible {
                    repo: repo.clone(),
                    index,
                })?;
            plan.push((repo, index, migration, down, idx));
        }
    }

    let mut doomed = Vec::with_capacity(plan.len());
    for (repo, index, migration, down, idx) in plan {
        info!(
            repo = %repo,
            index,
            description = %migration.description,
            "Rolling back migration"
        );
        store
            .exec(down)
            .await
            .map_err(|source| MigrateError::Script {
                repo: repo.clone(),
                index,
                direction: Direction::Down,
                source: Box::new(source),
            })?;
        doomed.push(LogKey {
            idx,
            repo: repo.clone(),
        });
    }

    store.delete_logs(&doomed).await?;
    Ok(doomed.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryLogStore;

    fn migration(name: &str) -> Migration {
        Migration::new(name, format!("UP {name}")).down(format!("DOWN {name}"))
    }

    fn migrations(repos: &[(&str, &[&str])]) -> Migrations {
        repos
            .iter()
            .map(|(repo, names)| {
                (
                    Repo::from(*repo),
                    names.iter().map(|name| migration(name)).collect(),
                )
            })
            .collect()
    }

    fn executor() -> MigrationExecutor<MemoryLogStore> {
        MigrationExecutor::new(MemoryLogStore::new())
    }

    #[tokio::test]
    async fn test_migrate_applies_in_repo_order() {
        let mut executor = executor();
        let defs = migrations(&[("auth", &["A0", "A1"]), ("billing", &["B0"])]);

        let applied = executor
            .migrate(&defs, &RepoOrder::new(["billing", "auth"]))
            .await
            .unwrap();

        assert_eq!(applied, 3);
        assert_eq!(executor.store().executed(), ["UP B0", "UP A0", "UP A1"]);
        assert!(executor.store().logs().iter().all(|l| l.migration_serial == 0));
    }

    #[tokio::test]
    async fn test_migrate_twice_applies_nothing() {
        let mut executor = executor();
        let defs = migrations(&[("auth", &["A0", "A1"])]);
        let order = RepoOrder::new(["auth"]);

        assert_eq!(executor.migrate(&defs, &order).await.unwrap(), 2);
        assert_eq!(executor.migrate(&defs, &order).await.unwrap(), 0);
        assert_eq!(executor.store().executed().len(), 2);
    }

    #[tokio::test]
    async fn test_migrate_only_repos_in_both() {
        let mut executor = executor();
        let defs = migrations(&[("auth", &["A0"]), ("billing", &["B0"])]);

        let applied = executor
            .migrate(&defs, &RepoOrder::new(["auth", "delivery"]))
            .await
            .unwrap();

        assert_eq!(applied, 1);
        assert_eq!(executor.store().executed(), ["UP A0"]);
    }

    #[tokio::test]
    async fn test_migrate_continues_after_high_water_mark() {
        let mut executor = executor();
        let order = RepoOrder::new(["auth"]);
        executor
            .migrate(&migrations(&[("auth", &["A0"])]), &order)
            .await
            .unwrap();

        let applied = executor
            .migrate(&migrations(&[("auth", &["A0", "A1", "A2"])]), &order)
            .await
            .unwrap();

        assert_eq!(applied, 2);
        let logs = executor.applied().await.unwrap();
        let second_run: Vec<i64> = logs
            .iter()
            .filter(|l| l.migration_serial == 1)
            .map(|l| l.idx)
            .collect();
        assert_eq!(second_run, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_failed_script_leaves_log_untouched() {
        let mut executor = MigrationExecutor::new(MemoryLogStore::new().fail_on("UP B0"));
        let defs = migrations(&[("auth", &["A0"]), ("billing", &["B0"])]);

        let err = executor
            .migrate(&defs, &RepoOrder::new(["auth", "billing"]))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            MigrateError::Script {
                direction: Direction::Up,
                index: 0,
                ..
            }
        ));
        assert!(executor.store().logs().is_empty());
        assert_eq!(executor.last_serial().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rollback_reverses_descending_within_repo() {
        let mut executor = executor();
        let defs = migrations(&[("auth", &["A0", "A1"]), ("billing", &["B0"])]);
        let order = RepoOrder::new(["auth", "billing"]);
        executor.migrate(&defs, &order).await.unwrap();

        let reversed = executor.rollback(&defs, &order.reversed(), -1).await.unwrap();

        assert_eq!(reversed, 3);
        assert_eq!(
            &executor.store().executed()[3..],
            ["DOWN B0", "DOWN A1", "DOWN A0"]
        );
        assert!(executor.store().logs().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_at_or_past_last_serial_is_noop() {
        let mut executor = executor();
        let defs = migrations(&[("auth", &["A0"])]);
        let order = RepoOrder::new(["auth"]);
        executor.migrate(&defs, &order).await.unwrap();

        assert_eq!(executor.rollback(&defs, &order, 0).await.unwrap(), 0);
        assert_eq!(executor.rollback(&defs, &order, 5).await.unwrap(), 0);
        assert_eq!(executor.store().logs().len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_out_of_sync_runs_nothing() {
        let mut executor = executor();
        let order = RepoOrder::new(["auth", "billing"]);
        executor
            .migrate(&migrations(&[("auth", &["A0"]), ("billing", &["B0", "B1"])]), &order)
            .await
            .unwrap();

        let shrunk = migrations(&[("auth", &["A0"]), ("billing", &["B0"])]);
        let err = executor
            .rollback(&shrunk, &RepoOrder::new(["auth", "billing"]), -1)
            .await
            .unwrap_err();

        assert!(err.is_out_of_sync());
        assert!(matches!(err, MigrateError::OutOfSync { index: 1, .. }));
        assert_eq!(executor.store().executed().len(), 3);
        assert_eq!(executor.store().logs().len(), 3);
    }

    #[tokio::test]
    async fn test_rollback_irreversible_migration() {
        let mut executor = executor();
        let defs: Migrations =
            [(Repo::from("auth"), vec![Migration::new("A0", "UP A0")])].into();
        let order = RepoOrder::new(["auth"]);
        executor.migrate(&defs, &order).await.unwrap();

        let err = executor.rollback(&defs, &order, -1).await.unwrap_err();
        assert!(matches!(err, MigrateError::NotReversible { index: 0, .. }));
        assert_eq!(executor.store().logs().len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_last_only_undoes_latest_run() {
        let mut executor = executor();
        let order = RepoOrder::new(["auth"]);
        executor
            .migrate(&migrations(&[("auth", &["A0"])]), &order)
            .await
            .unwrap();
        let defs = migrations(&[("auth", &["A0", "A1"])]);
        executor.migrate(&defs, &order).await.unwrap();

        assert_eq!(executor.rollback_last(&defs, &order).await.unwrap(), 1);
        assert_eq!(executor.last_serial().await.unwrap(), Some(0));
        assert_eq!(executor.rollback_last(&defs, &order).await.unwrap(), 1);
        assert_eq!(executor.rollback_last(&defs, &order).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_migrate_repeated_repo_applied_once() {
        let mut executor = executor();
        let defs = migrations(&[("auth", &["A0", "A1"]), ("billing", &["B0"])]);
        let order = RepoOrder::new(["auth", "auth", "billing"]);

        assert_eq!(executor.migrate(&defs, &order).await.unwrap(), 3);
        assert_eq!(executor.store().executed(), ["UP A0", "UP A1", "UP B0"]);
        assert!(executor.pending(&defs, &order).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_preview_leaves_store_untouched() {
        let mut executor = executor();
        let order = RepoOrder::new(["auth"]);
        executor
            .migrate(&migrations(&[("auth", &["A0"])]), &order)
            .await
            .unwrap();

        let mut preview = executor.preview().await.unwrap();
        let applied = preview
            .migrate(&migrations(&[("auth", &["A0", "A1"])]), &order)
            .await
            .unwrap();

        assert_eq!(applied, 1);
        assert_eq!(preview.store().executed(), ["UP A1"]);
        assert_eq!(executor.store().logs().len(), 1);
    }

    #[tokio::test]
    async fn test_pending() {
        let mut executor = executor();
        let order = RepoOrder::new(["auth", "billing"]);
        executor
            .migrate(&migrations(&[("auth", &["A0"])]), &order)
            .await
            .unwrap();

        let defs = migrations(&[("auth", &["A0", "A1"]), ("billing", &["B0"])]);
        let pending = executor.pending(&defs, &order).await.unwrap();

        assert_eq!(
            pending,
            vec![
                PendingMigration {
                    repo: Repo::from("auth"),
                    index: 1,
                    description: "A1".to_string(),
                },
                PendingMigration {
                    repo: Repo::from("billing"),
                    index: 0,
                    description: "B0".to_string(),
                },
            ]
        );
    }
}
