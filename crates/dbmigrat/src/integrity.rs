//! Drift detection between the migration log and supplied migrations.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::warn;

use crate::error::Result;
use crate::migration::{checksum, Migrations, Repo};
use crate::store::{LogStore, MigrationLog};

/// Discrepancies between the log and a set of migrations.
///
/// Redundant repos and redundant migrations exist in the log but not in
/// the supplied migrations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    /// Whether any category below is non-empty.
    pub corrupted: bool,
    /// Repos the log references that the migrations don't define.
    pub redundant_repos: BTreeSet<Repo>,
    /// Rows whose index is past the end of their repo's migrations.
    pub redundant_migrations: BTreeMap<Repo, Vec<MigrationLog>>,
    /// Rows whose checksum differs from the current up script.
    pub invalid_checksums: BTreeMap<Repo, Vec<MigrationLog>>,
}

/// Compares every log row against `migrations`. Never writes.
///
/// A corrupted log is reported, not returned as an error; only a failing
/// read is an error.
pub async fn check_log_table_integrity<S: LogStore + ?Sized>(
    store: &mut S,
    migrations: &Migrations,
) -> Result<IntegrityReport> {
    let logs = store.fetch_all_logs().await?;
    let mut report = IntegrityReport::default();

    for log in logs {
        let Some(repo_migrations) = migrations.get(&log.repo) else {
            report.redundant_repos.insert(log.repo);
            continue;
        };
        let Some(migration) = usize::try_from(log.idx)
            .ok()
            .and_then(|idx| repo_migrations.get(idx))
        else {
            report
                .redundant_migrations
                .entry(log.repo.clone())
                .or_default()
                .push(log);
            continue;
        };
        if log.checksum != checksum(&migration.up) {
            report
                .invalid_checksums
                .entry(log.repo.clone())
                .or_default()
                .push(log);
        }
    }

    report.corrupted = !report.redundant_repos.is_empty()
        || !report.redundant_migrations.is_empty()
        || !report.invalid_checksums.is_empty();
    if report.corrupted {
        warn!(
            redundant_repos = report.redundant_repos.len(),
            redundant_migrations = report.redundant_migrations.values().map(Vec::len).sum::<usize>(),
            invalid_checksums = report.invalid_checksums.values().map(Vec::len).sum::<usize>(),
            "Migration log is out of sync with migrations"
        );
    }
    Ok(report)
}
