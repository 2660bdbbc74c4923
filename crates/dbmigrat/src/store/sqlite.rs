//! SQLite log store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::{Sqlite, SqlitePool};
use sqlx::{Executor, QueryBuilder, Transaction};
use tracing::debug;

use crate::error::{MigrateError, Result};
use crate::migration::Repo;

use super::{CREATE_LOG_TABLE_SQL, LogKey, LogStore, MigrationLog};

type LogRow = (i64, String, i64, String, String, String);

/// Log store backed by a SQLite pool.
///
/// Outside a transaction each call checks out its own pooled connection.
/// Inside one, every call runs on the transaction's connection.
pub struct SqliteLogStore {
    pool: SqlitePool,
    tx: Option<Transaction<'static, Sqlite>>,
}

impl SqliteLogStore {
    /// Creates a store over the given pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, tx: None }
    }

    /// Returns the underlying pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn take_tx(&mut self) -> Result<Transaction<'static, Sqlite>> {
        self.tx
            .take()
            .ok_or_else(|| MigrateError::InvalidState("No open transaction".to_string()))
    }
}

fn parse_applied_at(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // SQLite datetime('now') format
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|dt| dt.and_utc())
        })
        .map_err(|_| MigrateError::InvalidState(format!("Unparseable applied_at value '{raw}'")))
}

#[async_trait]
impl LogStore for SqliteLogStore {
    async fn create_log_table(&mut self) -> Result<()> {
        let query = sqlx::query(CREATE_LOG_TABLE_SQL);
        match self.tx.as_mut() {
            Some(tx) => query.execute(&mut **tx).await?,
            None => query.execute(&self.pool).await?,
        };
        Ok(())
    }

    async fn begin(&mut self) -> Result<()> {
        if self.tx.is_some() {
            return Err(MigrateError::InvalidState(
                "Transaction already open".to_string(),
            ));
        }
        self.tx = Some(self.pool.begin().await?);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.take_tx()?.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.take_tx()?.rollback().await?;
        Ok(())
    }

    async fn exec(&mut self, script: &str) -> Result<()> {
        debug!(sql = %script, "Executing SQL");
        match self.tx.as_mut() {
            Some(tx) => Executor::execute(&mut **tx, script).await?,
            None => Executor::execute(&self.pool, script).await?,
        };
        Ok(())
    }

    async fn insert_logs(&mut self, logs: &[MigrationLog]) -> Result<()> {
        if logs.is_empty() {
            return Ok(());
        }
        let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
            "INSERT INTO dbmigrat_log \
             (idx, repo, migration_serial, checksum, applied_at, description) ",
        );
        builder.push_values(logs, |mut row, log| {
            row.push_bind(log.idx)
                .push_bind(log.repo.as_str())
                .push_bind(log.migration_serial)
                .push_bind(log.checksum.as_str())
                .push_bind(log.applied_at.to_rfc3339())
                .push_bind(log.description.as_str());
        });
        let query = builder.build();
        match self.tx.as_mut() {
            Some(tx) => query.execute(&mut **tx).await?,
            None => query.execute(&self.pool).await?,
        };
        Ok(())
    }

    async fn fetch_all_logs(&mut self) -> Result<Vec<MigrationLog>> {
        let query = sqlx::query_as::<_, LogRow>(
            "SELECT idx, repo, migration_serial, checksum, applied_at, description \
             FROM dbmigrat_log ORDER BY migration_serial, repo, idx",
        );
        let rows = match self.tx.as_mut() {
            Some(tx) => query.fetch_all(&mut **tx).await?,
            None => query.fetch_all(&self.pool).await?,
        };

        let mut logs = Vec::with_capacity(rows.len());
        for (idx, repo, migration_serial, checksum, applied_at, description) in rows {
            logs.push(MigrationLog {
                idx,
                repo: Repo::from(repo),
                migration_serial,
                checksum,
                applied_at: parse_applied_at(&applied_at)?,
                description,
            });
        }
        Ok(logs)
    }

    async fn fetch_last_serial(&mut self) -> Result<Option<i64>> {
        let query =
            sqlx::query_scalar::<_, Option<i64>>("SELECT MAX(migration_serial) FROM dbmigrat_log");
        let serial = match self.tx.as_mut() {
            Some(tx) => query.fetch_one(&mut **tx).await?,
            None => query.fetch_one(&self.pool).await?,
        };
        Ok(serial)
    }

    async fn fetch_last_indexes(&mut self) -> Result<HashMap<Repo, i64>> {
        let query = sqlx::query_as::<_, (String, i64)>(
            "SELECT repo, MAX(idx) FROM dbmigrat_log GROUP BY repo",
        );
        let rows = match self.tx.as_mut() {
            Some(tx) => query.fetch_all(&mut **tx).await?,
            None => query.fetch_all(&self.pool).await?,
        };
        Ok(rows
            .into_iter()
            .map(|(repo, idx)| (Repo::from(repo), idx))
            .collect())
    }

    async fn fetch_reverse_indexes_after_serial(
        &mut self,
        serial: i64,
    ) -> Result<HashMap<Repo, Vec<i64>>> {
        let query = sqlx::query_as::<_, (String, i64)>(
            "SELECT repo, idx FROM dbmigrat_log \
             WHERE migration_serial > ? ORDER BY repo, idx DESC",
        )
        .bind(serial);
        let rows = match self.tx.as_mut() {
            Some(tx) => query.fetch_all(&mut **tx).await?,
            None => query.fetch_all(&self.pool).await?,
        };

        let mut indexes: HashMap<Repo, Vec<i64>> = HashMap::new();
        for (repo, idx) in rows {
            indexes.entry(Repo::from(repo)).or_default().push(idx);
        }
        Ok(indexes)
    }

    async fn delete_logs(&mut self, keys: &[LogKey]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut builder: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("DELETE FROM dbmigrat_log WHERE ");
        {
            let mut conditions = builder.separated(" OR ");
            for key in keys {
                conditions.push("(idx = ");
                conditions.push_bind_unseparated(key.idx);
                conditions.push_unseparated(" AND repo = ");
                conditions.push_bind_unseparated(key.repo.as_str());
                conditions.push_unseparated(")");
            }
        }
        let query = builder.build();
        let result = match self.tx.as_mut() {
            Some(tx) => query.execute(&mut **tx).await?,
            None => query.execute(&self.pool).await?,
        };

        if result.rows_affected() != keys.len() as u64 {
            return Err(MigrateError::InvalidState(format!(
                "Expected to delete {} log rows, deleted {}",
                keys.len(),
                result.rows_affected()
            )));
        }
        Ok(())
    }
}
