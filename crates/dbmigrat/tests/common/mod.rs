#![allow(dead_code)]

use std::collections::HashMap;

use async_trait::async_trait;
use dbmigrat::prelude::*;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

pub async fn create_test_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .expect("Failed to create in-memory SQLite pool")
}

pub async fn sqlite_executor() -> MigrationExecutor<SqliteLogStore> {
    let mut executor = MigrationExecutor::new(SqliteLogStore::new(create_test_pool().await));
    executor.init().await.expect("Failed to create log table");
    executor
}

pub async fn table_exists(pool: &SqlitePool, name: &str) -> bool {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' AND name = ?")
            .bind(name)
            .fetch_optional(pool)
            .await
            .unwrap();
    row.is_some()
}

pub async fn column_exists(pool: &SqlitePool, table: &str, column: &str) -> bool {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT name FROM pragma_table_info(?) WHERE name = ?")
            .bind(table)
            .bind(column)
            .fetch_optional(pool)
            .await
            .unwrap();
    row.is_some()
}

pub fn a0() -> Migration {
    Migration::new(
        "create users",
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
    )
    .down("DROP TABLE users")
}

pub fn a1() -> Migration {
    Migration::new("add email", "ALTER TABLE users ADD COLUMN email TEXT")
        .down("ALTER TABLE users DROP COLUMN email")
}

pub fn b0() -> Migration {
    Migration::new(
        "create invoices",
        "CREATE TABLE invoices (id INTEGER PRIMARY KEY, amount INTEGER NOT NULL)",
    )
    .down("DROP TABLE invoices")
}

pub fn d0() -> Migration {
    Migration::new(
        "create shipments",
        "CREATE TABLE shipments (id INTEGER PRIMARY KEY, address TEXT NOT NULL)",
    )
    .down("DROP TABLE shipments")
}

/// `auth: [A0, A1]`, `billing: [B0]`.
pub fn shop() -> Migrations {
    [
        (Repo::from("auth"), vec![a0(), a1()]),
        (Repo::from("billing"), vec![b0()]),
    ]
    .into()
}

/// [`shop`] plus `delivery: [D0]`.
pub fn shop_with_delivery() -> Migrations {
    let mut migrations = shop();
    migrations.insert(Repo::from("delivery"), vec![d0()]);
    migrations
}

pub fn injected() -> MigrateError {
    MigrateError::Store("injected failure".to_string())
}

/// Which store operations fail.
#[derive(Debug, Default, Clone, Copy)]
pub struct Faults {
    pub begin: bool,
    pub commit: bool,
    pub rollback: bool,
    pub exec: bool,
    pub insert_logs: bool,
    pub fetch_all_logs: bool,
    pub fetch_last_serial: bool,
    pub fetch_last_indexes: bool,
    pub fetch_reverse_indexes: bool,
    pub delete_logs: bool,
}

/// Wraps a store and fails the operations selected in [`Faults`].
pub struct FaultyStore<S> {
    pub inner: S,
    pub faults: Faults,
}

impl<S> FaultyStore<S> {
    pub fn new(inner: S, faults: Faults) -> Self {
        Self { inner, faults }
    }
}

#[async_trait]
impl<S: LogStore> LogStore for FaultyStore<S> {
    async fn create_log_table(&mut self) -> Result<()> {
        self.inner.create_log_table().await
    }

    async fn begin(&mut self) -> Result<()> {
        if self.faults.begin {
            return Err(injected());
        }
        self.inner.begin().await
    }

    async fn commit(&mut self) -> Result<()> {
        if self.faults.commit {
            return Err(injected());
        }
        self.inner.commit().await
    }

    async fn rollback(&mut self) -> Result<()> {
        if self.faults.rollback {
            return Err(injected());
        }
        self.inner.rollback().await
    }

    async fn exec(&mut self, script: &str) -> Result<()> {
        if self.faults.exec {
            return Err(injected());
        }
        self.inner.exec(script).await
    }

    async fn insert_logs(&mut self, logs: &[MigrationLog]) -> Result<()> {
        if self.faults.insert_logs {
            return Err(injected());
        }
        self.inner.insert_logs(logs).await
    }

    async fn fetch_all_logs(&mut self) -> Result<Vec<MigrationLog>> {
        if self.faults.fetch_all_logs {
            return Err(injected());
        }
        self.inner.fetch_all_logs().await
    }

    async fn fetch_last_serial(&mut self) -> Result<Option<i64>> {
        if self.faults.fetch_last_serial {
            return Err(injected());
        }
        self.inner.fetch_last_serial().await
    }

    async fn fetch_last_indexes(&mut self) -> Result<HashMap<Repo, i64>> {
        if self.faults.fetch_last_indexes {
            return Err(injected());
        }
        self.inner.fetch_last_indexes().await
    }

    async fn fetch_reverse_indexes_after_serial(
        &mut self,
        serial: i64,
    ) -> Result<HashMap<Repo, Vec<i64>>> {
        if self.faults.fetch_reverse_indexes {
            return Err(injected());
        }
        self.inner.fetch_reverse_indexes_after_serial(serial).await
    }

    async fn delete_logs(&mut self, keys: &[LogKey]) -> Result<()> {
        if self.faults.delete_logs {
            return Err(injected());
        }
        self.inner.delete_logs(keys).await
    }
}
