//! Transactional SQL migrations organized in independent repos.
//!
//! `dbmigrat` applies and reverses plain SQL migrations grouped into
//! named repos (for example one repo per subsystem of a monorepo), and
//! keeps an audit log in the `dbmigrat_log` table.
//!
//! # Architecture
//!
//! - **Store** - Persists the migration log and runs scripts inside a transaction
//! - **Executor** - Decides which migrations run, in what order, under one transaction
//! - **Integrity** - Reports drift between the log and the supplied migrations
//! - **Reader** - Loads migrations from `<index>.<description>.<up|down>` files
//!
//! Each `migrate` call stamps every row it writes with one serial, one
//! greater than the previous run's. `rollback` undoes whole runs by serial.
//!
//! # Example
//!
//! ```rust,ignore
//! use dbmigrat::prelude::*;
//! use sqlx::sqlite::SqlitePoolOptions;
//!
//! let pool = SqlitePoolOptions::new().connect("sqlite:app.db").await?;
//! let mut executor = MigrationExecutor::new(SqliteLogStore::new(pool));
//! executor.init().await?;
//!
//! let mut migrations = Migrations::new();
//! migrations.insert(
//!     Repo::from("auth"),
//!     vec![Migration::new("create users", "CREATE TABLE users (id INTEGER)")
//!         .down("DROP TABLE users")],
//! );
//! let order = RepoOrder::new(["auth"]);
//!
//! let applied = executor.migrate(&migrations, &order).await?;
//!
//! // Undo every run after the first one.
//! executor.rollback(&migrations, &order.reversed(), 0).await?;
//!
//! let report = executor.check_log_table_integrity(&migrations).await?;
//! assert!(!report.corrupted);
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! # Create the log table
//! dbmigrat init
//!
//! # Apply pending migrations from ./migrations/<repo>/
//! dbmigrat --repos auth,billing migrate
//!
//! # Undo the last run
//! dbmigrat --repos auth,billing rollback
//!
//! # Compare the log against the migration files
//! dbmigrat check
//! ```

pub mod error;
pub mod executor;
pub mod integrity;
pub mod migration;
pub mod reader;
pub mod store;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::error::{MigrateError, Result};
    pub use crate::executor::{MigrationExecutor, PendingMigration};
    pub use crate::integrity::{check_log_table_integrity, IntegrityReport};
    pub use crate::migration::{checksum, Direction, Migration, Migrations, Repo, RepoOrder};
    pub use crate::reader::{read_dir, read_repos};
    pub use crate::store::{LogKey, LogStore, MemoryLogStore, MigrationLog, SqliteLogStore};
}
