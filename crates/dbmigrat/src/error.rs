//! Error types for the migration system.

use std::path::PathBuf;

use crate::migration::{Direction, Repo};

/// Errors that can occur during migration operations.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// Beginning, committing or rolling back the transaction failed.
    #[error("Failed to {action} transaction: {source}")]
    Transaction {
        /// Lifecycle step that failed (`begin`, `commit` or `rollback`).
        action: &'static str,
        /// Underlying store error.
        #[source]
        source: Box<MigrateError>,
    },

    /// An up or down script was rejected by the database.
    #[error("Migration {repo}/{index} ({direction}) failed: {source}")]
    Script {
        /// Repo the migration belongs to.
        repo: Repo,
        /// Position of the migration inside its repo.
        index: usize,
        /// Which script was running.
        direction: Direction,
        /// Underlying store error.
        #[source]
        source: Box<MigrateError>,
    },

    /// The log references a migration the supplied definitions don't have.
    #[error(
        "Migration {repo}/{index} is in the log but not in the supplied migrations; \
         run an integrity check"
    )]
    OutOfSync {
        /// Repo named by the log row.
        repo: Repo,
        /// Index named by the log row.
        index: i64,
    },

    /// A migration has no down script.
    #[error("Migration {repo}/{index} is not reversible")]
    NotReversible {
        /// Repo the migration belongs to.
        repo: Repo,
        /// Position of the migration inside its repo.
        index: usize,
    },

    /// Database error during migration execution.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Error reported by a non-SQL log store.
    #[error("Store error: {0}")]
    Store(String),

    /// IO error (reading migration files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A migration file name or directory layout is invalid.
    #[error("Invalid migration file '{path}': {message}")]
    InvalidMigrationFile {
        /// Path to the offending file.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// No migrations directory found.
    #[error("Migrations directory not found: {0}")]
    MigrationsDirNotFound(PathBuf),

    /// Invalid store state, such as committing without a transaction.
    #[error("Invalid migration state: {0}")]
    InvalidState(String),

    /// Multiple errors occurred.
    #[error("Multiple errors occurred:\n{}", .0.iter().map(|e| format!("  - {}", e)).collect::<Vec<_>>().join("\n"))]
    Multiple(Vec<MigrateError>),
}

impl MigrateError {
    pub(crate) fn transaction(action: &'static str, source: Self) -> Self {
        Self::Transaction {
            action,
            source: Box::new(source),
        }
    }

    /// Returns whether this error, or one it combines, is [`MigrateError::OutOfSync`].
    #[must_use]
    pub fn is_out_of_sync(&self) -> bool {
        match self {
            Self::OutOfSync { .. } => true,
            Self::Multiple(errors) => errors.iter().any(Self::is_out_of_sync),
            _ => false,
        }
    }
}

/// Result type for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
