//! dbmigrat CLI
//!
//! Command-line tool for applying SQL migrations stored as
//! `<migrations-dir>/<repo>/<index>.<description>.<up|down>.sql`.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::bail;
use clap::{Parser, Subcommand};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use dbmigrat::prelude::*;

/// Transactional SQL migrations organized in independent repos.
#[derive(Parser)]
#[command(name = "dbmigrat")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database URL (SQLite path or connection string).
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:db.sqlite3")]
    database: String,

    /// Migrations directory, one subdirectory per repo.
    #[arg(short, long, default_value = "migrations")]
    migrations_dir: PathBuf,

    /// Repo order, comma separated (sorted repo directories if not specified).
    #[arg(short, long, value_delimiter = ',')]
    repos: Vec<String>,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the migration log table.
    Init,

    /// Apply pending migrations.
    Migrate {
        /// Print the scripts without executing them.
        #[arg(long)]
        dry_run: bool,
    },

    /// Reverse migrations, repos in reverse order.
    Rollback {
        /// Reverse every run after this serial (only the last run if not specified).
        #[arg(short, long, allow_hyphen_values = true)]
        to_serial: Option<i64>,

        /// Print the scripts without executing them.
        #[arg(long)]
        dry_run: bool,
    },

    /// Show applied and pending migrations.
    Status,

    /// Compare the log against the migration files.
    Check {
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
}

fn repo_order(cli: &Cli, migrations: &Migrations) -> RepoOrder {
    if cli.repos.is_empty() {
        migrations.keys().cloned().collect()
    } else {
        RepoOrder::new(cli.repos.iter().map(String::as_str))
    }
}

fn print_scripts(store: &MemoryLogStore) {
    for sql in store.executed() {
        println!("{};", sql.trim_end().trim_end_matches(';'));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Connect to database
    let options = SqliteConnectOptions::from_str(&cli.database)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    let mut executor = MigrationExecutor::new(SqliteLogStore::new(pool));

    match &cli.command {
        Commands::Init => {
            info!("Initializing migration log...");
            executor.init().await?;
            info!("Migration log table created successfully.");
        }

        Commands::Migrate { dry_run } => {
            let migrations = read_repos(&cli.migrations_dir)?;
            let order = repo_order(&cli, &migrations);

            if *dry_run {
                info!("Dry run mode - SQL will be printed but not executed.");
                let mut preview = executor.preview().await?;
                let applied = preview.migrate(&migrations, &order).await?;
                print_scripts(preview.store());
                info!("{} migration(s) would be applied.", applied);
            } else {
                executor.init().await?;
                let applied = executor.migrate(&migrations, &order).await?;
                info!("{} migration(s) applied.", applied);
            }
        }

        Commands::Rollback { to_serial, dry_run } => {
            let migrations = read_repos(&cli.migrations_dir)?;
            let order = repo_order(&cli, &migrations).reversed();

            if *dry_run {
                info!("Dry run mode - SQL will be printed but not executed.");
                let mut preview = executor.preview().await?;
                let reversed = match to_serial {
                    Some(serial) => preview.rollback(&migrations, &order, *serial).await?,
                    None => preview.rollback_last(&migrations, &order).await?,
                };
                print_scripts(preview.store());
                info!("{} migration(s) would be rolled back.", reversed);
            } else {
                let result = match to_serial {
                    Some(serial) => executor.rollback(&migrations, &order, *serial).await,
                    None => executor.rollback_last(&migrations, &order).await,
                };
                match result {
                    Ok(reversed) => info!("{} migration(s) rolled back.", reversed),
                    Err(err) if err.is_out_of_sync() => {
                        bail!("{err}\nRun `dbmigrat check` to inspect the log.")
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }

        Commands::Status => {
            let migrations = read_repos(&cli.migrations_dir)?;
            let order = repo_order(&cli, &migrations);
            executor.init().await?;

            let applied = executor.applied().await?;
            if applied.is_empty() {
                info!("No migrations have been applied yet.");
            } else {
                println!("\nApplied migrations:");
                println!("{:-<60}", "");
                for log in &applied {
                    println!(
                        " [X] {}/{} {} (serial {}, {})",
                        log.repo,
                        log.idx,
                        log.description,
                        log.migration_serial,
                        log.applied_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }

            let pending = executor.pending(&migrations, &order).await?;
            if !pending.is_empty() {
                println!("\nPending migrations:");
                println!("{:-<60}", "");
                for migration in &pending {
                    println!(
                        " [ ] {}/{} {}",
                        migration.repo, migration.index, migration.description
                    );
                }
            }
            println!();
        }

        Commands::Check { json } => {
            let migrations = read_repos(&cli.migrations_dir)?;
            executor.init().await?;
            let report = executor.check_log_table_integrity(&migrations).await?;

            if *json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for repo in &report.redundant_repos {
                    println!("Redundant repo: {repo}");
                }
                for logs in report.redundant_migrations.values() {
                    for log in logs {
                        println!("Redundant migration: {}/{} {}", log.repo, log.idx, log.description);
                    }
                }
                for logs in report.invalid_checksums.values() {
                    for log in logs {
                        println!("Invalid checksum: {}/{} {}", log.repo, log.idx, log.description);
                    }
                }
            }

            if report.corrupted {
                bail!("Migration log does not match the migration files.");
            }
            info!("Migration log matches the migration files.");
        }
    }

    Ok(())
}
