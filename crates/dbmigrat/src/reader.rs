//! Loading migrations from SQL files.
//!
//! A repo directory holds one file per script, named
//! `<index>.<description>.<up|down>` with an optional trailing extension
//! such as `.sql`:
//!
//! ```text
//! auth/
//!   0.create_users.up.sql
//!   0.create_users.down.sql
//!   1.add_email.up.sql
//!   1.add_email.down.sql
//! ```
//!
//! Indexes start at 0 and are contiguous. Each index has exactly one up
//! and one down file with the same description.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{MigrateError, Result};
use crate::migration::{Direction, Migration, Migrations, Repo};

#[derive(Debug)]
struct ScriptFile {
    path: PathBuf,
    index: usize,
    description: String,
    direction: Direction,
}

fn invalid(path: &Path, message: &str) -> MigrateError {
    MigrateError::InvalidMigrationFile {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}

fn parse_file_name(path: &Path) -> Result<ScriptFile> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| invalid(path, "file name is not valid UTF-8"))?;

    let parts: Vec<&str> = file_name.split('.').collect();
    if parts.len() < 3 {
        return Err(invalid(
            path,
            "file name must have at least 3 parts (index.description.direction)",
        ));
    }
    let index = parts[0]
        .parse()
        .map_err(|_| invalid(path, "first part of the file name must be an index"))?;
    let direction = match parts[2] {
        "up" => Direction::Up,
        "down" => Direction::Down,
        _ => {
            return Err(invalid(
                path,
                "third part of the file name must be \"up\" or \"down\"",
            ))
        }
    };

    Ok(ScriptFile {
        path: path.to_path_buf(),
        index,
        description: parts[1].to_string(),
        direction,
    })
}

/// Reads the migrations of one repo directory, ordered by index.
pub fn read_dir(path: impl AsRef<Path>) -> Result<Vec<Migration>> {
    let path = path.as_ref();
    if !path.is_dir() {
        return Err(MigrateError::MigrationsDirNotFound(path.to_path_buf()));
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            return Err(invalid(
                &entry.path(),
                "migration directories must contain files only",
            ));
        }
        files.push(parse_file_name(&entry.path())?);
    }
    files.sort_by(|a, b| (a.index, a.direction.as_str()).cmp(&(b.index, b.direction.as_str())));

    let mut migrations = Vec::with_capacity(files.len() / 2);
    for (expected, pair) in files.chunks(2).enumerate() {
        let [first, second] = pair else {
            return Err(invalid(&pair[0].path, "migration must have up and down files"));
        };
        if first.index != expected || second.index != expected {
            return Err(invalid(&first.path, "index in file name is not sequential"));
        }
        if first.direction == second.direction {
            return Err(invalid(&first.path, "migration must have up and down files"));
        }
        if first.description != second.description {
            return Err(invalid(
                &first.path,
                "up and down files have different descriptions",
            ));
        }

        // "down" sorts before "up"
        let (down, up) = (first, second);
        migrations.push(
            Migration::new(up.description.clone(), fs::read_to_string(&up.path)?)
                .down(fs::read_to_string(&down.path)?),
        );
    }

    debug!(path = %path.display(), count = migrations.len(), "Read migrations");
    Ok(migrations)
}

/// Reads every subdirectory of `root` as a repo named after the directory.
///
/// Plain files directly under `root` are ignored.
pub fn read_repos(root: impl AsRef<Path>) -> Result<Migrations> {
    let root = root.as_ref();
    if !root.is_dir() {
        return Err(MigrateError::MigrationsDirNotFound(root.to_path_buf()));
    }

    let mut migrations = Migrations::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry
            .file_name()
            .into_string()
            .map_err(|_| invalid(&entry.path(), "repo directory name is not valid UTF-8"))?;
        migrations.insert(Repo::from(name), read_dir(entry.path())?);
    }
    Ok(migrations)
}
