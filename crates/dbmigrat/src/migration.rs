//! Migration definitions supplied by the caller.
//!
//! Migrations are grouped into [`Repo`]s. Inside a repo, a migration's
//! position is its identity: the log records `(index, repo)`, never the
//! script text.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use sha1::{Digest, Sha1};

/// Name of an independently ordered migration sequence.
///
/// An e-commerce app might keep authentication migrations in repo `auth`
/// and warehouse migrations in repo `warehouse`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Repo(String);

impl Repo {
    /// Creates a repo name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the repo name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Repo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Repo {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for Repo {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// One schema change: a forward script and an optional reverse script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// Human-readable description, copied into the log.
    pub description: String,
    /// Forward script.
    pub up: String,
    /// Reverse script.
    pub down: Option<String>,
}

impl Migration {
    /// Creates an irreversible migration.
    #[must_use]
    pub fn new(description: impl Into<String>, up: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            up: up.into(),
            down: None,
        }
    }

    /// Sets the reverse script.
    #[must_use]
    pub fn down(mut self, down: impl Into<String>) -> Self {
        self.down = Some(down.into());
        self
    }

    /// Returns the fingerprint of the up script.
    #[must_use]
    pub fn checksum(&self) -> String {
        checksum(&self.up)
    }
}

/// Ordered migrations of every repo.
pub type Migrations = BTreeMap<Repo, Vec<Migration>>;

/// Order in which repos are visited.
///
/// Only repos present both here and in [`Migrations`] are processed. For
/// rollback the caller passes the reverse of the apply order, typically
/// via [`RepoOrder::reversed`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoOrder(Vec<Repo>);

impl RepoOrder {
    /// Creates an order from repos.
    pub fn new(repos: impl IntoIterator<Item = impl Into<Repo>>) -> Self {
        Self(repos.into_iter().map(Into::into).collect())
    }

    /// Returns the same repos in the opposite order.
    #[must_use]
    pub fn reversed(&self) -> Self {
        Self(self.0.iter().rev().cloned().collect())
    }

    /// Iterates over the repos in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Repo> {
        self.0.iter()
    }

    /// Returns the number of repos.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns whether the order is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a RepoOrder {
    type Item = &'a Repo;
    type IntoIter = std::slice::Iter<'a, Repo>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<Repo> for RepoOrder {
    fn from_iter<I: IntoIterator<Item = Repo>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Which script of a migration runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Forward script.
    Up,
    /// Reverse script.
    Down,
}

impl Direction {
    /// Returns the lowercase name used in file names.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hex-encoded SHA-1 of a script.
#[must_use]
pub fn checksum(script: &str) -> String {
    format!("{:x}", Sha1::digest(script.as_bytes()))
}
