//! SQLite storage bootstrap and schema migration entry points.
//!
//! # Responsibility
//! - Open and verify SQLite connections for the Gringotts core.
//! - Apply schema migrations in deterministic order.
//!
//! # Invariants
//! - Migration version is tracked in the `migration` bookkeeping table.
//! - Core code must not read/write inventory data before migrations succeed.
//! - `foreign_keys` stays OFF: item counts may be loaded before the catalog
//!   entries they reference.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;

pub mod migrations;
mod open;

pub use migrations::{MigrationError, MigrationResult};
pub use open::{
    open_db, open_db_in_memory, open_db_with, open_existing_db_with, ConnectOptions,
    DEFAULT_BUSY_TIMEOUT, DEFAULT_LIVENESS_TIMEOUT,
};

use migrations::SchemaMigrator;
use rusqlite::Connection;

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    /// Storage handle could not be opened or failed its liveness check.
    Connectivity {
        target: String,
        source: rusqlite::Error,
    },
    Migration(MigrationError),
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::Connectivity { target, source } => {
                write!(f, "cannot connect to database `{target}`: {source}")
            }
            Self::Migration(err) => write!(f, "{err}"),
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::Connectivity { source, .. } => Some(source),
            Self::Migration(err) => Some(err),
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<MigrationError> for DbError {
    fn from(value: MigrationError) -> Self {
        Self::Migration(value)
    }
}

/// Opens a database file and brings its schema up to date with the built-in
/// migrations.
///
/// Equivalent to [`open_db`] followed by
/// [`SchemaMigrator::apply_pending`] on the default step list.
pub fn bootstrap_db(path: impl AsRef<Path>) -> DbResult<Connection> {
    bootstrap_db_with(path, &ConnectOptions::default())
}

/// Same as [`bootstrap_db`] with explicit connection options.
pub fn bootstrap_db_with(path: impl AsRef<Path>, options: &ConnectOptions) -> DbResult<Connection> {
    let mut conn = open_db_with(path, options)?;
    SchemaMigrator::with_default_migrations().apply_pending(&mut conn)?;
    Ok(conn)
}

/// In-memory variant of [`bootstrap_db`], mostly useful for tests.
pub fn bootstrap_db_in_memory() -> DbResult<Connection> {
    let mut conn = open_db_in_memory()?;
    SchemaMigrator::with_default_migrations().apply_pending(&mut conn)?;
    Ok(conn)
}
