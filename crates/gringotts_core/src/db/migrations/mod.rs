//! SQLite migration registry and executor.
//!
//! # Responsibility
//! - Hold an explicit, caller-supplied list of schema steps.
//! - Apply pending steps in ascending version order, one transaction each.
//!
//! # Invariants
//! - `version` values are unique and greater than zero.
//! - A step's SQL and its `migration` bookkeeping row commit together or not
//!   at all.
//! - The first step of any list must create the `migration` table.

use log::{error, info};
use rusqlite::{Connection, TransactionBehavior};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;

pub type MigrationResult<T> = Result<T, MigrationError>;

/// One versioned schema change.
///
/// `sql` may hold several statements; it runs through `execute_batch` and
/// must not manage transactions itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub sql: &'static str,
}

impl Migration {
    pub const fn new(version: u32, name: &'static str, sql: &'static str) -> Self {
        Self { version, name, sql }
    }
}

/// Row of the `migration` bookkeeping table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    pub migration_id: u32,
    /// SQLite `CURRENT_TIMESTAMP` text (`YYYY-MM-DD HH:MM:SS`, UTC).
    pub applied_at: Option<String>,
}

#[derive(Debug)]
pub enum MigrationError {
    /// The supplied step list is unusable (zero or duplicate versions).
    InvalidRegistry(String),
    /// The database has been migrated by a newer binary.
    UnsupportedSchemaVersion { db_version: u32, latest_supported: u32 },
    /// A step failed; its transaction was rolled back.
    StepFailed {
        version: u32,
        name: &'static str,
        source: rusqlite::Error,
    },
    Sqlite(rusqlite::Error),
}

impl Display for MigrationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidRegistry(message) => write!(f, "invalid migration registry: {message}"),
            Self::UnsupportedSchemaVersion {
                db_version,
                latest_supported,
            } => write!(
                f,
                "database schema version {db_version} is newer than supported {latest_supported}"
            ),
            Self::StepFailed {
                version,
                name,
                source,
            } => write!(f, "migration {version} ({name}) failed: {source}"),
            Self::Sqlite(err) => write!(f, "{err}"),
        }
    }
}

impl Error for MigrationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidRegistry(_) => None,
            Self::UnsupportedSchemaVersion { .. } => None,
            Self::StepFailed { source, .. } => Some(source),
            Self::Sqlite(err) => Some(err),
        }
    }
}

impl From<rusqlite::Error> for MigrationError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

const DEFAULT_MIGRATIONS: &[Migration] = &[
    Migration::new(1, "migration_bookkeeping", include_str!("0001_migration.sql")),
    Migration::new(2, "inventory", include_str!("0002_inventory.sql")),
];

/// Returns the built-in schema steps, ascending.
pub fn default_migrations() -> Vec<Migration> {
    DEFAULT_MIGRATIONS.to_vec()
}

/// Applies an ordered set of [`Migration`] steps to a connection.
#[derive(Debug, Clone)]
pub struct SchemaMigrator {
    migrations: Vec<Migration>,
}

impl SchemaMigrator {
    /// Builds a migrator over `migrations`, sorted ascending by version.
    ///
    /// # Errors
    /// - [`MigrationError::InvalidRegistry`] for version `0` or duplicates.
    pub fn new(mut migrations: Vec<Migration>) -> MigrationResult<Self> {
        let mut seen = BTreeSet::new();
        for migration in &migrations {
            if migration.version == 0 {
                return Err(MigrationError::InvalidRegistry(format!(
                    "migration `{}` uses reserved version 0",
                    migration.name
                )));
            }
            if !seen.insert(migration.version) {
                return Err(MigrationError::InvalidRegistry(format!(
                    "version {} is registered more than once",
                    migration.version
                )));
            }
        }

        migrations.sort_by_key(|migration| migration.version);
        Ok(Self { migrations })
    }

    /// Migrator over [`default_migrations`].
    pub fn with_default_migrations() -> Self {
        Self {
            migrations: default_migrations(),
        }
    }

    /// Registered steps, ascending.
    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Returns the latest version known by this migrator, `0` when empty.
    pub fn latest_version(&self) -> u32 {
        self.migrations
            .last()
            .map_or(0, |migration| migration.version)
    }

    /// Returns the highest applied version, or `None` when nothing has been
    /// applied yet, including a fresh database without a `migration` table.
    pub fn current_version(&self, conn: &Connection) -> MigrationResult<Option<u32>> {
        current_version(conn)
    }

    /// Applies every registered step above the current version.
    ///
    /// Returns the versions applied by this call, ascending. Steps already
    /// applied are skipped, so calling this again after success is a no-op.
    ///
    /// # Errors
    /// - [`MigrationError::UnsupportedSchemaVersion`] when the database is
    ///   ahead of this migrator.
    /// - [`MigrationError::StepFailed`] for the first failing step. Earlier
    ///   steps of the same call stay committed.
    pub fn apply_pending(&self, conn: &mut Connection) -> MigrationResult<Vec<u32>> {
        let started_at = Instant::now();
        let current = current_version(conn)?.unwrap_or(0);
        let latest = self.latest_version();

        if current > latest {
            error!(
                "event=db_migrate module=db status=error error_code=unsupported_schema db_version={current} latest={latest}"
            );
            return Err(MigrationError::UnsupportedSchemaVersion {
                db_version: current,
                latest_supported: latest,
            });
        }

        let mut applied = Vec::new();
        for migration in self
            .migrations
            .iter()
            .filter(|migration| migration.version > current)
        {
            if apply_step(conn, migration)? {
                applied.push(migration.version);
            }
        }

        info!(
            "event=db_migrate module=db status=ok from_version={current} to_version={} applied={} duration_ms={}",
            applied.last().copied().unwrap_or(current),
            applied.len(),
            started_at.elapsed().as_millis()
        );
        Ok(applied)
    }

    /// Lists bookkeeping rows in ascending version order.
    pub fn applied_migrations(&self, conn: &Connection) -> MigrationResult<Vec<MigrationRecord>> {
        if !bookkeeping_table_exists(conn)? {
            return Ok(Vec::new());
        }

        let mut stmt = conn.prepare(
            "SELECT migration_id, updated_at
             FROM migration
             ORDER BY migration_id ASC;",
        )?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(MigrationRecord {
                migration_id: row.get("migration_id")?,
                applied_at: row.get("updated_at")?,
            });
        }
        Ok(records)
    }
}

/// Returns whether the step was applied by this call.
fn apply_step(conn: &mut Connection, migration: &Migration) -> MigrationResult<bool> {
    let started_at = Instant::now();
    let step_failed = |source: rusqlite::Error| MigrationError::StepFailed {
        version: migration.version,
        name: migration.name,
        source,
    };

    let outcome = (|| -> MigrationResult<bool> {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(step_failed)?;

        // Another process may have applied it between our read and the lock.
        if current_version(&tx)?.is_some_and(|version| version >= migration.version) {
            return Ok(false);
        }

        tx.execute_batch(migration.sql).map_err(step_failed)?;
        tx.execute(
            "INSERT INTO migration (migration_id) VALUES (?1);",
            [migration.version],
        )
        .map_err(step_failed)?;
        tx.commit().map_err(step_failed)?;
        Ok(true)
    })();

    match &outcome {
        Ok(true) => info!(
            "event=db_migration_step module=db status=ok version={} name={} duration_ms={}",
            migration.version,
            migration.name,
            started_at.elapsed().as_millis()
        ),
        Ok(false) => info!(
            "event=db_migration_step module=db status=skipped version={} name={}",
            migration.version, migration.name
        ),
        Err(err) => error!(
            "event=db_migration_step module=db status=error version={} name={} duration_ms={} error={}",
            migration.version,
            migration.name,
            started_at.elapsed().as_millis(),
            err
        ),
    }

    outcome
}

fn current_version(conn: &Connection) -> MigrationResult<Option<u32>> {
    if !bookkeeping_table_exists(conn)? {
        return Ok(None);
    }

    let version = conn.query_row("SELECT MAX(migration_id) FROM migration;", [], |row| {
        row.get::<_, Option<u32>>(0)
    })?;
    Ok(version)
}

fn bookkeeping_table_exists(conn: &Connection) -> MigrationResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM sqlite_master
            WHERE type = 'table' AND name = 'migration'
        );",
        [],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}
