//! Connection bootstrap utilities for SQLite.
//!
//! # Responsibility
//! - Open file or in-memory SQLite connections.
//! - Configure connection pragmas required by core behavior.
//! - Verify the handle is usable under a bounded liveness deadline.
//!
//! # Invariants
//! - Returned connections have `foreign_keys=OFF`; counts may name items the
//!   catalog does not hold yet.
//! - Returned connections passed a schema read within the liveness timeout.
//! - Returned connections have `busy_timeout` set to the configured value.
//! - Opening never applies migrations; see [`super::bootstrap_db`].

use super::{DbError, DbResult};
use log::{error, info};
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::time::{Duration, Instant};

/// Upper bound for the liveness check performed right after opening.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(1);
/// Lock wait applied to every statement once the handle is verified.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const MEMORY_TARGET: &str = ":memory:";

/// Tunables for [`open_db_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    pub liveness_timeout: Duration,
    pub busy_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

/// Opens a SQLite database file and verifies it is reachable.
///
/// # Side effects
/// - Creates the file when it does not exist yet.
/// - Emits `db_open` logging events with duration and status.
///
/// # Errors
/// - [`DbError::Connectivity`] when the file cannot be opened, is not a
///   database, or stays locked past the liveness timeout.
pub fn open_db(path: impl AsRef<Path>) -> DbResult<Connection> {
    open_db_with(path, &ConnectOptions::default())
}

/// Opens a SQLite database file with explicit timeouts.
pub fn open_db_with(path: impl AsRef<Path>, options: &ConnectOptions) -> DbResult<Connection> {
    let target = path.as_ref().display().to_string();
    connect("file", &target, options, || Connection::open(path.as_ref()))
}

/// Opens a database file that must already exist.
///
/// # Errors
/// - [`DbError::Connectivity`] when the file is missing; nothing is created.
pub fn open_existing_db_with(
    path: impl AsRef<Path>,
    options: &ConnectOptions,
) -> DbResult<Connection> {
    let target = path.as_ref().display().to_string();
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    connect("existing_file", &target, options, || {
        Connection::open_with_flags(path.as_ref(), flags)
    })
}

/// Opens a private in-memory database and verifies it is reachable.
pub fn open_db_in_memory() -> DbResult<Connection> {
    connect(
        "memory",
        MEMORY_TARGET,
        &ConnectOptions::default(),
        Connection::open_in_memory,
    )
}

fn connect(
    mode: &str,
    target: &str,
    options: &ConnectOptions,
    open: impl FnOnce() -> rusqlite::Result<Connection>,
) -> DbResult<Connection> {
    let started_at = Instant::now();
    info!("event=db_open module=db status=start mode={mode}");

    let conn = match open() {
        Ok(conn) => conn,
        Err(err) => {
            error!(
                "event=db_open module=db status=error mode={mode} duration_ms={} error_code=db_open_failed error={}",
                started_at.elapsed().as_millis(),
                err
            );
            return Err(connectivity(target, err));
        }
    };

    match configure_connection(&conn).and_then(|()| verify_liveness(&conn, options)) {
        Ok(()) => {
            info!(
                "event=db_open module=db status=ok mode={mode} duration_ms={}",
                started_at.elapsed().as_millis()
            );
            Ok(conn)
        }
        Err(err) => {
            error!(
                "event=db_open module=db status=error mode={mode} duration_ms={} error_code=db_liveness_failed error={}",
                started_at.elapsed().as_millis(),
                err
            );
            Err(connectivity(target, err))
        }
    }
}

// The bundled SQLite build turns foreign keys on by default.
fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = OFF;")
}

// Reading sqlite_master touches the file header, so a foreign file or a lock
// held by another process surfaces here instead of on first use.
fn verify_liveness(conn: &Connection, options: &ConnectOptions) -> rusqlite::Result<()> {
    conn.busy_timeout(options.liveness_timeout)?;
    conn.query_row("SELECT COUNT(*) FROM sqlite_master;", [], |row| {
        row.get::<_, i64>(0)
    })?;
    conn.busy_timeout(options.busy_timeout)?;
    Ok(())
}

fn connectivity(target: &str, source: rusqlite::Error) -> DbError {
    DbError::Connectivity {
        target: target.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        open_db, open_db_in_memory, open_db_with, open_existing_db_with, ConnectOptions,
    };
    use crate::db::DbError;
    use rusqlite::Connection;
    use std::time::Duration;

    fn foreign_keys_enabled(conn: &Connection) -> bool {
        let enabled: i64 = conn
            .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
            .unwrap();
        enabled == 1
    }

    #[test]
    fn handles_keep_foreign_keys_off() {
        let dir = tempfile::tempdir().unwrap();
        let file = open_db(dir.path().join("inventory.db")).unwrap();
        let memory = open_db_in_memory().unwrap();

        assert!(!foreign_keys_enabled(&file));
        assert!(!foreign_keys_enabled(&memory));
    }

    #[test]
    fn open_existing_does_not_create_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.db");

        let err = open_existing_db_with(&path, &ConnectOptions::default()).unwrap_err();
        assert!(matches!(err, DbError::Connectivity { .. }), "{err}");
        assert!(!path.exists());

        drop(open_db(&path).unwrap());
        let conn = open_existing_db_with(&path, &ConnectOptions::default()).unwrap();
        assert!(!foreign_keys_enabled(&conn));
    }

    #[test]
    fn in_memory_handle_is_live() {
        let conn = open_db_in_memory().unwrap();
        let one: i64 = conn.query_row("SELECT 1;", [], |row| row.get(0)).unwrap();
        assert_eq!(one, 1);
    }

    #[test]
    fn foreign_file_fails_liveness_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.db");
        std::fs::write(&path, vec![0x42_u8; 4096]).unwrap();

        let err = open_db(&path).unwrap_err();
        assert!(matches!(err, DbError::Connectivity { .. }), "{err}");
    }

    #[test]
    fn missing_parent_directory_is_a_connectivity_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no-such-dir").join("inventory.db");

        let options = ConnectOptions {
            liveness_timeout: Duration::from_millis(50),
            ..ConnectOptions::default()
        };
        let err = open_db_with(&path, &options).unwrap_err();
        match err {
            DbError::Connectivity { target, .. } => assert!(target.contains("no-such-dir")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
