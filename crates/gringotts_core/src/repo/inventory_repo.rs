//! Item catalog / owner count repository and its SQLite implementation.
//!
//! # Responsibility
//! - Search, upsert and atomically replace catalog and count data.
//! - Honor the caller's [`CancelToken`] while waiting for and using storage.
//!
//! # Invariants
//! - `upsert_catalog` and `replace_owner_counts` are all-or-nothing.
//! - Caller strings only ever reach SQL as bound parameters.
//! - Search results are ordered by name (case-insensitive), then id.
//! - No transaction outlives the call that opened it.

use crate::cancel::{CancelToken, Interruption};
use crate::db::DbError;
use crate::model::item::{
    name_key, validate_item_id, validate_item_name, validate_owner, ItemId, ItemMatch,
    ValidationError,
};
use log::{error, info, warn};
use rusqlite::types::Value;
use rusqlite::{
    params, params_from_iter, Connection, ErrorCode, OptionalExtension, Transaction,
    TransactionBehavior,
};
use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

/// SQLite VM instructions between two cancellation checks.
const PROGRESS_CHECK_OPS: i32 = 1_000;
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(2);

/// Connection handle shared by every clone of a repository.
pub type SharedConnection = Arc<Mutex<Connection>>;

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository error for catalog and count operations.
#[derive(Debug)]
pub enum RepoError {
    Validation(ValidationError),
    /// A catalog write would break case-insensitive name uniqueness.
    ConstraintViolation {
        item_id: ItemId,
        name: String,
        conflicting_id: Option<ItemId>,
    },
    /// The caller's token fired; any open transaction was rolled back.
    Interrupted(Interruption),
    Db(DbError),
    MissingRequiredTable(&'static str),
    InvalidData(String),
    /// Another thread panicked while holding the shared connection.
    HandlePoisoned,
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::ConstraintViolation {
                item_id,
                name,
                conflicting_id: Some(other),
            } => write!(
                f,
                "item `{item_id}` cannot be named `{name}`: name already used by item `{other}`"
            ),
            Self::ConstraintViolation { item_id, name, .. } => {
                write!(f, "item `{item_id}` cannot be named `{name}`: name already in use")
            }
            Self::Interrupted(reason) => write!(f, "{reason}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::MissingRequiredTable(table) => {
                write!(f, "inventory repository requires table `{table}`")
            }
            Self::InvalidData(message) => write!(f, "invalid inventory data: {message}"),
            Self::HandlePoisoned => write!(f, "shared database handle is poisoned"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Interrupted(reason) => Some(reason),
            Self::Db(err) => Some(err),
            Self::ConstraintViolation { .. } => None,
            Self::MissingRequiredTable(_) => None,
            Self::InvalidData(_) => None,
            Self::HandlePoisoned => None,
        }
    }
}

impl From<ValidationError> for RepoError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<Interruption> for RepoError {
    fn from(value: Interruption) -> Self {
        Self::Interrupted(value)
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Substring search options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    /// Matched anywhere in the item name, ASCII case-insensitive (`NOCASE`),
    /// so non-ASCII letters must match exactly. `%` and `_` match literally.
    /// An empty pattern matches every item.
    pub pattern: String,
    /// Maximum number of matches to return.
    pub limit: Option<u32>,
}

impl SearchQuery {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Repository interface for the item catalog and owner counts.
pub trait InventoryRepository {
    /// Finds items whose name contains the pattern, with summed counts.
    fn search_items(&self, query: &SearchQuery, cancel: &CancelToken)
        -> RepoResult<Vec<ItemMatch>>;
    /// Inserts or renames every entry in one transaction.
    fn upsert_catalog(
        &self,
        entries: &BTreeMap<ItemId, String>,
        cancel: &CancelToken,
    ) -> RepoResult<()>;
    /// Replaces all of `owner`'s counts with `counts` in one transaction.
    fn replace_owner_counts(
        &self,
        owner: &str,
        counts: &BTreeMap<ItemId, u32>,
        cancel: &CancelToken,
    ) -> RepoResult<()>;
    /// Gets one owner's count for one item.
    fn get_count(&self, owner: &str, item_id: &str, cancel: &CancelToken)
        -> RepoResult<Option<u32>>;
    /// Gets the catalog name of one item.
    fn get_name(&self, item_id: &str, cancel: &CancelToken) -> RepoResult<Option<String>>;
    /// Returns every count currently recorded for `owner`.
    fn list_owner_counts(
        &self,
        owner: &str,
        cancel: &CancelToken,
    ) -> RepoResult<BTreeMap<ItemId, u32>>;
}

/// SQLite-backed inventory repository over a shared connection.
#[derive(Debug, Clone)]
pub struct SqliteInventoryRepository {
    conn: SharedConnection,
    busy_timeout: Duration,
}

impl SqliteInventoryRepository {
    /// Wraps a migrated connection.
    ///
    /// The connection's current `busy_timeout` is the lock wait restored
    /// after every call.
    ///
    /// # Errors
    /// - [`RepoError::MissingRequiredTable`] when migrations have not run.
    pub fn try_new(conn: Connection) -> RepoResult<Self> {
        ensure_inventory_tables(&conn)?;
        let busy_timeout = read_busy_timeout(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            busy_timeout,
        })
    }

    /// Wraps a connection that is already shared with other components.
    pub fn from_shared(conn: SharedConnection) -> RepoResult<Self> {
        let busy_timeout = {
            let guard = conn.lock().map_err(|_| RepoError::HandlePoisoned)?;
            ensure_inventory_tables(&guard)?;
            let busy_timeout = read_busy_timeout(&guard)?;
            busy_timeout
        };
        Ok(Self { conn, busy_timeout })
    }

    pub fn shared_connection(&self) -> SharedConnection {
        Arc::clone(&self.conn)
    }

    fn acquire(&self, cancel: &CancelToken) -> RepoResult<MutexGuard<'_, Connection>> {
        loop {
            cancel.check()?;
            match self.conn.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::WouldBlock) => std::thread::sleep(LOCK_RETRY_INTERVAL),
                Err(TryLockError::Poisoned(_)) => return Err(RepoError::HandlePoisoned),
            }
        }
    }

    fn read<T>(
        &self,
        cancel: &CancelToken,
        body: impl FnOnce(&Connection) -> RepoResult<T>,
    ) -> RepoResult<T> {
        let guard = self.acquire(cancel)?;
        let conn: &Connection = &guard;
        let outcome = {
            let _watch = InterruptWatch::arm(conn, cancel, self.busy_timeout)?;
            body(conn)
        };
        outcome.map_err(|err| settle(err, cancel))
    }

    fn write<T>(
        &self,
        cancel: &CancelToken,
        body: impl FnOnce(&Transaction<'_>) -> RepoResult<T>,
    ) -> RepoResult<T> {
        let guard = self.acquire(cancel)?;
        let conn: &Connection = &guard;

        let watch = InterruptWatch::arm(conn, cancel, self.busy_timeout)?;
        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
            .map_err(|err| settle(err.into(), cancel))?;
        let outcome = body(&tx).and_then(|value| {
            cancel.check()?;
            Ok(value)
        });
        // Commit and rollback must not be cut short by the progress handler.
        drop(watch);

        match outcome {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                // An interrupted write may already have been rolled back by SQLite.
                if !conn.is_autocommit() {
                    if let Err(rollback_err) = tx.rollback() {
                        error!(
                            "event=repo_rollback module=repo status=error error={}",
                            rollback_err
                        );
                    }
                }
                Err(settle(err, cancel))
            }
        }
    }
}

impl InventoryRepository for SqliteInventoryRepository {
    fn search_items(
        &self,
        query: &SearchQuery,
        cancel: &CancelToken,
    ) -> RepoResult<Vec<ItemMatch>> {
        if query.limit == Some(0) {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            "SELECT
                item.id AS id,
                item.name AS name,
                COALESCE(SUM(item_count.item_count), 0) AS total_count
             FROM item
             LEFT JOIN item_count ON item_count.item_id = item.id
             WHERE item.name LIKE '%' || ? || '%' ESCAPE '\\'
             GROUP BY item.id, item.name
             ORDER BY item.name COLLATE NOCASE ASC, item.id ASC",
        );
        let mut bind_values = vec![Value::Text(escape_like_pattern(&query.pattern))];
        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            bind_values.push(Value::Integer(i64::from(limit)));
        }

        self.read(cancel, |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(bind_values))?;
            let mut matches = Vec::new();
            while let Some(row) = rows.next()? {
                let id: String = row.get("id")?;
                let total: i64 = row.get("total_count")?;
                let total_count = u64::try_from(total).map_err(|_| {
                    RepoError::InvalidData(format!("negative total count {total} for item `{id}`"))
                })?;
                matches.push(ItemMatch {
                    name: row.get("name")?,
                    id,
                    total_count,
                });
            }
            Ok(matches)
        })
    }

    fn upsert_catalog(
        &self,
        entries: &BTreeMap<ItemId, String>,
        cancel: &CancelToken,
    ) -> RepoResult<()> {
        let started_at = Instant::now();
        let mut claimed: HashMap<String, &str> = HashMap::with_capacity(entries.len());
        for (item_id, name) in entries {
            validate_item_id(item_id)?;
            validate_item_name(item_id, name)?;
            if let Some(other) = claimed.insert(name_key(name), item_id.as_str()) {
                return Err(RepoError::ConstraintViolation {
                    item_id: item_id.clone(),
                    name: name.clone(),
                    conflicting_id: Some(other.to_string()),
                });
            }
        }

        let outcome = self.write(cancel, |tx| {
            let mut stmt = tx.prepare(
                "INSERT INTO item (id, name) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name;",
            )?;
            for (item_id, name) in entries {
                cancel.check()?;
                if let Err(err) = stmt.execute(params![item_id, name]) {
                    if !is_unique_violation(&err) {
                        return Err(err.into());
                    }
                    return Err(RepoError::ConstraintViolation {
                        item_id: item_id.clone(),
                        name: name.clone(),
                        conflicting_id: find_name_owner(tx, name, item_id)?,
                    });
                }
            }
            Ok(())
        });

        match &outcome {
            Ok(()) => info!(
                "event=catalog_upsert module=repo status=ok entries={} duration_ms={}",
                entries.len(),
                started_at.elapsed().as_millis()
            ),
            Err(err) => warn!(
                "event=catalog_upsert module=repo status=error entries={} duration_ms={} error={}",
                entries.len(),
                started_at.elapsed().as_millis(),
                err
            ),
        }
        outcome
    }

    fn replace_owner_counts(
        &self,
        owner: &str,
        counts: &BTreeMap<ItemId, u32>,
        cancel: &CancelToken,
    ) -> RepoResult<()> {
        let started_at = Instant::now();
        validate_owner(owner)?;
        for item_id in counts.keys() {
            validate_item_id(item_id)?;
        }

        let outcome = self.write(cancel, |tx| {
            let removed = tx.execute("DELETE FROM item_count WHERE owner = ?1;", [owner])?;
            let mut stmt = tx.prepare(
                "INSERT INTO item_count (owner, item_id, item_count) VALUES (?1, ?2, ?3);",
            )?;
            for (item_id, count) in counts {
                cancel.check()?;
                stmt.execute(params![owner, item_id, count])?;
            }
            Ok(removed)
        });

        match &outcome {
            Ok(removed) => info!(
                "event=counts_replace module=repo status=ok removed={} inserted={} duration_ms={}",
                removed,
                counts.len(),
                started_at.elapsed().as_millis()
            ),
            Err(err) => warn!(
                "event=counts_replace module=repo status=error rows={} duration_ms={} error={}",
                counts.len(),
                started_at.elapsed().as_millis(),
                err
            ),
        }
        outcome.map(|_| ())
    }

    fn get_count(
        &self,
        owner: &str,
        item_id: &str,
        cancel: &CancelToken,
    ) -> RepoResult<Option<u32>> {
        self.read(cancel, |conn| {
            let count = conn
                .query_row(
                    "SELECT item_count
                     FROM item_count
                     WHERE owner = ?1 AND item_id = ?2;",
                    [owner, item_id],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            count.map(|value| count_from_db(item_id, value)).transpose()
        })
    }

    fn get_name(&self, item_id: &str, cancel: &CancelToken) -> RepoResult<Option<String>> {
        self.read(cancel, |conn| {
            let name = conn
                .query_row("SELECT name FROM item WHERE id = ?1;", [item_id], |row| {
                    row.get::<_, Option<String>>(0)
                })
                .optional()?;
            match name {
                Some(Some(name)) => Ok(Some(name)),
                Some(None) => Err(RepoError::InvalidData(format!(
                    "item `{item_id}` has a NULL name"
                ))),
                None => Ok(None),
            }
        })
    }

    fn list_owner_counts(
        &self,
        owner: &str,
        cancel: &CancelToken,
    ) -> RepoResult<BTreeMap<ItemId, u32>> {
        self.read(cancel, |conn| {
            let mut stmt = conn.prepare(
                "SELECT item_id, item_count
                 FROM item_count
                 WHERE owner = ?1
                 ORDER BY item_id ASC;",
            )?;
            let mut rows = stmt.query([owner])?;
            let mut counts = BTreeMap::new();
            while let Some(row) = rows.next()? {
                let item_id: String = row.get("item_id")?;
                let count = count_from_db(&item_id, row.get("item_count")?)?;
                counts.insert(item_id, count);
            }
            Ok(counts)
        })
    }
}

/// Aborts running statements once the caller's token fires, and caps lock
/// waits at the token's remaining time. Restores both on drop.
struct InterruptWatch<'conn> {
    conn: &'conn Connection,
    busy_timeout: Duration,
}

impl<'conn> InterruptWatch<'conn> {
    fn arm(
        conn: &'conn Connection,
        cancel: &CancelToken,
        busy_timeout: Duration,
    ) -> RepoResult<Self> {
        if let Some(deadline) = cancel.deadline() {
            // SQLite waits in whole milliseconds; round up so a lock timeout
            // is only reported once the deadline has really passed.
            let remaining = deadline.saturating_duration_since(Instant::now());
            let remaining_ms = u64::try_from(remaining.as_millis())
                .unwrap_or(u64::MAX)
                .saturating_add(1);
            conn.busy_timeout(Duration::from_millis(remaining_ms).min(busy_timeout))?;
        }

        let token = cancel.clone();
        conn.progress_handler(PROGRESS_CHECK_OPS, Some(move || token.is_fired()));
        Ok(Self { conn, busy_timeout })
    }
}

impl Drop for InterruptWatch<'_> {
    fn drop(&mut self) {
        self.conn.progress_handler(0, None::<fn() -> bool>);
        if let Err(err) = self.conn.busy_timeout(self.busy_timeout) {
            error!("event=repo_busy_timeout_restore module=repo status=error error={err}");
        }
    }
}

/// Turns an engine interrupt or lock timeout into the token's reason once the
/// token has fired.
fn settle(err: RepoError, cancel: &CancelToken) -> RepoError {
    let Some(reason) = cancel.interruption() else {
        return err;
    };
    let stopped_by_engine = matches!(
        &err,
        RepoError::Db(DbError::Sqlite(rusqlite::Error::SqliteFailure(failure, _)))
            if matches!(
                failure.code,
                ErrorCode::OperationInterrupted | ErrorCode::DatabaseBusy
            )
    );
    if stopped_by_engine {
        RepoError::Interrupted(reason)
    } else {
        err
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation
                && failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn find_name_owner(conn: &Connection, name: &str, item_id: &str) -> RepoResult<Option<ItemId>> {
    let owner = conn
        .query_row(
            "SELECT id FROM item WHERE name = ?1 AND id <> ?2 LIMIT 1;",
            [name, item_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(owner)
}

fn count_from_db(item_id: &str, value: i64) -> RepoResult<u32> {
    u32::try_from(value).map_err(|_| {
        RepoError::InvalidData(format!(
            "count {value} for item `{item_id}` is outside 0..={}",
            u32::MAX
        ))
    })
}

/// Escapes LIKE wildcards so the pattern matches literally.
pub fn escape_like_pattern(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn read_busy_timeout(conn: &Connection) -> RepoResult<Duration> {
    let millis: i64 = conn.query_row("PRAGMA busy_timeout;", [], |row| row.get(0))?;
    Ok(Duration::from_millis(u64::try_from(millis).unwrap_or(0)))
}

fn ensure_inventory_tables(conn: &Connection) -> RepoResult<()> {
    for table in ["item", "item_count"] {
        if !table_exists(conn, table)? {
            return Err(RepoError::MissingRequiredTable(table));
        }
    }
    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> RepoResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM sqlite_master
            WHERE type = 'table' AND name = ?1
        );",
        [table],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}
