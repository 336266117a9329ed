use gringotts_core::db::{bootstrap_db, bootstrap_db_in_memory};
use gringotts_core::{
    CancelToken, InventoryRepository, Interruption, RepoError, SearchQuery,
    SqliteInventoryRepository,
};
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

fn snapshot() -> BTreeMap<String, u32> {
    [("1".to_string(), 10), ("2".to_string(), 20)]
        .into_iter()
        .collect()
}

#[test]
fn cancelled_token_stops_every_operation_before_storage() {
    let repo = SqliteInventoryRepository::try_new(bootstrap_db_in_memory().unwrap()).unwrap();
    let cancel = CancelToken::none();
    cancel.cancel();

    let results = [
        repo.search_items(&SearchQuery::new("x"), &cancel).map(|_| ()),
        repo.upsert_catalog(&BTreeMap::new(), &cancel),
        repo.replace_owner_counts("Bankalt", &snapshot(), &cancel),
        repo.get_count("Bankalt", "1", &cancel).map(|_| ()),
        repo.get_name("1", &cancel).map(|_| ()),
        repo.list_owner_counts("Bankalt", &cancel).map(|_| ()),
    ];
    for result in results {
        assert!(matches!(
            result,
            Err(RepoError::Interrupted(Interruption::Cancelled))
        ));
    }

    assert!(repo
        .list_owner_counts("Bankalt", &CancelToken::none())
        .unwrap()
        .is_empty());
}

#[test]
fn expired_deadline_is_reported_as_deadline_exceeded() {
    let repo = SqliteInventoryRepository::try_new(bootstrap_db_in_memory().unwrap()).unwrap();
    let expired = CancelToken::with_timeout(Duration::ZERO);

    let err = repo.get_name("1", &expired).unwrap_err();
    assert!(matches!(
        err,
        RepoError::Interrupted(Interruption::DeadlineExceeded)
    ));
}

#[test]
fn cancel_while_waiting_for_shared_handle_returns_promptly() {
    let repo = SqliteInventoryRepository::try_new(bootstrap_db_in_memory().unwrap()).unwrap();
    let shared = repo.shared_connection();
    let held = shared.lock().unwrap();

    let cancel = CancelToken::none();
    let (done_tx, done_rx) = mpsc::channel();
    let worker = {
        let repo = repo.clone();
        let cancel = cancel.clone();
        thread::spawn(move || {
            let result = repo.replace_owner_counts("Bankalt", &snapshot(), &cancel);
            done_tx.send(()).unwrap();
            result
        })
    };

    assert!(done_rx.recv_timeout(Duration::from_millis(50)).is_err());
    cancel.cancel();
    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    drop(held);

    let result = worker.join().unwrap();
    assert!(matches!(
        result,
        Err(RepoError::Interrupted(Interruption::Cancelled))
    ));
    assert!(repo
        .list_owner_counts("Bankalt", &CancelToken::none())
        .unwrap()
        .is_empty());
}

#[test]
fn deadline_while_database_is_locked_leaves_previous_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("locked.db");
    let repo = SqliteInventoryRepository::try_new(bootstrap_db(&path).unwrap()).unwrap();
    repo.replace_owner_counts("Bankalt", &snapshot(), &CancelToken::none())
        .unwrap();

    let blocker = Connection::open(&path).unwrap();
    blocker.execute_batch("BEGIN IMMEDIATE;").unwrap();

    let started_at = Instant::now();
    let replacement: BTreeMap<String, u32> = [("3".to_string(), 30)].into_iter().collect();
    let err = repo
        .replace_owner_counts(
            "Bankalt",
            &replacement,
            &CancelToken::with_timeout(Duration::from_millis(100)),
        )
        .unwrap_err();
    assert!(
        matches!(err, RepoError::Interrupted(Interruption::DeadlineExceeded)),
        "{err}"
    );
    assert!(started_at.elapsed() < Duration::from_secs(4));

    blocker.execute_batch("ROLLBACK;").unwrap();
    assert_eq!(
        repo.list_owner_counts("Bankalt", &CancelToken::none())
            .unwrap(),
        snapshot()
    );

    // The connection's own lock wait is restored after the interrupted call.
    repo.replace_owner_counts("Bankalt", &replacement, &CancelToken::none())
        .unwrap();
    assert_eq!(
        repo.list_owner_counts("Bankalt", &CancelToken::none())
            .unwrap(),
        replacement
    );
}

const LARGE_CATALOG: u32 = 200_000;

fn seed_large_inventory(repo: &SqliteInventoryRepository) {
    let shared = repo.shared_connection();
    let conn = shared.lock().unwrap();
    conn.execute_batch(&format!(
        "WITH RECURSIVE seq(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM seq WHERE n < {LARGE_CATALOG})
         INSERT INTO item (id, name) SELECT n, 'item ' || n FROM seq;
         INSERT INTO item_count (owner, item_id, item_count)
             SELECT owner, id, 1
             FROM item, (SELECT 'Alpha' AS owner UNION ALL SELECT 'Beta' UNION ALL SELECT 'Gamma');"
    ))
    .unwrap();
}

#[test]
fn deadline_aborts_long_running_statements() {
    let repo = SqliteInventoryRepository::try_new(bootstrap_db_in_memory().unwrap()).unwrap();
    seed_large_inventory(&repo);

    let started_at = Instant::now();
    let err = repo
        .search_items(
            &SearchQuery::new("item"),
            &CancelToken::with_timeout(Duration::from_millis(10)),
        )
        .unwrap_err();
    assert!(
        matches!(err, RepoError::Interrupted(Interruption::DeadlineExceeded)),
        "{err}"
    );
    assert!(started_at.elapsed() < Duration::from_secs(1));

    let before = repo
        .list_owner_counts("Alpha", &CancelToken::none())
        .unwrap();
    assert_eq!(before.len(), LARGE_CATALOG as usize);

    let replacement: BTreeMap<String, u32> = (0..LARGE_CATALOG)
        .map(|n| (format!("new-{n}"), n))
        .collect();
    let err = repo
        .replace_owner_counts(
            "Alpha",
            &replacement,
            &CancelToken::with_timeout(Duration::from_millis(10)),
        )
        .unwrap_err();
    assert!(
        matches!(err, RepoError::Interrupted(Interruption::DeadlineExceeded)),
        "{err}"
    );
    assert_eq!(
        repo.list_owner_counts("Alpha", &CancelToken::none())
            .unwrap(),
        before
    );
    assert_eq!(
        repo.get_count("Alpha", "new-0", &CancelToken::none())
            .unwrap(),
        None
    );

    // The handle stays usable once the interrupted calls are over.
    let total: u64 = repo
        .search_items(&SearchQuery::new("item 199999"), &CancelToken::none())
        .unwrap()
        .iter()
        .map(|hit| hit.total_count)
        .sum();
    assert_eq!(total, 3);
}
