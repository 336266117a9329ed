use gringotts_core::db::bootstrap_db_in_memory;
use gringotts_core::{
    CancelToken, InventoryRepository, InventoryService, InventorySnapshot, ItemMatch, LoadSummary,
    RepoError, ServiceError, SqliteInventoryRepository, ValidationError,
};

fn service() -> InventoryService<SqliteInventoryRepository> {
    let repo = SqliteInventoryRepository::try_new(bootstrap_db_in_memory().unwrap()).unwrap();
    InventoryService::new(repo)
}

fn exporter_payload(owner: &str) -> InventorySnapshot {
    serde_json::from_str(&format!(
        r#"{{
            "charName": "{owner}",
            "itemCounts": {{ "2589": 40, "2592": 12 }},
            "itemNames": {{ "2589": "Linen Cloth", "2592": "Wool Cloth", "4306": "Silk Cloth" }}
        }}"#
    ))
    .unwrap()
}

#[test]
fn exporter_payload_decodes_into_snapshot() {
    let snapshot = exporter_payload("Bankalt");

    assert_eq!(snapshot.owner, "Bankalt");
    assert_eq!(snapshot.item_counts.get("2589"), Some(&40));
    assert_eq!(snapshot.item_names.len(), 3);

    let encoded = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(encoded["charName"], "Bankalt");
    assert_eq!(encoded["itemCounts"]["2592"], 12);
}

#[test]
fn load_snapshot_replaces_counts_and_upserts_catalog() {
    let service = service();
    let cancel = CancelToken::none();

    let summary = service
        .load_snapshot(&exporter_payload("Bankalt"), &cancel)
        .unwrap();
    assert_eq!(
        summary,
        LoadSummary {
            owner: "Bankalt".to_string(),
            counted_items: 2,
            catalog_entries: 3,
        }
    );

    let repo = service.repository();
    assert_eq!(repo.get_count("Bankalt", "2592", &cancel).unwrap(), Some(12));
    assert_eq!(
        repo.get_name("4306", &cancel).unwrap().as_deref(),
        Some("Silk Cloth")
    );

    service
        .load_snapshot(&exporter_payload("Alt"), &cancel)
        .unwrap();
    let hits = service.find_items("linen", None, &cancel).unwrap();
    assert_eq!(
        hits,
        vec![ItemMatch {
            id: "2589".to_string(),
            name: "Linen Cloth".to_string(),
            total_count: 80,
        }]
    );
}

#[test]
fn blank_search_text_is_rejected() {
    let service = service();

    for pattern in ["", "   ", "\t\n"] {
        let err = service
            .find_items(pattern, None, &CancelToken::none())
            .unwrap_err();
        assert!(matches!(err, ServiceError::EmptyPattern));
    }
}

#[test]
fn search_text_is_trimmed_and_limited() {
    let service = service();
    let cancel = CancelToken::none();
    service
        .load_snapshot(&exporter_payload("Bankalt"), &cancel)
        .unwrap();

    let hits = service.find_items("  cloth ", Some(2), &cancel).unwrap();
    let names: Vec<&str> = hits.iter().map(|hit| hit.name.as_str()).collect();
    assert_eq!(names, vec!["Linen Cloth", "Silk Cloth"]);
}

#[test]
fn invalid_snapshot_writes_nothing() {
    let service = service();
    let cancel = CancelToken::none();
    let mut snapshot = exporter_payload("Bankalt");
    snapshot.item_names.insert("9999".to_string(), " ".to_string());

    let err = service.load_snapshot(&snapshot, &cancel).unwrap_err();
    assert!(matches!(
        err,
        ServiceError::InvalidSnapshot(ValidationError::BlankItemName { ref item_id }) if item_id == "9999"
    ));
    assert_eq!(
        service
            .repository()
            .get_count("Bankalt", "2589", &cancel)
            .unwrap(),
        None
    );

    let blank_owner = exporter_payload("  ");
    let err = service.load_snapshot(&blank_owner, &cancel).unwrap_err();
    assert!(matches!(
        err,
        ServiceError::InvalidSnapshot(ValidationError::BlankOwner)
    ));
}

#[test]
fn catalog_conflict_surfaces_after_counts_are_committed() {
    let service = service();
    let cancel = CancelToken::none();
    service
        .load_snapshot(&exporter_payload("Bankalt"), &cancel)
        .unwrap();

    let mut renamed = exporter_payload("Alt");
    renamed
        .item_names
        .insert("9999".to_string(), "LINEN CLOTH".to_string());
    let err = service.load_snapshot(&renamed, &cancel).unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Repo(RepoError::ConstraintViolation { .. })
    ));

    let repo = service.repository();
    assert_eq!(repo.get_count("Alt", "2589", &cancel).unwrap(), Some(40));
    assert_eq!(repo.get_name("9999", &cancel).unwrap(), None);
}
