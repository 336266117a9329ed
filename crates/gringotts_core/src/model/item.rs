//! Catalog and inventory domain model.
//!
//! # Responsibility
//! - Define the records exchanged between the repository and its callers.
//! - Validate caller-supplied identifiers before they reach storage.
//!
//! # Invariants
//! - Item ids are externally assigned and never generated here.
//! - Counts are non-negative by construction (`u32`).
//! - Names compare case-insensitively for ASCII, matching SQLite `NOCASE`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Externally assigned item identifier (e.g. a game item id).
pub type ItemId = String;

/// Catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub name: String,
}

/// One search result: an item and the sum of its counts over all owners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMatch {
    pub id: ItemId,
    pub name: String,
    pub total_count: u64,
}

/// Normalized inventory export for one owner.
///
/// Field names on the wire follow the exporter addon payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventorySnapshot {
    #[serde(rename = "charName")]
    pub owner: String,
    #[serde(rename = "itemCounts", default)]
    pub item_counts: BTreeMap<ItemId, u32>,
    #[serde(rename = "itemNames", default)]
    pub item_names: BTreeMap<ItemId, String>,
}

/// Input validation failures, raised before any storage access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    BlankOwner,
    BlankItemId,
    BlankItemName { item_id: ItemId },
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BlankOwner => write!(f, "owner cannot be blank"),
            Self::BlankItemId => write!(f, "item id cannot be blank"),
            Self::BlankItemName { item_id } => {
                write!(f, "item `{item_id}` has a blank name")
            }
        }
    }
}

impl Error for ValidationError {}

pub fn validate_owner(owner: &str) -> Result<(), ValidationError> {
    if owner.trim().is_empty() {
        return Err(ValidationError::BlankOwner);
    }
    Ok(())
}

pub fn validate_item_id(item_id: &str) -> Result<(), ValidationError> {
    if item_id.trim().is_empty() {
        return Err(ValidationError::BlankItemId);
    }
    Ok(())
}

pub fn validate_item_name(item_id: &str, name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::BlankItemName {
            item_id: item_id.to_string(),
        });
    }
    Ok(())
}

/// Folds a name the way the `item.name` column collation does.
pub fn name_key(name: &str) -> String {
    name.to_ascii_lowercase()
}

impl InventorySnapshot {
    /// Checks owner, ids and names without touching storage.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_owner(&self.owner)?;
        for item_id in self.item_counts.keys() {
            validate_item_id(item_id)?;
        }
        for (item_id, name) in &self.item_names {
            validate_item_id(item_id)?;
            validate_item_name(item_id, name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{name_key, InventorySnapshot, ValidationError};

    #[test]
    fn name_key_folds_ascii_only() {
        assert_eq!(name_key("Linen Cloth"), "linen cloth");
        assert_eq!(name_key("ÄRMEL"), "Ärmel");
    }

    #[test]
    fn snapshot_validation_reports_first_problem() {
        let mut snapshot = InventorySnapshot {
            owner: "  ".to_string(),
            ..InventorySnapshot::default()
        };
        assert_eq!(snapshot.validate(), Err(ValidationError::BlankOwner));

        snapshot.owner = "Bankalt".to_string();
        snapshot
            .item_names
            .insert("2589".to_string(), " ".to_string());
        assert_eq!(
            snapshot.validate(),
            Err(ValidationError::BlankItemName {
                item_id: "2589".to_string()
            })
        );
    }
}
