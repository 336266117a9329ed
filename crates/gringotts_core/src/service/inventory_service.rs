//! Inventory use-case service.
//!
//! # Responsibility
//! - Give the chat/command layer one entry point per use-case.
//! - Turn decoded exporter snapshots into repository writes.
//!
//! # Invariants
//! - A snapshot is validated as a whole before any write happens.
//! - Counts are replaced before the catalog is upserted; the two writes are
//!   separate transactions.
//! - Service layer remains storage-agnostic.

use crate::cancel::CancelToken;
use crate::model::item::{InventorySnapshot, ItemMatch, ValidationError};
use crate::repo::inventory_repo::{InventoryRepository, RepoError, SearchQuery};
use log::info;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Service error for inventory use-cases.
#[derive(Debug)]
pub enum ServiceError {
    /// Search input is blank after trimming.
    EmptyPattern,
    /// Snapshot failed validation; nothing was written.
    InvalidSnapshot(ValidationError),
    /// Persistence-layer failure.
    Repo(RepoError),
}

impl Display for ServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyPattern => write!(f, "search text cannot be empty"),
            Self::InvalidSnapshot(err) => write!(f, "invalid inventory snapshot: {err}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::EmptyPattern => None,
            Self::InvalidSnapshot(err) => Some(err),
            Self::Repo(err) => Some(err),
        }
    }
}

impl From<RepoError> for ServiceError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

/// Outcome of [`InventoryService::load_snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSummary {
    pub owner: String,
    pub counted_items: usize,
    pub catalog_entries: usize,
}

/// Inventory service facade over repository implementations.
pub struct InventoryService<R: InventoryRepository> {
    repo: R,
}

impl<R: InventoryRepository> InventoryService<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    /// Stores one owner's exported inventory.
    ///
    /// # Errors
    /// - [`ServiceError::InvalidSnapshot`] before any write.
    /// - [`ServiceError::Repo`] from either write. When the catalog upsert
    ///   fails, the owner's new counts are already committed.
    pub fn load_snapshot(
        &self,
        snapshot: &InventorySnapshot,
        cancel: &CancelToken,
    ) -> Result<LoadSummary, ServiceError> {
        snapshot.validate().map_err(ServiceError::InvalidSnapshot)?;

        self.repo
            .replace_owner_counts(&snapshot.owner, &snapshot.item_counts, cancel)?;
        self.repo.upsert_catalog(&snapshot.item_names, cancel)?;

        info!(
            "event=snapshot_load module=service status=ok counted_items={} catalog_entries={}",
            snapshot.item_counts.len(),
            snapshot.item_names.len()
        );
        Ok(LoadSummary {
            owner: snapshot.owner.clone(),
            counted_items: snapshot.item_counts.len(),
            catalog_entries: snapshot.item_names.len(),
        })
    }

    /// Finds items by name fragment for interactive search.
    ///
    /// Unlike the repository, a blank pattern is rejected instead of
    /// listing the whole catalog.
    pub fn find_items(
        &self,
        pattern: &str,
        limit: Option<u32>,
        cancel: &CancelToken,
    ) -> Result<Vec<ItemMatch>, ServiceError> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(ServiceError::EmptyPattern);
        }

        let query = SearchQuery {
            pattern: pattern.to_string(),
            limit,
        };
        Ok(self.repo.search_items(&query, cancel)?)
    }
}
