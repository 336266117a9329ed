//! Storage core for the Gringotts inventory bot.
//! This crate owns the schema, the item catalog and per-owner item counts.

pub mod cancel;
pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use cancel::{CancelToken, Interruption};
pub use config::{ConfigError, StoreConfig};
pub use db::migrations::{default_migrations, Migration, MigrationRecord, SchemaMigrator};
pub use db::{DbError, DbResult, MigrationError, MigrationResult};
pub use logging::{
    default_log_level, init_logging, init_logging_from_config, logging_status, LoggingError,
};
pub use model::item::{InventorySnapshot, Item, ItemId, ItemMatch, ValidationError};
pub use repo::inventory_repo::{
    InventoryRepository, RepoError, RepoResult, SearchQuery, SharedConnection,
    SqliteInventoryRepository,
};
pub use service::inventory_service::{InventoryService, LoadSummary, ServiceError};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
