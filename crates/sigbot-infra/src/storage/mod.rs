//! Storage backends and backend selection.

pub mod memory;

use std::path::Path;

use sigbot_core::storage::BoxStorage;
use sigbot_types::config::{StorageBackend, StorageConfig};
use sigbot_types::error::StorageError;

pub use memory::MemoryStorage;

use crate::sqlite::SqliteStorage;

/// Open the backend named in the configuration.
pub async fn open_storage(config: &StorageConfig) -> Result<BoxStorage, StorageError> {
    match config.backend {
        StorageBackend::Sqlite => {
            let storage = SqliteStorage::open(Path::new(&config.sqlite_database)).await?;
            tracing::info!(path = %config.sqlite_database, "using sqlite storage");
            Ok(BoxStorage::new(storage))
        }
        StorageBackend::Memory => {
            tracing::warn!("using in-memory storage; dead letters and replay data are lost on exit");
            Ok(BoxStorage::new(MemoryStorage::new()))
        }
    }
}
