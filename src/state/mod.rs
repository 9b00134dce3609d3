//! Cursor persistence.
//!
//! Two backends implement [`CursorStore`]:
//! - `sqlite`: the default; the whole mapping is replaced inside one transaction.
//! - `file`: a versioned JSON document replaced via temp file + rename.
//!
//! Both fail `load` with [`StorageError::Corrupt`] rather than returning an
//! empty table when existing state cannot be read.

pub mod file;
pub mod sqlite;

use crate::config::{Config, StateBackend};
use crate::error::StorageError;
use crate::model::CursorTable;
use async_trait::async_trait;

pub use file::FileCursorStore;
pub use sqlite::SqliteCursorStore;

#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Read the full mapping. Missing state yields an empty table.
    async fn load(&self) -> Result<CursorTable, StorageError>;

    /// Atomically replace the full mapping.
    async fn save(&self, cursors: &CursorTable) -> Result<(), StorageError>;
}

/// Open the backend selected in `cfg.state`.
pub async fn open_store(cfg: &Config) -> Result<Box<dyn CursorStore>, StorageError> {
    let path = cfg.state_path();
    match cfg.state.backend {
        StateBackend::Sqlite => Ok(Box::new(SqliteCursorStore::open(&path).await?)),
        StateBackend::File => Ok(Box::new(FileCursorStore::new(path))),
    }
}
