use super::CursorStore;
use crate::error::StorageError;
use crate::model::{CursorTable, PostId};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use tracing::instrument;

// SQLITE_CORRUPT and SQLITE_NOTADB.
const CORRUPT_CODES: [&str; 2] = ["11", "26"];

#[derive(Debug, Clone)]
pub struct SqliteCursorStore {
    pool: SqlitePool,
}

impl SqliteCursorStore {
    /// Open (creating if missing) the database at `path` and apply migrations.
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        Self::connect_with(options).await
    }

    /// WAL and `synchronous=FULL` are applied to every pooled connection.
    pub async fn connect_with(options: SqliteConnectOptions) -> Result<Self, StorageError> {
        let options = options
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        let pool = SqlitePool::connect_with(options).await.map_err(map_sqlx)?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|err| match err {
                sqlx::migrate::MigrateError::Execute(e) => map_sqlx(e),
                sqlx::migrate::MigrateError::VersionMissing(v) => StorageError::Corrupt(format!(
                    "database was migrated by a newer release (migration {})",
                    v
                )),
                other => StorageError::Database(other.to_string()),
            })?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl CursorStore for SqliteCursorStore {
    #[instrument(skip_all)]
    async fn load(&self) -> Result<CursorTable, StorageError> {
        let rows = sqlx::query("SELECT handle, post_id FROM cursors ORDER BY handle")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        let mut table = CursorTable::new();
        for row in rows {
            let handle: String = row.try_get("handle").map_err(map_sqlx)?;
            let raw: String = row.try_get("post_id").map_err(map_sqlx)?;
            let id: PostId = raw.parse().map_err(|_| {
                StorageError::Corrupt(format!("cursor for {} is not a post id: {:?}", handle, raw))
            })?;
            table.insert(handle, id);
        }
        Ok(table)
    }

    #[instrument(skip_all, fields(entries = cursors.len()))]
    async fn save(&self, cursors: &CursorTable) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        sqlx::query("DELETE FROM cursors")
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        for (handle, id) in cursors {
            sqlx::query(
                "INSERT INTO cursors (handle, post_id, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)",
            )
            .bind(handle)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }
}

fn map_sqlx(err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db) = &err {
        let by_code = db
            .code()
            .map(|c| CORRUPT_CODES.iter().any(|k| c == *k))
            .unwrap_or(false);
        let by_message = db.message().contains("not a database") || db.message().contains("malformed");
        if by_code || by_message {
            return StorageError::Corrupt(db.message().to_string());
        }
    }
    StorageError::Database(err.to_string())
}
