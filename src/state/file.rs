use super::CursorStore;
use crate::error::StorageError;
use crate::model::{CursorTable, PostId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;

pub const FORMAT_VERSION: u32 = 1;

/// On-disk layout. Unknown fields are ignored so later releases can add some.
#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    #[serde(default)]
    saved_at: Option<DateTime<Utc>>,
    cursors: Vec<CursorRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CursorRecord {
    handle: String,
    post_id: PostId,
}

#[derive(Debug, Clone)]
pub struct FileCursorStore {
    path: PathBuf,
}

impl FileCursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "cursors.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    #[instrument(skip_all, fields(path = %self.path.display()))]
    async fn load(&self) -> Result<CursorTable, StorageError> {
        let bytes = match fs::read(&self.path).await {
            Ok(b) => b,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CursorTable::new())
            }
            Err(err) => return Err(err.into()),
        };
        decode(&bytes)
    }

    #[instrument(skip_all, fields(path = %self.path.display(), entries = cursors.len()))]
    async fn save(&self, cursors: &CursorTable) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let body = encode(cursors)?;
        let tmp = self.temp_path();
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, &self.path).await?;
        sync_parent_dir(&self.path).await?;
        Ok(())
    }
}

/// Persist the directory entry written by the rename.
#[cfg(unix)]
async fn sync_parent_dir(path: &Path) -> Result<(), StorageError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::File::open(parent).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_parent_dir(_path: &Path) -> Result<(), StorageError> {
    Ok(())
}

fn encode(cursors: &CursorTable) -> Result<Vec<u8>, StorageError> {
    let doc = StateFile {
        version: FORMAT_VERSION,
        saved_at: Some(Utc::now()),
        cursors: cursors
            .iter()
            .map(|(handle, id)| CursorRecord {
                handle: handle.clone(),
                post_id: *id,
            })
            .collect(),
    };
    serde_json::to_vec_pretty(&doc).map_err(|e| StorageError::Io(e.into()))
}

fn decode(bytes: &[u8]) -> Result<CursorTable, StorageError> {
    let doc: StateFile =
        serde_json::from_slice(bytes).map_err(|e| StorageError::Corrupt(e.to_string()))?;
    if doc.version != FORMAT_VERSION {
        return Err(StorageError::Corrupt(format!(
            "unsupported state format version {}",
            doc.version
        )));
    }
    let mut table = CursorTable::new();
    for record in doc.cursors {
        if table.insert(record.handle.clone(), record.post_id).is_some() {
            return Err(StorageError::Corrupt(format!(
                "duplicate cursor for {}",
                record.handle
            )));
        }
    }
    Ok(table)
}
