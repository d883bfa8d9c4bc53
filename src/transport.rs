use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::RemoteError;
use crate::models::BackupEnvelope;
use crate::storage::{self, StorageError};

const SNAPSHOT_DIR: &str = "snapshots";

/// Blob store holding one well-known backup document per account.
#[async_trait]
pub trait BackupTransport: Send + Sync {
    /// `Ok(None)` when no backup has been written yet.
    async fn load(&self) -> Result<Option<BackupEnvelope>, RemoteError>;
    /// Replaces the whole document.
    async fn save(&self, envelope: &BackupEnvelope) -> Result<(), RemoteError>;
}

/// Keeps the backup document in a local (possibly synced) directory. The previous
/// document is kept as a rotating snapshot on every save.
pub struct FileTransport {
    dir: PathBuf,
    name: String,
}

impl FileTransport {
    pub fn new(dir: PathBuf, name: impl Into<String>) -> Self {
        Self {
            dir,
            name: name.into(),
        }
    }

    fn path(&self) -> PathBuf {
        self.dir.join(&self.name)
    }

    pub fn snapshots(&self) -> Result<Vec<(String, i64)>, RemoteError> {
        match storage::list_snapshots(&self.dir.join(SNAPSHOT_DIR)) {
            Ok(list) => Ok(list),
            Err(err) if err.is_not_found() => Ok(Vec::new()),
            Err(err) => Err(map_storage_error(err)),
        }
    }
}

fn map_storage_error(err: StorageError) -> RemoteError {
    match err {
        StorageError::Json(err) => RemoteError::Decode(err.to_string()),
        StorageError::Io(err) => RemoteError::Transient(format!("io error: {err}")),
    }
}

#[async_trait]
impl BackupTransport for FileTransport {
    async fn load(&self) -> Result<Option<BackupEnvelope>, RemoteError> {
        match storage::load_json::<BackupEnvelope>(&self.path()) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(map_storage_error(err)),
        }
    }

    async fn save(&self, envelope: &BackupEnvelope) -> Result<(), RemoteError> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|err| map_storage_error(StorageError::Io(err)))?;
        let path = self.path();
        if path.exists() {
            if let Err(err) = storage::snapshot_file(&path, &self.dir.join(SNAPSHOT_DIR)) {
                log::warn!("backup snapshot failed path={} err={err}", path.display());
            }
        }
        storage::write_atomic(&path, envelope).map_err(map_storage_error)
    }
}
