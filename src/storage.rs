use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::models::{SettingsFile, TasksFile};

const DATA_FILE: &str = "data.json";
const SETTINGS_FILE: &str = "settings.json";
pub const SNAPSHOT_LIMIT: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::Io(io) if io.kind() == std::io::ErrorKind::NotFound)
    }
}

/// On-disk home of the record store.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_dirs(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    pub fn load_tasks(&self) -> Result<TasksFile, StorageError> {
        load_json(&self.root.join(DATA_FILE))
    }

    pub fn load_settings(&self) -> Result<SettingsFile, StorageError> {
        load_json(&self.root.join(SETTINGS_FILE))
    }

    pub fn save_tasks(&self, data: &TasksFile) -> Result<(), StorageError> {
        write_atomic(&self.root.join(DATA_FILE), data)
    }

    pub fn save_settings(&self, data: &SettingsFile) -> Result<(), StorageError> {
        write_atomic(&self.root.join(SETTINGS_FILE), data)
    }
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, StorageError> {
    let mut file = File::open(path)?;
    let mut buf = String::new();
    file.read_to_string(&mut buf)?;
    Ok(serde_json::from_str(&buf)?)
}

/// Temp file + fsync + rename, so readers never see a half-written document.
pub fn write_atomic<T: Serialize>(path: &Path, data: &T) -> Result<(), StorageError> {
    let temp_path = path.with_extension("tmp");
    let json = serde_json::to_vec_pretty(data)?;
    {
        let mut file = File::create(&temp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    fs::rename(temp_path, path)?;
    Ok(())
}

/// Copies `path` into `dir` under a timestamped name and drops all but the newest
/// [`SNAPSHOT_LIMIT`] copies.
pub fn snapshot_file(path: &Path, dir: &Path) -> Result<PathBuf, StorageError> {
    fs::create_dir_all(dir)?;
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("snapshot");
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S%.3f").to_string();
    let target = dir.join(format!("{stem}-{stamp}.json"));
    fs::copy(path, &target)?;
    trim_snapshots(dir)?;
    Ok(target)
}

pub fn list_snapshots(dir: &Path) -> Result<Vec<(String, i64)>, StorageError> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.filter_map(|entry| entry.ok()).collect();
    entries.sort_by_key(|entry| entry.file_name());
    let mut results = Vec::new();
    for entry in entries {
        if let Some(name) = entry.file_name().to_str() {
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|dur| dur.as_millis() as i64)
                .unwrap_or(0);
            results.push((name.to_string(), modified));
        }
    }
    Ok(results)
}

fn trim_snapshots(dir: &Path) -> Result<(), StorageError> {
    // Names embed a sortable timestamp, oldest first.
    let mut entries: Vec<_> = fs::read_dir(dir)?.filter_map(|entry| entry.ok()).collect();
    entries.sort_by_key(|entry| entry.file_name());
    let to_remove = entries.len().saturating_sub(SNAPSHOT_LIMIT);
    for entry in entries.into_iter().take(to_remove) {
        let _ = fs::remove_file(entry.path());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Setting, Task, TaskKind};

    #[test]
    fn missing_files_report_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf());
        let err = storage.load_tasks().expect_err("no data file yet");
        assert!(err.is_not_found());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().join("nested"));
        storage.ensure_dirs().unwrap();

        let mut task = Task::new("a", TaskKind::Task, 1);
        task.id = Some(1);
        storage
            .save_tasks(&TasksFile {
                schema_version: 1,
                next_id: 2,
                tasks: vec![task.clone()],
            })
            .unwrap();
        storage
            .save_settings(&SettingsFile {
                schema_version: 1,
                settings: vec![Setting::new("k", "v")],
            })
            .unwrap();

        let tasks = storage.load_tasks().unwrap();
        assert_eq!(tasks.next_id, 2);
        assert_eq!(tasks.tasks, vec![task]);
        assert_eq!(storage.load_settings().unwrap().settings[0].value, "v");
        assert!(!dir.path().join("nested").join("data.tmp").exists());
    }

    #[test]
    fn corrupt_file_is_a_json_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("data.json"), b"{not json").unwrap();
        let storage = Storage::new(dir.path().to_path_buf());
        assert!(matches!(storage.load_tasks(), Err(StorageError::Json(_))));
    }

    #[test]
    fn snapshots_are_trimmed_to_limit() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("blob.json");
        fs::write(&source, b"{}").unwrap();
        let snapshots = dir.path().join("snapshots");
        fs::create_dir_all(&snapshots).unwrap();
        for i in 0..(SNAPSHOT_LIMIT + 3) {
            fs::write(snapshots.join(format!("blob-0000-{i:03}.json")), b"{}").unwrap();
        }
        snapshot_file(&source, &snapshots).unwrap();
        let list = list_snapshots(&snapshots).unwrap();
        assert_eq!(list.len(), SNAPSHOT_LIMIT);
        assert!(list.iter().all(|(name, _)| name != "blob-0000-000.json"));
    }
}
