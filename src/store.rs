use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::events::{ChangeOrigin, StoreEvent};
use crate::models::{Setting, SettingsFile, Task, TaskId, TaskPatch, TaskStatus, TasksFile, Timestamp};
use crate::storage::{Storage, StorageError};

const SCHEMA_VERSION: u32 = 1;
const EVENT_CAPACITY: usize = 64;

pub type Predicate<'a> = &'a (dyn Fn(&Task) -> bool + Send + Sync);
pub type Comparator<'a> = &'a (dyn Fn(&Task, &Task) -> Ordering + Send + Sync);

/// The authoritative local collection of tasks and settings.
///
/// Every call observes all writes that completed before it. Writes are atomic per
/// record; there are no multi-record transactions apart from `replace_tasks`.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Inserts a task under a fresh id. Any id on the input is ignored.
    async fn add(&self, task: Task) -> Result<TaskId, StoreError>;
    async fn update(&self, id: TaskId, patch: TaskPatch) -> Result<Task, StoreError>;
    /// Removes a task and returns it.
    async fn delete(&self, id: TaskId) -> Result<Task, StoreError>;
    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError>;
    async fn query(
        &self,
        predicate: Predicate<'_>,
        sort: Option<Comparator<'_>>,
    ) -> Result<Vec<Task>, StoreError>;
    async fn count(&self, predicate: Predicate<'_>) -> Result<usize, StoreError>;
    async fn delete_where(&self, predicate: Predicate<'_>) -> Result<usize, StoreError>;
    /// Clears the task collection and bulk-inserts `tasks`, keeping their ids where
    /// they are present and unique.
    async fn replace_tasks(&self, tasks: Vec<Task>) -> Result<(), StoreError>;

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn put_setting(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn delete_setting(&self, key: &str) -> Result<(), StoreError>;
    async fn settings(&self) -> Result<Vec<Setting>, StoreError>;

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<Mutex<StoreData>>,
    storage: Option<Storage>,
    events: broadcast::Sender<StoreEvent>,
}

#[derive(Debug, Default)]
struct StoreData {
    tasks: Vec<Task>,
    next_id: TaskId,
    settings: Vec<Setting>,
}

impl LocalStore {
    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self::with_data(StoreData::default(), None)
    }

    /// Opens the store rooted at `storage`. Missing files start empty; unreadable
    /// ones are an error rather than silently discarded.
    pub fn open(storage: Storage) -> Result<Self, StorageError> {
        storage.ensure_dirs()?;
        let tasks_file = match storage.load_tasks() {
            Ok(file) => Some(file),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err),
        };
        let settings = match storage.load_settings() {
            Ok(file) => file.settings,
            Err(err) if err.is_not_found() => Vec::new(),
            Err(err) => return Err(err),
        };
        let (tasks, next_id) = tasks_file
            .map(|file| (file.tasks, file.next_id))
            .unwrap_or_default();
        log::info!(
            "record store opened dir={} tasks={} settings={}",
            storage.root().display(),
            tasks.len(),
            settings.len()
        );
        Ok(Self::with_data(
            StoreData {
                tasks,
                next_id,
                settings,
            },
            Some(storage),
        ))
    }

    fn with_data(mut data: StoreData, storage: Option<Storage>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (tasks, next_id) = assign_ids(std::mem::take(&mut data.tasks), data.next_id);
        data.tasks = tasks;
        data.next_id = next_id;
        Self {
            inner: Arc::new(Mutex::new(data)),
            storage,
            events,
        }
    }

    fn persist_tasks(&self, tasks: &[Task], next_id: TaskId) -> Result<(), StoreError> {
        if let Some(storage) = &self.storage {
            storage.save_tasks(&TasksFile {
                schema_version: SCHEMA_VERSION,
                next_id,
                tasks: tasks.to_vec(),
            })?;
        }
        Ok(())
    }

    fn persist_settings(&self, settings: &[Setting]) -> Result<(), StoreError> {
        if let Some(storage) = &self.storage {
            storage.save_settings(&SettingsFile {
                schema_version: SCHEMA_VERSION,
                settings: settings.to_vec(),
            })?;
        }
        Ok(())
    }

    fn notify(&self, event: StoreEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Runs `mutate` on a copy of the task list and commits it only if it persists.
    fn write_tasks<T>(
        &self,
        origin: ChangeOrigin,
        mutate: impl FnOnce(&mut Vec<Task>, &mut TaskId) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let result = {
            let mut guard = self.inner.lock().expect("store poisoned");
            let mut tasks = guard.tasks.clone();
            let mut next_id = guard.next_id;
            let result = mutate(&mut tasks, &mut next_id)?;
            self.persist_tasks(&tasks, next_id)?;
            guard.tasks = tasks;
            guard.next_id = next_id;
            result
        };
        self.notify(StoreEvent::TasksChanged(origin));
        Ok(result)
    }

    fn write_settings(
        &self,
        mutate: impl FnOnce(&mut Vec<Setting>) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        {
            let mut guard = self.inner.lock().expect("store poisoned");
            let mut settings = guard.settings.clone();
            mutate(&mut settings)?;
            self.persist_settings(&settings)?;
            guard.settings = settings;
        }
        self.notify(StoreEvent::SettingsChanged);
        Ok(())
    }
}

/// Gives every id-less or duplicate-id task a fresh id and returns the next free id.
fn assign_ids(tasks: Vec<Task>, next_id: TaskId) -> (Vec<Task>, TaskId) {
    let max_id = tasks.iter().filter_map(|t| t.id).max().unwrap_or(0);
    let mut next_id = next_id.max(max_id + 1).max(1);
    let mut seen = HashSet::new();
    let tasks = tasks
        .into_iter()
        .map(|mut task| {
            match task.id {
                Some(id) if seen.insert(id) => {}
                _ => {
                    task.id = Some(next_id);
                    seen.insert(next_id);
                    next_id += 1;
                }
            }
            task
        })
        .collect();
    (tasks, next_id)
}

#[async_trait]
impl RecordStore for LocalStore {
    async fn add(&self, task: Task) -> Result<TaskId, StoreError> {
        self.write_tasks(ChangeOrigin::Local, |tasks, next_id| {
            let id = *next_id;
            *next_id += 1;
            let mut task = task;
            task.id = Some(id);
            tasks.push(task);
            Ok(id)
        })
    }

    async fn update(&self, id: TaskId, patch: TaskPatch) -> Result<Task, StoreError> {
        self.write_tasks(ChangeOrigin::Local, |tasks, _| {
            let task = tasks
                .iter_mut()
                .find(|t| t.id == Some(id))
                .ok_or(StoreError::NotFound(id))?;
            task.apply_patch(patch);
            Ok(task.clone())
        })
    }

    async fn delete(&self, id: TaskId) -> Result<Task, StoreError> {
        self.write_tasks(ChangeOrigin::Local, |tasks, _| {
            let index = tasks
                .iter()
                .position(|t| t.id == Some(id))
                .ok_or(StoreError::NotFound(id))?;
            Ok(tasks.remove(index))
        })
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let guard = self.inner.lock().expect("store poisoned");
        Ok(guard.tasks.iter().find(|t| t.id == Some(id)).cloned())
    }

    async fn query(
        &self,
        predicate: Predicate<'_>,
        sort: Option<Comparator<'_>>,
    ) -> Result<Vec<Task>, StoreError> {
        let mut out: Vec<Task> = {
            let guard = self.inner.lock().expect("store poisoned");
            guard.tasks.iter().filter(|t| predicate(t)).cloned().collect()
        };
        if let Some(cmp) = sort {
            out.sort_by(|a, b| cmp(a, b));
        }
        Ok(out)
    }

    async fn count(&self, predicate: Predicate<'_>) -> Result<usize, StoreError> {
        let guard = self.inner.lock().expect("store poisoned");
        Ok(guard.tasks.iter().filter(|t| predicate(t)).count())
    }

    async fn delete_where(&self, predicate: Predicate<'_>) -> Result<usize, StoreError> {
        let matching = self.count(predicate).await?;
        if matching == 0 {
            return Ok(0);
        }
        self.write_tasks(ChangeOrigin::Local, |tasks, _| {
            let before = tasks.len();
            tasks.retain(|t| !predicate(t));
            Ok(before - tasks.len())
        })
    }

    async fn replace_tasks(&self, tasks: Vec<Task>) -> Result<(), StoreError> {
        self.write_tasks(ChangeOrigin::Restore, |current, next_id| {
            let (assigned, next) = assign_ids(tasks, 1);
            *current = assigned;
            *next_id = next.max(*next_id);
            Ok(())
        })
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let guard = self.inner.lock().expect("store poisoned");
        Ok(guard
            .settings
            .iter()
            .find(|s| s.key == key)
            .map(|s| s.value.clone()))
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.write_settings(|settings| {
            match settings.iter_mut().find(|s| s.key == key) {
                Some(existing) => existing.value = value.to_string(),
                None => settings.push(Setting::new(key, value)),
            }
            Ok(())
        })
    }

    async fn delete_setting(&self, key: &str) -> Result<(), StoreError> {
        self.write_settings(|settings| {
            let index = settings
                .iter()
                .position(|s| s.key == key)
                .ok_or_else(|| StoreError::SettingNotFound(key.to_string()))?;
            settings.remove(index);
            Ok(())
        })
    }

    async fn settings(&self) -> Result<Vec<Setting>, StoreError> {
        let guard = self.inner.lock().expect("store poisoned");
        Ok(guard.settings.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

/// Deletes completed tasks created before `now - retention`.
pub async fn purge_expired_tasks(
    store: &dyn RecordStore,
    now: Timestamp,
    retention: Duration,
) -> Result<usize, StoreError> {
    let cutoff = now - retention.as_millis() as i64;
    let removed = store
        .delete_where(&|t: &Task| t.status == TaskStatus::Completed && t.created_at < cutoff)
        .await?;
    if removed > 0 {
        log::info!("purged expired tasks count={removed} cutoff={cutoff}");
    }
    Ok(removed)
}
