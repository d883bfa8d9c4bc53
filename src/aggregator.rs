use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, NaiveTime};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::dates;
use crate::error::{ItemError, RemoteError, StoreError};
use crate::models::{
    RemoteTask, RemoteTaskFields, RemoteTaskList, Task, TaskId, TaskKind, TaskPatch, TaskStatus,
    Urgency,
};
use crate::remote::TaskProvider;
use crate::session::Session;
use crate::store::RecordStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    /// Pending work that is not yet past its date.
    Primary,
    /// Open items dated or due inside `[start, end]`.
    Week { start: NaiveDate, end: NaiveDate },
    ByKind(TaskKind),
    All,
}

impl ViewKind {
    pub fn week(today: NaiveDate, offset: i64) -> Self {
        let (start, end) = dates::week_window(today, offset);
        ViewKind::Week { start, end }
    }

    fn is_dated(&self) -> bool {
        matches!(self, ViewKind::Primary | ViewKind::Week { .. })
    }
}

/// Identity of a row in a merged view; also decides which side a command goes to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UnifiedKey {
    Local(TaskId),
    Remote(String),
}

impl fmt::Display for UnifiedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnifiedKey::Local(id) => write!(f, "local:{id}"),
            UnifiedKey::Remote(id) => write!(f, "remote:{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid item key {0:?}")]
pub struct ParseKeyError(String);

impl FromStr for UnifiedKey {
    type Err = ParseKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseKeyError(s.to_string());
        match s.split_once(':') {
            Some(("local", id)) => id.parse().map(UnifiedKey::Local).map_err(|_| invalid()),
            Some(("remote", id)) if !id.is_empty() => Ok(UnifiedKey::Remote(id.to_string())),
            _ => Err(invalid()),
        }
    }
}

/// One row of a merged view, tagged with the side that owns it.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "origin", content = "item", rename_all = "snake_case")]
pub enum UnifiedItem {
    Local(Task),
    Remote(RemoteTask),
}

impl UnifiedItem {
    pub fn key(&self) -> UnifiedKey {
        match self {
            // Stored tasks always carry an id.
            UnifiedItem::Local(task) => UnifiedKey::Local(task.id.unwrap_or_default()),
            UnifiedItem::Remote(task) => UnifiedKey::Remote(task.remote_id.clone()),
        }
    }

    pub fn title(&self) -> &str {
        match self {
            UnifiedItem::Local(task) => &task.title,
            UnifiedItem::Remote(task) => &task.title,
        }
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            UnifiedItem::Local(task) => task.kind,
            UnifiedItem::Remote(task) => task.kind(),
        }
    }

    pub fn status(&self) -> TaskStatus {
        match self {
            UnifiedItem::Local(task) => task.status,
            UnifiedItem::Remote(task) => task.status,
        }
    }

    pub fn urgency(&self) -> Urgency {
        match self {
            UnifiedItem::Local(task) => task.urgency,
            UnifiedItem::Remote(_) => Urgency::default(),
        }
    }

    pub fn effective_date(&self) -> Option<NaiveDate> {
        match self {
            UnifiedItem::Local(task) => task.effective_date(),
            UnifiedItem::Remote(task) => task.due,
        }
    }

    pub fn start_time(&self) -> Option<NaiveTime> {
        match self {
            UnifiedItem::Local(task) => task.start_time,
            UnifiedItem::Remote(_) => None,
        }
    }

    fn dates(&self) -> [Option<NaiveDate>; 2] {
        match self {
            UnifiedItem::Local(task) => [task.scheduled_date, task.deadline_date],
            UnifiedItem::Remote(task) => [task.due, None],
        }
    }
}

/// Whether `item` belongs in `view` on `today`.
pub fn matches_view(view: &ViewKind, item: &UnifiedItem, today: NaiveDate) -> bool {
    match view {
        ViewKind::Primary => {
            item.status() == TaskStatus::Pending
                && item.effective_date().map_or(true, |date| date >= today)
        }
        ViewKind::Week { start, end } => {
            item.status() != TaskStatus::Completed
                && item
                    .dates()
                    .into_iter()
                    .flatten()
                    .any(|date| dates::within(date, (*start, *end)))
        }
        ViewKind::ByKind(kind) => item.kind() == *kind,
        ViewKind::All => true,
    }
}

// Missing values sort after present ones.
fn cmp_present_first<T: Ord>(a: Option<T>, b: Option<T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Total order for `view`; ties fall back to the unified key.
pub fn compare_items(view: &ViewKind, a: &UnifiedItem, b: &UnifiedItem) -> Ordering {
    let primary = if view.is_dated() {
        cmp_present_first(a.effective_date(), b.effective_date())
            .then_with(|| cmp_present_first(a.start_time(), b.start_time()))
            .then_with(|| b.urgency().cmp(&a.urgency()))
    } else {
        let done = |item: &UnifiedItem| item.status() == TaskStatus::Completed;
        done(a)
            .cmp(&done(b))
            .then_with(|| b.urgency().cmp(&a.urgency()))
    };
    primary.then_with(|| a.key().cmp(&b.key()))
}

pub fn sort_items(view: &ViewKind, items: &mut [UnifiedItem]) {
    items.sort_by(|a, b| compare_items(view, a, b));
}

/// An immutable, ordered view snapshot.
pub type ViewItems = Arc<Vec<UnifiedItem>>;

pub type Clock = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

struct ViewSlot {
    items: watch::Sender<ViewItems>,
    generation: u64,
}

/// One provider snapshot, numbered in the order its fetch started.
struct RemoteFetch {
    ticket: u64,
    tasks: Vec<RemoteTask>,
}

#[derive(Default)]
struct RemoteCache {
    ticket: u64,
    tasks: Vec<RemoteTask>,
}

/// Merges local and remote tasks into per-view ordered lists.
#[derive(Clone)]
pub struct TaskAggregator {
    inner: Arc<AggregatorInner>,
}

struct AggregatorInner {
    store: Arc<dyn RecordStore>,
    provider: Option<Arc<dyn TaskProvider>>,
    session: Session,
    today: Clock,
    views: Mutex<HashMap<ViewKind, ViewSlot>>,
    remote_cache: Mutex<RemoteCache>,
    fetches: AtomicU64,
}

impl TaskAggregator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        provider: Option<Arc<dyn TaskProvider>>,
        session: Session,
    ) -> Self {
        Self::with_clock(store, provider, session, Arc::new(dates::today))
    }

    pub fn with_clock(
        store: Arc<dyn RecordStore>,
        provider: Option<Arc<dyn TaskProvider>>,
        session: Session,
        today: Clock,
    ) -> Self {
        Self {
            inner: Arc::new(AggregatorInner {
                store,
                provider,
                session,
                today,
                views: Mutex::new(HashMap::new()),
                remote_cache: Mutex::new(RemoteCache::default()),
                fetches: AtomicU64::new(0),
            }),
        }
    }

    pub fn today(&self) -> NaiveDate {
        (self.inner.today)()
    }

    /// Queries both sides and returns the merged, ordered list for `view`.
    pub async fn build_view(&self, view: &ViewKind) -> Result<Vec<UnifiedItem>, StoreError> {
        let (items, fetched) = self.collect(view).await?;
        if let Some(remote) = fetched {
            self.cache_remote(remote);
        }
        Ok(items)
    }

    async fn collect(
        &self,
        view: &ViewKind,
    ) -> Result<(Vec<UnifiedItem>, Option<RemoteFetch>), StoreError> {
        let today = self.today();
        let local = self.inner.store.query(&|_| true, None).await?;
        let fetched = self.fetch_remote().await;

        let mut items: Vec<UnifiedItem> = local
            .into_iter()
            .map(UnifiedItem::Local)
            .chain(
                fetched
                    .iter()
                    .flat_map(|fetch| fetch.tasks.iter().cloned())
                    .map(UnifiedItem::Remote),
            )
            .filter(|item| matches_view(view, item, today))
            .collect();
        sort_items(view, &mut items);
        Ok((items, fetched))
    }

    /// Remote tasks of the active list. `None` when signed out or the fetch fails;
    /// callers then show local items only.
    async fn fetch_remote(&self) -> Option<RemoteFetch> {
        let provider = self.inner.provider.as_ref()?;
        if !self.inner.session.is_signed_in() {
            return None;
        }
        let ticket = self.inner.fetches.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        let list_id = self.inner.session.active_list();
        let result = provider.list_tasks(&list_id).await;
        self.inner.session.observe(&result);
        match result {
            Ok(tasks) => Some(RemoteFetch { ticket, tasks }),
            Err(err) => {
                log::warn!("remote task fetch failed list={list_id} err={err}; showing local only");
                None
            }
        }
    }

    /// Keeps `fetch` unless a fetch that started later was cached already.
    fn cache_remote(&self, fetch: RemoteFetch) {
        let mut cache = self.inner.remote_cache.lock().expect("aggregator poisoned");
        if fetch.ticket > cache.ticket {
            *cache = RemoteCache {
                ticket: fetch.ticket,
                tasks: fetch.tasks,
            };
        } else {
            log::debug!(
                "keeping newer remote snapshot cached={} fetched={}",
                cache.ticket,
                fetch.ticket
            );
        }
    }

    /// Live output for `view`. The first value is empty until a refresh runs.
    pub fn subscribe(&self, view: ViewKind) -> watch::Receiver<ViewItems> {
        let mut views = self.inner.views.lock().expect("aggregator poisoned");
        views
            .entry(view)
            .or_insert_with(|| ViewSlot {
                items: watch::channel(Arc::new(Vec::new())).0,
                generation: 0,
            })
            .items
            .subscribe()
    }

    /// Rebuilds `view` and publishes it. Returns `None` when a newer refresh of
    /// the same view started meanwhile; its result wins and this one is dropped.
    pub async fn refresh(&self, view: ViewKind) -> Result<Option<ViewItems>, StoreError> {
        let generation = {
            let mut views = self.inner.views.lock().expect("aggregator poisoned");
            let slot = views.entry(view).or_insert_with(|| ViewSlot {
                items: watch::channel(Arc::new(Vec::new())).0,
                generation: 0,
            });
            slot.generation += 1;
            slot.generation
        };

        let (items, fetched) = self.collect(&view).await?;
        let items = Arc::new(items);

        let views = self.inner.views.lock().expect("aggregator poisoned");
        match views.get(&view) {
            Some(slot) if slot.generation == generation => {
                if let Some(remote) = fetched {
                    self.cache_remote(remote);
                }
                slot.items.send_replace(Arc::clone(&items));
                Ok(Some(items))
            }
            _ => {
                log::debug!("dropping stale view refresh view={view:?} generation={generation}");
                Ok(None)
            }
        }
    }

    /// Refreshes every view someone still listens to and forgets the rest.
    pub async fn refresh_live_views(&self) {
        let live: Vec<ViewKind> = {
            let mut views = self.inner.views.lock().expect("aggregator poisoned");
            views.retain(|_, slot| slot.items.receiver_count() > 0);
            views.keys().copied().collect()
        };
        for view in live {
            if let Err(err) = self.refresh(view).await {
                log::warn!("view refresh failed view={view:?} err={err}");
            }
        }
    }

    /// Re-queries live views after every store change and every sign-in change.
    pub fn spawn_refresh_loop(&self) -> JoinHandle<()> {
        let aggregator = self.clone();
        let mut events = self.inner.store.subscribe();
        let mut signed_in = self.inner.session.watch();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    },
                    changed = signed_in.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                aggregator.refresh_live_views().await;
            }
        })
    }

    /// Finds the item behind `key`. Remote items come from the newest fetch,
    /// then from whatever a live view currently shows.
    pub async fn resolve(&self, key: &UnifiedKey) -> Result<UnifiedItem, ItemError> {
        match key {
            UnifiedKey::Local(id) => self
                .inner
                .store
                .get(*id)
                .await?
                .map(UnifiedItem::Local)
                .ok_or_else(|| ItemError::UnknownKey(key.to_string())),
            UnifiedKey::Remote(remote_id) => self
                .cached_remote(remote_id)
                .or_else(|| self.published_remote(remote_id))
                .map(UnifiedItem::Remote)
                .ok_or_else(|| ItemError::UnknownKey(key.to_string())),
        }
    }

    fn cached_remote(&self, remote_id: &str) -> Option<RemoteTask> {
        self.inner
            .remote_cache
            .lock()
            .expect("aggregator poisoned")
            .tasks
            .iter()
            .find(|task| task.remote_id == remote_id)
            .cloned()
    }

    fn published_remote(&self, remote_id: &str) -> Option<RemoteTask> {
        let views = self.inner.views.lock().expect("aggregator poisoned");
        views.values().find_map(|slot| {
            slot.items.borrow().iter().find_map(|item| match item {
                UnifiedItem::Remote(task) if task.remote_id == remote_id => Some(task.clone()),
                _ => None,
            })
        })
    }

    fn remote_provider(&self) -> Result<&Arc<dyn TaskProvider>, RemoteError> {
        match &self.inner.provider {
            Some(provider) if self.inner.session.is_signed_in() => Ok(provider),
            _ => Err(RemoteError::NotAuthenticated),
        }
    }

    /// Flips completion on whichever side owns `item`.
    pub async fn toggle(&self, item: &UnifiedItem) -> Result<TaskStatus, ItemError> {
        match item {
            UnifiedItem::Local(task) => {
                let id = local_id(task)?;
                let updated = self
                    .inner
                    .store
                    .update(id, TaskPatch::status(task.status.toggled()))
                    .await?;
                Ok(updated.status)
            }
            UnifiedItem::Remote(task) => {
                let status = task.status.toggled();
                let provider = self.remote_provider()?;
                let result = provider
                    .set_status(&task.remote_id, &task.list_id, status)
                    .await;
                self.inner.session.observe(&result);
                result?;
                self.refresh_live_views().await;
                Ok(status)
            }
        }
    }

    /// Deletes `item` on whichever side owns it. A removed local task is handed
    /// back so linked external records can be cleaned up.
    pub async fn delete(&self, item: &UnifiedItem) -> Result<Option<Task>, ItemError> {
        match item {
            UnifiedItem::Local(task) => {
                let removed = self.inner.store.delete(local_id(task)?).await?;
                Ok(Some(removed))
            }
            UnifiedItem::Remote(task) => {
                let provider = self.remote_provider()?;
                let result = provider.delete(&task.remote_id, &task.list_id).await;
                self.inner.session.observe(&result);
                result?;
                self.inner
                    .remote_cache
                    .lock()
                    .expect("aggregator poisoned")
                    .tasks
                    .retain(|cached| cached.remote_id != task.remote_id);
                self.refresh_live_views().await;
                Ok(None)
            }
        }
    }

    /// Task lists the provider offers for [`Session::set_active_list`].
    pub async fn remote_lists(&self) -> Result<Vec<RemoteTaskList>, ItemError> {
        let provider = self.remote_provider()?;
        let result = provider.list_lists().await;
        self.inner.session.observe(&result);
        Ok(result?)
    }

    /// Creates a task in the active remote list.
    pub async fn create_remote(&self, fields: RemoteTaskFields) -> Result<RemoteTask, ItemError> {
        let provider = self.remote_provider()?;
        let list_id = self.inner.session.active_list();
        let result = provider.create(&list_id, fields).await;
        self.inner.session.observe(&result);
        let created = result?;
        log::info!("remote task created list={list_id} id={}", created.remote_id);
        self.refresh_live_views().await;
        Ok(created)
    }

    /// Edits a remote-owned task. Local tasks are edited through the store.
    pub async fn update_remote(
        &self,
        task: &RemoteTask,
        fields: RemoteTaskFields,
    ) -> Result<(), ItemError> {
        let provider = self.remote_provider()?;
        let result = provider
            .update(&task.remote_id, &task.list_id, fields)
            .await;
        self.inner.session.observe(&result);
        result?;
        self.refresh_live_views().await;
        Ok(())
    }
}

fn local_id(task: &Task) -> Result<TaskId, ItemError> {
    task.id
        .ok_or_else(|| ItemError::UnknownKey("local:<unsaved>".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalStore;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::{oneshot, Notify};

    #[derive(Default)]
    struct FakeProvider {
        tasks: Mutex<Vec<RemoteTask>>,
        calls: Mutex<Vec<String>>,
        fail_with: Mutex<Option<RemoteError>>,
        gate: Mutex<Option<(oneshot::Receiver<()>, Vec<RemoteTask>)>>,
        entered: Notify,
    }

    impl FakeProvider {
        fn with(tasks: Vec<RemoteTask>) -> Arc<Self> {
            let provider = Self::default();
            *provider.tasks.lock().unwrap() = tasks;
            Arc::new(provider)
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TaskProvider for FakeProvider {
        async fn list_lists(&self) -> Result<Vec<RemoteTaskList>, RemoteError> {
            Ok(Vec::new())
        }

        async fn list_tasks(&self, list_id: &str) -> Result<Vec<RemoteTask>, RemoteError> {
            if let Some(err) = self.fail_with.lock().unwrap().clone() {
                return Err(err);
            }
            let gated = self.gate.lock().unwrap().take();
            if let Some((release, snapshot)) = gated {
                self.entered.notify_one();
                let _ = release.await;
                return Ok(snapshot);
            }
            assert_eq!(list_id, "@default");
            Ok(self.tasks.lock().unwrap().clone())
        }

        async fn create(
            &self,
            list_id: &str,
            fields: RemoteTaskFields,
        ) -> Result<RemoteTask, RemoteError> {
            let mut tasks = self.tasks.lock().unwrap();
            let task = RemoteTask {
                list_id: list_id.to_string(),
                title: fields.title.unwrap_or_default(),
                due: fields.due.flatten(),
                ..remote(&format!("n{}", tasks.len() + 1), None, TaskStatus::Pending)
            };
            tasks.push(task.clone());
            Ok(task)
        }

        async fn set_status(
            &self,
            remote_id: &str,
            _list_id: &str,
            status: TaskStatus,
        ) -> Result<(), RemoteError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("set_status {remote_id} {status:?}"));
            Ok(())
        }

        async fn update(
            &self,
            remote_id: &str,
            _list_id: &str,
            _fields: RemoteTaskFields,
        ) -> Result<(), RemoteError> {
            self.calls.lock().unwrap().push(format!("update {remote_id}"));
            Ok(())
        }

        async fn delete(&self, remote_id: &str, _list_id: &str) -> Result<(), RemoteError> {
            self.calls.lock().unwrap().push(format!("delete {remote_id}"));
            Ok(())
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    const TODAY: (i32, u32, u32) = (2024, 3, 6);

    fn today() -> NaiveDate {
        date(TODAY.0, TODAY.1, TODAY.2)
    }

    fn local(
        id: TaskId,
        kind: TaskKind,
        date: Option<NaiveDate>,
        urgency: Urgency,
        status: TaskStatus,
    ) -> Task {
        let mut task = Task::new(format!("t{id}"), kind, 1);
        task.id = Some(id);
        task.scheduled_date = date;
        task.urgency = urgency;
        task.status = status;
        task
    }

    fn remote(id: &str, due: Option<NaiveDate>, status: TaskStatus) -> RemoteTask {
        RemoteTask {
            remote_id: id.to_string(),
            list_id: "@default".to_string(),
            title: id.to_string(),
            notes: String::new(),
            status,
            due,
            created_at: 0,
        }
    }

    fn aggregator(
        store: &LocalStore,
        provider: Option<Arc<FakeProvider>>,
        signed_in: bool,
    ) -> TaskAggregator {
        TaskAggregator::with_clock(
            Arc::new(store.clone()),
            provider.map(|p| p as Arc<dyn TaskProvider>),
            Session::new(signed_in),
            Arc::new(today),
        )
    }

    fn keys(items: &[UnifiedItem]) -> Vec<String> {
        items.iter().map(|item| item.key().to_string()).collect()
    }

    #[test]
    fn keys_round_trip_through_strings() {
        for key in [UnifiedKey::Local(42), UnifiedKey::Remote("abc:def".to_string())] {
            assert_eq!(key.to_string().parse::<UnifiedKey>().unwrap(), key);
        }
        for bad in ["", "local:", "local:x", "remote:", "other:1", "42"] {
            assert!(bad.parse::<UnifiedKey>().is_err(), "{bad}");
        }
    }

    #[test]
    fn date_outranks_urgency_in_primary_view() {
        let tomorrow = today().succ_opt().unwrap();
        for (today_urgency, tomorrow_urgency) in [
            (Urgency::HIGH, Urgency::LOW),
            (Urgency::LOW, Urgency::HIGH),
        ] {
            let mut items = vec![
                UnifiedItem::Local(local(2, TaskKind::Task, Some(tomorrow), tomorrow_urgency, TaskStatus::Pending)),
                UnifiedItem::Local(local(1, TaskKind::Task, Some(today()), today_urgency, TaskStatus::Pending)),
            ];
            sort_items(&ViewKind::Primary, &mut items);
            assert_eq!(keys(&items), vec!["local:1", "local:2"]);
        }
    }

    #[test]
    fn dated_sort_uses_start_time_then_urgency_then_key() {
        let d = Some(today());
        let mut early = local(5, TaskKind::Meeting, d, Urgency::LOW, TaskStatus::Pending);
        early.start_time = NaiveTime::from_hms_opt(8, 0, 0);
        let mut late = local(4, TaskKind::Meeting, d, Urgency::HIGH, TaskStatus::Pending);
        late.start_time = NaiveTime::from_hms_opt(17, 0, 0);
        let untimed_high = local(3, TaskKind::Task, d, Urgency::HIGH, TaskStatus::Pending);
        let untimed_normal = local(2, TaskKind::Task, d, Urgency::NORMAL, TaskStatus::Pending);
        let undated = local(1, TaskKind::Task, None, Urgency::HIGH, TaskStatus::Pending);

        let mut items = vec![
            UnifiedItem::Local(undated),
            UnifiedItem::Remote(remote("r", d, TaskStatus::Pending)),
            UnifiedItem::Local(untimed_normal),
            UnifiedItem::Local(late),
            UnifiedItem::Local(untimed_high),
            UnifiedItem::Local(early),
        ];
        sort_items(&ViewKind::Primary, &mut items);
        assert_eq!(
            keys(&items),
            vec!["local:5", "local:4", "local:3", "local:2", "remote:r", "local:1"]
        );
    }

    #[test]
    fn sort_is_deterministic_over_permutations() {
        let d = Some(today());
        let base = vec![
            UnifiedItem::Local(local(1, TaskKind::Task, d, Urgency::NORMAL, TaskStatus::Pending)),
            UnifiedItem::Local(local(2, TaskKind::Task, d, Urgency::NORMAL, TaskStatus::Pending)),
            UnifiedItem::Remote(remote("a", d, TaskStatus::Pending)),
            UnifiedItem::Remote(remote("b", None, TaskStatus::Completed)),
            UnifiedItem::Local(local(3, TaskKind::Task, None, Urgency::NORMAL, TaskStatus::Completed)),
        ];
        for view in [ViewKind::Primary, ViewKind::All] {
            let mut expected = base.clone();
            sort_items(&view, &mut expected);
            for rotation in 0..base.len() {
                let mut shuffled = base.clone();
                shuffled.rotate_left(rotation);
                shuffled.reverse();
                sort_items(&view, &mut shuffled);
                assert_eq!(shuffled, expected);
            }
        }
    }

    #[test]
    fn category_sort_puts_pending_first_then_urgency() {
        let mut items = vec![
            UnifiedItem::Local(local(1, TaskKind::Task, None, Urgency::HIGH, TaskStatus::Completed)),
            UnifiedItem::Local(local(2, TaskKind::Task, None, Urgency::LOW, TaskStatus::Pending)),
            UnifiedItem::Local(local(3, TaskKind::Task, None, Urgency::HIGH, TaskStatus::Pending)),
            UnifiedItem::Local(local(4, TaskKind::Task, None, Urgency::LOW, TaskStatus::Cancelled)),
        ];
        sort_items(&ViewKind::ByKind(TaskKind::Task), &mut items);
        assert_eq!(keys(&items), vec!["local:3", "local:2", "local:4", "local:1"]);
    }

    #[test]
    fn view_filters() {
        let yesterday = today().pred_opt().unwrap();
        let pending_past = local(1, TaskKind::Task, Some(yesterday), Urgency::NORMAL, TaskStatus::Pending);
        let pending_today = local(2, TaskKind::Task, Some(today()), Urgency::NORMAL, TaskStatus::Pending);
        let done_today = local(3, TaskKind::Meeting, Some(today()), Urgency::NORMAL, TaskStatus::Completed);
        let undated = local(4, TaskKind::Thought, None, Urgency::NORMAL, TaskStatus::Pending);
        let mut due_in_week = local(5, TaskKind::Task, None, Urgency::NORMAL, TaskStatus::Pending);
        due_in_week.deadline_date = Some(date(2024, 3, 10));

        let primary = ViewKind::Primary;
        let week = ViewKind::week(today(), 0);
        let check = |view: &ViewKind, task: &Task| {
            matches_view(view, &UnifiedItem::Local(task.clone()), today())
        };

        assert!(!check(&primary, &pending_past));
        assert!(check(&primary, &pending_today));
        assert!(!check(&primary, &done_today));
        assert!(check(&primary, &undated));

        assert!(check(&week, &pending_past));
        assert!(!check(&week, &done_today));
        assert!(!check(&week, &undated));
        assert!(check(&week, &due_in_week));

        assert!(check(&ViewKind::ByKind(TaskKind::Meeting), &done_today));
        assert!(!check(&ViewKind::ByKind(TaskKind::Meeting), &undated));
        assert!(matches_view(
            &ViewKind::ByKind(TaskKind::Task),
            &UnifiedItem::Remote(remote("r", None, TaskStatus::Pending)),
            today()
        ));
        assert!(!matches_view(
            &ViewKind::ByKind(TaskKind::Thought),
            &UnifiedItem::Remote(remote("r", None, TaskStatus::Pending)),
            today()
        ));
    }

    #[tokio::test]
    async fn build_view_merges_remote_only_when_signed_in() {
        let store = LocalStore::in_memory();
        store
            .add(local(0, TaskKind::Task, Some(today()), Urgency::HIGH, TaskStatus::Pending))
            .await
            .unwrap();
        let provider = FakeProvider::with(vec![
            remote("r1", Some(today()), TaskStatus::Pending),
            remote("r2", None, TaskStatus::Completed),
        ]);

        let signed_in = aggregator(&store, Some(provider.clone()), true);
        let items = signed_in.build_view(&ViewKind::All).await.unwrap();
        assert_eq!(keys(&items), vec!["local:1", "remote:r1", "remote:r2"]);

        let signed_out = aggregator(&store, Some(provider), false);
        let items = signed_out.build_view(&ViewKind::All).await.unwrap();
        assert_eq!(keys(&items), vec!["local:1"]);
    }

    #[tokio::test]
    async fn remote_failure_falls_back_to_local_and_expires_session() {
        let store = LocalStore::in_memory();
        store.add(Task::new("a", TaskKind::Task, 1)).await.unwrap();
        let provider = FakeProvider::with(vec![remote("r1", None, TaskStatus::Pending)]);
        let aggregator = aggregator(&store, Some(provider.clone()), true);

        *provider.fail_with.lock().unwrap() = Some(RemoteError::Transient("503".to_string()));
        let items = aggregator.build_view(&ViewKind::All).await.unwrap();
        assert_eq!(keys(&items), vec!["local:1"]);
        assert!(aggregator.inner.session.is_signed_in());

        *provider.fail_with.lock().unwrap() = Some(RemoteError::AuthExpired);
        aggregator.build_view(&ViewKind::All).await.unwrap();
        assert!(!aggregator.inner.session.is_signed_in());
    }

    #[tokio::test]
    async fn commands_route_by_origin() {
        for status in [TaskStatus::Pending, TaskStatus::Completed, TaskStatus::Cancelled] {
            let store = LocalStore::in_memory();
            let id = store
                .add(local(0, TaskKind::Task, None, Urgency::NORMAL, status))
                .await
                .unwrap();
            let remote_task = remote("r1", None, status);
            let provider = FakeProvider::with(vec![remote_task.clone()]);
            let aggregator = aggregator(&store, Some(provider.clone()), true);
            let mut events = store.subscribe();

            // Remote commands never touch the store.
            let toggled = aggregator
                .toggle(&UnifiedItem::Remote(remote_task.clone()))
                .await
                .unwrap();
            assert_eq!(toggled, status.toggled());
            assert_eq!(aggregator.delete(&UnifiedItem::Remote(remote_task)).await.unwrap(), None);
            assert!(events.try_recv().is_err());
            assert_eq!(store.get(id).await.unwrap().unwrap().status, status);
            assert_eq!(
                provider.calls(),
                vec![format!("set_status r1 {:?}", status.toggled()), "delete r1".to_string()]
            );

            // Local commands never touch the provider.
            let item = aggregator.resolve(&UnifiedKey::Local(id)).await.unwrap();
            assert_eq!(aggregator.toggle(&item).await.unwrap(), status.toggled());
            let removed = aggregator.delete(&item).await.unwrap().unwrap();
            assert_eq!(removed.status, status.toggled());
            assert!(store.get(id).await.unwrap().is_none());
            assert_eq!(provider.calls().len(), 2);
        }
    }

    #[tokio::test]
    async fn remote_commands_need_a_session() {
        let store = LocalStore::in_memory();
        let provider = FakeProvider::with(Vec::new());
        let aggregator = aggregator(&store, Some(provider.clone()), false);
        let err = aggregator
            .toggle(&UnifiedItem::Remote(remote("r1", None, TaskStatus::Pending)))
            .await
            .unwrap_err();
        assert!(matches!(err, ItemError::Remote(RemoteError::NotAuthenticated)));
        assert!(provider.calls().is_empty());

        assert!(matches!(
            aggregator.resolve(&UnifiedKey::Remote("nope".to_string())).await,
            Err(ItemError::UnknownKey(_))
        ));
        assert!(matches!(
            aggregator.resolve(&UnifiedKey::Local(9)).await,
            Err(ItemError::UnknownKey(_))
        ));
    }

    #[tokio::test]
    async fn created_remote_tasks_show_up_in_live_views() {
        let store = LocalStore::in_memory();
        let provider = FakeProvider::with(Vec::new());
        let aggregator = aggregator(&store, Some(provider), true);
        let rx = aggregator.subscribe(ViewKind::Primary);

        let created = aggregator
            .create_remote(RemoteTaskFields {
                title: Some("Call bank".to_string()),
                due: Some(Some(today())),
                ..RemoteTaskFields::default()
            })
            .await
            .unwrap();
        assert_eq!(created.list_id, "@default");
        assert_eq!(keys(&rx.borrow()), vec![format!("remote:{}", created.remote_id)]);

        let signed_out = aggregator_signed_out(&store);
        assert!(matches!(
            signed_out.create_remote(RemoteTaskFields::default()).await,
            Err(ItemError::Remote(RemoteError::NotAuthenticated))
        ));
    }

    fn aggregator_signed_out(store: &LocalStore) -> TaskAggregator {
        aggregator(store, Some(FakeProvider::with(Vec::new())), false)
    }

    #[tokio::test]
    async fn stale_refresh_does_not_overwrite_newer_output() {
        let store = LocalStore::in_memory();
        let provider = FakeProvider::with(vec![remote("new", None, TaskStatus::Pending)]);
        let (release, gate) = oneshot::channel();
        *provider.gate.lock().unwrap() = Some((gate, vec![remote("old", None, TaskStatus::Pending)]));
        let aggregator = aggregator(&store, Some(provider.clone()), true);
        let view = ViewKind::All;
        let rx = aggregator.subscribe(view);

        let slow = {
            let aggregator = aggregator.clone();
            tokio::spawn(async move { aggregator.refresh(view).await })
        };
        provider.entered.notified().await;

        let fresh = aggregator.refresh(view).await.unwrap().expect("latest refresh publishes");
        assert_eq!(keys(&fresh), vec!["remote:new"]);

        release.send(()).unwrap();
        let stale = slow.await.unwrap().unwrap();
        assert!(stale.is_none());
        assert_eq!(keys(&rx.borrow()), vec!["remote:new"]);
        assert!(aggregator.resolve(&UnifiedKey::Remote("new".to_string())).await.is_ok());
        assert!(aggregator.resolve(&UnifiedKey::Remote("old".to_string())).await.is_err());
    }

    #[tokio::test]
    async fn slow_fetch_for_one_view_keeps_newer_remote_snapshot_of_another() {
        let store = LocalStore::in_memory();
        let provider = FakeProvider::with(vec![remote("new", None, TaskStatus::Pending)]);
        let (release, gate) = oneshot::channel();
        *provider.gate.lock().unwrap() = Some((gate, vec![remote("old", None, TaskStatus::Pending)]));
        let aggregator = aggregator(&store, Some(provider.clone()), true);
        let all = aggregator.subscribe(ViewKind::All);
        let primary = aggregator.subscribe(ViewKind::Primary);

        let slow = {
            let aggregator = aggregator.clone();
            tokio::spawn(async move { aggregator.refresh(ViewKind::All).await })
        };
        provider.entered.notified().await;

        aggregator.refresh(ViewKind::Primary).await.unwrap().expect("primary publishes");
        assert_eq!(keys(&primary.borrow()), vec!["remote:new"]);

        release.send(()).unwrap();
        slow.await.unwrap().unwrap().expect("only refresh of its view");
        assert_eq!(keys(&all.borrow()), vec!["remote:old"]);
        // Items still shown by a live view stay addressable.
        assert!(aggregator.resolve(&UnifiedKey::Remote("old".to_string())).await.is_ok());

        let item = aggregator
            .resolve(&UnifiedKey::Remote("new".to_string()))
            .await
            .unwrap();
        assert_eq!(aggregator.toggle(&item).await.unwrap(), TaskStatus::Completed);
        assert_eq!(provider.calls(), vec!["set_status new Completed"]);

        aggregator.build_view(&ViewKind::All).await.unwrap();
        assert!(aggregator.resolve(&UnifiedKey::Remote("new".to_string())).await.is_ok());
    }

    #[tokio::test]
    async fn subscribers_see_store_changes() {
        let store = LocalStore::in_memory();
        let aggregator = aggregator(&store, None, false);
        let mut rx = aggregator.subscribe(ViewKind::Primary);
        let _loop = aggregator.spawn_refresh_loop();

        let id = store
            .add(local(0, TaskKind::Task, Some(today()), Urgency::NORMAL, TaskStatus::Pending))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .expect("view refreshed")
            .unwrap();
        assert_eq!(keys(&rx.borrow_and_update()), vec![format!("local:{id}")]);

        store
            .update(id, TaskPatch::status(TaskStatus::Completed))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .expect("view refreshed")
            .unwrap();
        assert!(rx.borrow().is_empty());
    }
}
