use std::sync::{Arc, Weak};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::{is_device_local, Credentials, SyncConfig, KEY_LAST_SYNC};
use crate::dates::now_millis;
use crate::error::{RemoteError, StoreError, SyncError};
use crate::events::{SyncPhase, SyncStatus};
use crate::models::{BackupData, BackupEnvelope, Timestamp};
use crate::scheduler::{spawn_change_listener, Debouncer};
use crate::session::Session;
use crate::store::RecordStore;
use crate::transport::BackupTransport;

/// What the device knows when deciding whether to pull a cloud envelope down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreInputs {
    pub local_count: usize,
    pub has_credential: bool,
    pub remote_timestamp: Timestamp,
    pub last_sync: Option<Timestamp>,
}

/// An empty or unconfigured device always heals from the cloud copy. A device
/// holding real work keeps it even when the cloud copy is newer; only a nearly
/// empty one (at most `stale_threshold` tasks) is replaced by a newer envelope.
pub fn should_restore(inputs: &RestoreInputs, stale_threshold: usize) -> bool {
    let is_stale = inputs.remote_timestamp > inputs.last_sync.unwrap_or(0)
        && inputs.local_count <= stale_threshold;
    inputs.local_count == 0 || !inputs.has_credential || is_stale
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartupOutcome {
    NoBackup,
    KeptLocal,
    Restored { tasks: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BackupOutcome {
    Written { timestamp: Timestamp, tasks: usize },
    /// An empty snapshot never replaces the cloud copy.
    SkippedEmpty,
}

/// Keeps the local store and the cloud envelope in step.
///
/// Every transport operation takes the same lock, so a manual restore and an
/// automatic backup never interleave.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    store: Arc<dyn RecordStore>,
    transport: Arc<dyn BackupTransport>,
    session: Session,
    config: SyncConfig,
    credentials: std::sync::Mutex<Credentials>,
    op: Mutex<()>,
    status: watch::Sender<SyncStatus>,
    debouncer: Debouncer,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        transport: Arc<dyn BackupTransport>,
        session: Session,
        config: SyncConfig,
        credentials: Credentials,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus::default());
        let debouncer = Debouncer::new(config.debounce_window);
        Self {
            inner: Arc::new(EngineInner {
                store,
                transport,
                session,
                config,
                credentials: std::sync::Mutex::new(credentials),
                op: Mutex::new(()),
                status,
                debouncer,
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    pub fn credentials(&self) -> Credentials {
        self.inner
            .credentials
            .lock()
            .expect("credentials poisoned")
            .clone()
    }

    /// Re-reads credentials from the settings table after a setting changed.
    pub async fn reload_credentials(&self) -> Result<Credentials, StoreError> {
        let settings = self.inner.store.settings().await?;
        let credentials = Credentials::from_settings(&settings);
        *self
            .inner
            .credentials
            .lock()
            .expect("credentials poisoned") = credentials.clone();
        Ok(credentials)
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    pub fn status_snapshot(&self) -> SyncStatus {
        self.inner.status.borrow().clone()
    }

    pub async fn last_sync_marker(&self) -> Result<Option<Timestamp>, StoreError> {
        let raw = self.inner.store.get_setting(KEY_LAST_SYNC).await?;
        Ok(raw.and_then(|value| value.trim().parse().ok()))
    }

    /// Restore decision for a fresh sign-in.
    pub async fn startup_check(&self) -> Result<StartupOutcome, SyncError> {
        self.require_session()?;
        let _guard = self.inner.op.lock().await;
        self.set_phase(SyncPhase::Checking);
        let result = self.startup_check_locked().await;
        self.finish(&result);
        result
    }

    async fn startup_check_locked(&self) -> Result<StartupOutcome, SyncError> {
        let Some(envelope) = self.load_envelope().await? else {
            log::info!("startup check: no cloud backup");
            return Ok(StartupOutcome::NoBackup);
        };

        let store = &self.inner.store;
        let inputs = RestoreInputs {
            local_count: store.count(&|_| true).await?,
            has_credential: self.credentials().has_ai_key(),
            remote_timestamp: envelope.timestamp,
            last_sync: self.last_sync_marker().await?,
        };
        if !should_restore(&inputs, self.inner.config.stale_local_threshold) {
            log::info!("startup check: keeping local data inputs={inputs:?}");
            return Ok(StartupOutcome::KeptLocal);
        }

        log::info!("startup check: restoring cloud backup inputs={inputs:?}");
        let tasks = self.restore_locked(envelope).await?;
        Ok(StartupOutcome::Restored { tasks })
    }

    /// Background variant of [`startup_check`](Self::startup_check): failures are
    /// logged, never raised.
    pub async fn run_startup_check(&self) {
        if let Err(err) = self.startup_check().await {
            log::warn!("startup restore check failed: {err}");
        }
    }

    /// User-initiated backup.
    pub async fn backup(&self) -> Result<BackupOutcome, SyncError> {
        self.require_session()?;
        let _guard = self.inner.op.lock().await;
        self.set_phase(SyncPhase::BackingUp);
        let result = self.backup_locked().await;
        self.finish(&result);
        result
    }

    /// User-initiated restore. Destroys local tasks, so it must be confirmed.
    pub async fn restore(&self, confirmed: bool) -> Result<usize, SyncError> {
        if !confirmed {
            return Err(SyncError::ConfirmationRequired);
        }
        self.require_session()?;
        let _guard = self.inner.op.lock().await;
        self.set_phase(SyncPhase::Checking);
        let result = match self.load_envelope().await {
            Ok(Some(envelope)) => self.restore_locked(envelope).await,
            Ok(None) => Err(SyncError::NothingToRestore),
            Err(err) => Err(err),
        };
        self.finish(&result);
        result
    }

    /// Runs when the debounce window closes. Failures are logged and not retried;
    /// the next local change schedules another attempt.
    async fn auto_backup(&self) {
        if !self.inner.session.is_signed_in() {
            log::debug!("auto backup skipped: not signed in");
            return;
        }
        match self.backup().await {
            Ok(BackupOutcome::Written { timestamp, tasks }) => {
                log::info!("auto backup written tasks={tasks} timestamp={timestamp}");
            }
            Ok(BackupOutcome::SkippedEmpty) => log::info!("auto backup skipped: no tasks"),
            Err(err) => log::warn!("auto backup failed: {err}"),
        }
    }

    /// Restarts the debounce window for an automatic backup.
    pub fn schedule_backup(&self) {
        let engine = Arc::downgrade(&self.inner);
        self.inner.debouncer.schedule(move || async move {
            if let Some(engine) = upgrade(&engine) {
                engine.auto_backup().await;
            }
        });
    }

    /// Runs a debounced backup that is still waiting for its window, right away.
    pub async fn flush_pending_backup(&self) -> Result<Option<BackupOutcome>, SyncError> {
        if !self.inner.debouncer.cancel() {
            return Ok(None);
        }
        log::info!("flushing pending backup");
        self.backup().await.map(Some)
    }

    /// Schedules a backup after every local task mutation.
    pub fn spawn_auto_backup(&self) -> JoinHandle<()> {
        let engine = Arc::downgrade(&self.inner);
        spawn_change_listener(self.inner.store.subscribe(), move || {
            if let Some(engine) = upgrade(&engine) {
                engine.schedule_backup();
            }
        })
    }

    /// Runs the startup check on every transition into the signed-in state.
    pub fn spawn_sign_in_watch(&self) -> JoinHandle<()> {
        let engine = self.clone();
        let mut signed_in = self.inner.session.watch();
        tokio::spawn(async move {
            if *signed_in.borrow_and_update() {
                engine.run_startup_check().await;
            }
            while signed_in.changed().await.is_ok() {
                if *signed_in.borrow_and_update() {
                    engine.run_startup_check().await;
                }
            }
        })
    }

    fn require_session(&self) -> Result<(), SyncError> {
        if self.inner.session.is_signed_in() {
            Ok(())
        } else {
            Err(RemoteError::NotAuthenticated.into())
        }
    }

    async fn load_envelope(&self) -> Result<Option<BackupEnvelope>, SyncError> {
        let result = self.inner.transport.load().await;
        self.inner.session.observe(&result);
        result.map_err(SyncError::from)
    }

    async fn restore_locked(&self, envelope: BackupEnvelope) -> Result<usize, SyncError> {
        self.set_phase(SyncPhase::Restoring);
        let store = &self.inner.store;
        let BackupData { tasks, settings } = envelope.data;
        let count = tasks.len();
        store.replace_tasks(tasks).await?;
        for setting in settings.iter().filter(|s| !is_device_local(&s.key)) {
            store.put_setting(&setting.key, &setting.value).await?;
        }
        self.write_marker(envelope.timestamp).await?;
        self.reload_credentials().await?;
        log::info!(
            "restored cloud backup tasks={count} timestamp={}",
            envelope.timestamp
        );
        Ok(count)
    }

    async fn backup_locked(&self) -> Result<BackupOutcome, SyncError> {
        let store = &self.inner.store;
        let tasks = store.query(&|_| true, None).await?;
        if tasks.is_empty() {
            return Ok(BackupOutcome::SkippedEmpty);
        }
        let settings = store
            .settings()
            .await?
            .into_iter()
            .filter(|s| !is_device_local(&s.key))
            .collect();

        let timestamp = now_millis();
        let count = tasks.len();
        let envelope = BackupEnvelope {
            version: self.inner.config.envelope_version.clone(),
            timestamp,
            data: BackupData { tasks, settings },
        };
        let result = self.inner.transport.save(&envelope).await;
        self.inner.session.observe(&result);
        result?;
        self.write_marker(timestamp).await?;
        Ok(BackupOutcome::Written {
            timestamp,
            tasks: count,
        })
    }

    async fn write_marker(&self, timestamp: Timestamp) -> Result<(), StoreError> {
        self.inner
            .store
            .put_setting(KEY_LAST_SYNC, &timestamp.to_string())
            .await?;
        self.inner.status.send_modify(|status| {
            status.last_synced_at = Some(timestamp);
        });
        Ok(())
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.inner.status.send_modify(|status| status.phase = phase);
    }

    fn finish<T>(&self, result: &Result<T, SyncError>) {
        self.inner.status.send_modify(|status| {
            status.phase = SyncPhase::Idle;
            status.last_error = result.as_ref().err().map(ToString::to_string);
        });
    }
}

fn upgrade(inner: &Weak<EngineInner>) -> Option<SyncEngine> {
    inner.upgrade().map(|inner| SyncEngine { inner })
}
