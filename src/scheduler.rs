use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::events::{ChangeOrigin, StoreEvent};

/// Runs an action once a quiet period has passed since the last `schedule` call.
///
/// Scheduling again before the window elapses cancels the pending timer and starts
/// a new one. Once the timer fires, the action runs as its own task, so a later
/// `schedule` or `cancel` never aborts an action that already started.
pub struct Debouncer {
    window: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Mutex::new(None),
        }
    }

    pub fn schedule<F, Fut>(&self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let window = self.window;
        let mut pending = self.pending.lock().expect("debouncer poisoned");
        if let Some(previous) = pending.take() {
            previous.abort();
        }
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            tokio::spawn(action());
        }));
    }

    /// Drops the pending timer. Returns `true` if one was still waiting.
    pub fn cancel(&self) -> bool {
        let handle = self.pending.lock().expect("debouncer poisoned").take();
        match handle {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                true
            }
            _ => false,
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(handle) = pending.take() {
                handle.abort();
            }
        }
    }
}

/// Calls `on_local_change` for every user-driven task mutation. Restores and
/// settings writes are ignored. A lagging receiver counts as a change.
pub fn spawn_change_listener<F>(
    mut events: broadcast::Receiver<StoreEvent>,
    mut on_local_change: F,
) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(StoreEvent::TasksChanged(ChangeOrigin::Local)) => on_local_change(),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    log::debug!("change listener lagged skipped={skipped}");
                    on_local_change();
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
