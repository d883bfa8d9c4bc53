use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};

use crate::error::{RemoteError, StoreError, SyncError};
use crate::models::{Task, TaskId, TaskKind, TaskPatch};
use crate::session::Session;
use crate::store::RecordStore;

const EVENT_PREFIX: &str = "[BATTLE PLAN]";
const DEFAULT_EVENT_MINUTES: u32 = 60;

/// External calendar. Events are keyed by the id it hands back.
#[async_trait]
pub trait CalendarService: Send + Sync {
    /// Creates an event for `task`, or rewrites `existing_id` in place. Returns the
    /// event id.
    async fn upsert_event(
        &self,
        task: &Task,
        existing_id: Option<&str>,
    ) -> Result<String, RemoteError>;
    async fn delete_event(&self, event_id: &str) -> Result<(), RemoteError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

pub fn default_start_time() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN)
}

/// Local wall-clock span of the event for `task`.
pub fn event_window(task: &Task, today: NaiveDate) -> EventWindow {
    let date = task.effective_date().unwrap_or(today);
    let time = task.start_time.unwrap_or_else(default_start_time);
    let minutes = task
        .remaining_duration
        .filter(|m| *m > 0)
        .or(task.total_duration.filter(|m| *m > 0))
        .unwrap_or(DEFAULT_EVENT_MINUTES);
    let start = date.and_time(time);
    EventWindow {
        start,
        end: start + Duration::minutes(i64::from(minutes)),
    }
}

pub fn event_title(task: &Task) -> String {
    format!("{EVENT_PREFIX} {}", task.title)
}

pub fn event_description(task: &Task) -> String {
    format!(
        "{}\n\nInternal notes:\n{}",
        task.description, task.internal_notes
    )
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "outcome", content = "event_id", rename_all = "snake_case")]
pub enum CalendarPush {
    Created(String),
    Updated(String),
    /// Only meetings go to the calendar.
    NotAMeeting,
}

/// Pushes a local meeting to the calendar, reusing its stored event id so repeated
/// pushes update one event instead of creating duplicates.
pub async fn push_to_calendar(
    store: &dyn RecordStore,
    calendar: &dyn CalendarService,
    session: &Session,
    id: TaskId,
) -> Result<CalendarPush, SyncError> {
    let task = store.get(id).await?.ok_or(StoreError::NotFound(id))?;
    if task.kind != TaskKind::Meeting {
        return Ok(CalendarPush::NotAMeeting);
    }
    if !session.is_signed_in() {
        return Err(RemoteError::NotAuthenticated.into());
    }

    let existing = task.origin_external_id.clone();
    let result = calendar.upsert_event(&task, existing.as_deref()).await;
    session.observe(&result);
    let event_id = result?;

    if existing.as_deref() != Some(event_id.as_str()) {
        store
            .update(
                id,
                TaskPatch {
                    origin_external_id: Some(Some(event_id.clone())),
                    ..TaskPatch::default()
                },
            )
            .await?;
    }
    log::info!("calendar push task={id} event={event_id}");
    Ok(match existing {
        Some(_) => CalendarPush::Updated(event_id),
        None => CalendarPush::Created(event_id),
    })
}

/// Removes the linked event, if any. Failures are logged, never raised.
pub async fn remove_from_calendar(calendar: &dyn CalendarService, session: &Session, task: &Task) {
    let Some(event_id) = task.origin_external_id.as_deref() else {
        return;
    };
    if !session.is_signed_in() {
        return;
    }
    let result = calendar.delete_event(event_id).await;
    session.observe(&result);
    if let Err(err) = result {
        log::warn!("calendar event delete failed event={event_id} err={err}");
    }
}
