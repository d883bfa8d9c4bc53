use std::sync::Arc;

use crate::aggregator::{TaskAggregator, UnifiedItem, UnifiedKey, ViewKind};
use crate::calendar::{push_to_calendar, remove_from_calendar, CalendarPush, CalendarService};
use crate::capture::{apply_draft, AudioClip, Captured, StructuringService};
use crate::config::{is_device_local, KEY_ACCESS_TOKEN, KEY_ACTIVE_LIST};
use crate::dates::now_millis;
use crate::error::{ItemError, StoreError};
use crate::events::SyncStatus;
use crate::models::{
    RemoteTask, RemoteTaskFields, RemoteTaskList, Setting, Task, TaskId, TaskKind, TaskPatch,
    TaskStatus,
};
use crate::session::Session;
use crate::store::RecordStore;
use crate::sync::{BackupOutcome, SyncEngine};

#[derive(Debug, serde::Serialize)]
pub struct CommandResult<T> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

fn ok<T>(data: T) -> CommandResult<T> {
    CommandResult {
        ok: true,
        data: Some(data),
        error: None,
    }
}

fn err<T>(message: &str) -> CommandResult<T> {
    CommandResult {
        ok: false,
        data: None,
        error: Some(message.to_string()),
    }
}

fn from_result<T, E: std::fmt::Display>(result: Result<T, E>) -> CommandResult<T> {
    match result {
        Ok(data) => ok(data),
        Err(error) => err(&error.to_string()),
    }
}

/// Everything a command can reach. Cheap to clone.
#[derive(Clone)]
pub struct AppContext {
    pub store: Arc<dyn RecordStore>,
    pub session: Session,
    pub engine: SyncEngine,
    pub aggregator: TaskAggregator,
    pub calendar: Option<Arc<dyn CalendarService>>,
    pub structuring: Option<Arc<dyn StructuringService>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StatePayload {
    pub tasks: Vec<Task>,
    /// Device-local keys (the access token among them) are left out.
    pub settings: Vec<Setting>,
    pub sync: SyncStatus,
    pub signed_in: bool,
    pub active_list: String,
}

pub async fn load_state(ctx: &AppContext) -> CommandResult<StatePayload> {
    let tasks = match ctx.store.query(&|_| true, None).await {
        Ok(tasks) => tasks,
        Err(error) => return err(&error.to_string()),
    };
    let settings = match ctx.store.settings().await {
        Ok(settings) => settings,
        Err(error) => return err(&error.to_string()),
    };
    ok(StatePayload {
        tasks,
        settings: settings
            .into_iter()
            .filter(|s| !is_device_local(&s.key))
            .collect(),
        sync: ctx.engine.status_snapshot(),
        signed_in: ctx.session.is_signed_in(),
        active_list: ctx.session.active_list(),
    })
}

pub async fn create_task(ctx: &AppContext, task: Task) -> CommandResult<Task> {
    if task.title.trim().is_empty() {
        return err("title is required");
    }
    let mut task = task;
    if task.created_at == 0 {
        task.created_at = now_millis();
    }
    match ctx.store.add(task.clone()).await {
        Ok(id) => {
            task.id = Some(id);
            ok(task)
        }
        Err(error) => err(&error.to_string()),
    }
}

pub async fn update_task(ctx: &AppContext, id: TaskId, patch: TaskPatch) -> CommandResult<Task> {
    from_result(ctx.store.update(id, patch).await)
}

pub async fn toggle_sub_item(
    ctx: &AppContext,
    id: TaskId,
    sub_item_id: &str,
) -> CommandResult<Task> {
    let mut task = match ctx.store.get(id).await {
        Ok(Some(task)) => task,
        Ok(None) => return err(&StoreError::NotFound(id).to_string()),
        Err(error) => return err(&error.to_string()),
    };
    if !task.toggle_sub_item(sub_item_id) {
        return err(&format!("sub-item {sub_item_id:?} not found"));
    }
    let patch = TaskPatch {
        sub_items: Some(task.sub_items),
        progress: Some(task.progress),
        remaining_duration: Some(task.remaining_duration),
        total_duration: Some(task.total_duration),
        ..TaskPatch::default()
    };
    from_result(ctx.store.update(id, patch).await)
}

async fn resolve_key(ctx: &AppContext, key: &str) -> Result<UnifiedItem, ItemError> {
    let key: UnifiedKey = key
        .parse()
        .map_err(|_| ItemError::UnknownKey(key.to_string()))?;
    ctx.aggregator.resolve(&key).await
}

/// Flips completion of the item behind a unified key, on whichever side owns it.
pub async fn toggle_item(ctx: &AppContext, key: &str) -> CommandResult<TaskStatus> {
    let item = match resolve_key(ctx, key).await {
        Ok(item) => item,
        Err(error) => return err(&error.to_string()),
    };
    from_result(ctx.aggregator.toggle(&item).await)
}

/// Deletes the item behind a unified key. A linked calendar event goes with a
/// local task.
pub async fn delete_item(ctx: &AppContext, key: &str) -> CommandResult<bool> {
    let item = match resolve_key(ctx, key).await {
        Ok(item) => item,
        Err(error) => return err(&error.to_string()),
    };
    match ctx.aggregator.delete(&item).await {
        Ok(Some(removed)) => {
            if let Some(calendar) = &ctx.calendar {
                remove_from_calendar(calendar.as_ref(), &ctx.session, &removed).await;
            }
            ok(true)
        }
        Ok(None) => ok(true),
        Err(error) => err(&error.to_string()),
    }
}

pub async fn list_view(ctx: &AppContext, view: ViewKind) -> CommandResult<Vec<UnifiedItem>> {
    match ctx.aggregator.refresh(view).await {
        Ok(Some(items)) => ok(Vec::clone(&items)),
        // A newer refresh of the same view won; hand back what it published.
        Ok(None) => {
            let current = ctx.aggregator.subscribe(view);
            let items = Vec::clone(&current.borrow());
            ok(items)
        }
        Err(error) => err(&error.to_string()),
    }
}

/// Week view `offset` weeks from the current one.
pub async fn list_week(ctx: &AppContext, offset: i64) -> CommandResult<Vec<UnifiedItem>> {
    list_view(ctx, ViewKind::week(ctx.aggregator.today(), offset)).await
}

pub async fn list_remote_lists(ctx: &AppContext) -> CommandResult<Vec<RemoteTaskList>> {
    from_result(ctx.aggregator.remote_lists().await)
}

pub async fn set_active_list(ctx: &AppContext, list_id: String) -> CommandResult<bool> {
    if list_id.trim().is_empty() {
        return err("list id is required");
    }
    if let Err(error) = ctx.store.put_setting(KEY_ACTIVE_LIST, &list_id).await {
        return err(&error.to_string());
    }
    ctx.session.set_active_list(list_id);
    ctx.aggregator.refresh_live_views().await;
    ok(true)
}

pub async fn create_remote_task(
    ctx: &AppContext,
    fields: RemoteTaskFields,
) -> CommandResult<RemoteTask> {
    from_result(ctx.aggregator.create_remote(fields).await)
}

pub async fn update_remote_task(
    ctx: &AppContext,
    key: &str,
    fields: RemoteTaskFields,
) -> CommandResult<bool> {
    match resolve_key(ctx, key).await {
        Ok(UnifiedItem::Remote(task)) => {
            from_result(ctx.aggregator.update_remote(&task, fields).await.map(|()| true))
        }
        Ok(UnifiedItem::Local(_)) => err("local tasks are edited with update_task"),
        Err(error) => err(&error.to_string()),
    }
}

pub async fn backup_now(ctx: &AppContext) -> CommandResult<BackupOutcome> {
    from_result(ctx.engine.backup().await)
}

/// Replaces every local task with the cloud copy. `confirmed` must be set.
pub async fn restore_backup(ctx: &AppContext, confirmed: bool) -> CommandResult<usize> {
    from_result(ctx.engine.restore(confirmed).await)
}

pub fn sync_status(ctx: &AppContext) -> CommandResult<SyncStatus> {
    ok(ctx.engine.status_snapshot())
}

pub async fn save_setting(ctx: &AppContext, key: &str, value: &str) -> CommandResult<bool> {
    if key == KEY_ACCESS_TOKEN {
        return sign_in(ctx, value).await;
    }
    if let Err(error) = ctx.store.put_setting(key, value).await {
        return err(&error.to_string());
    }
    refresh_credentials(ctx).await;
    ok(true)
}

pub async fn delete_setting(ctx: &AppContext, key: &str) -> CommandResult<bool> {
    if key == KEY_ACCESS_TOKEN {
        return sign_out(ctx).await;
    }
    if let Err(error) = ctx.store.delete_setting(key).await {
        return err(&error.to_string());
    }
    refresh_credentials(ctx).await;
    ok(true)
}

async fn refresh_credentials(ctx: &AppContext) {
    if let Err(error) = ctx.engine.reload_credentials().await {
        log::warn!("credential reload failed: {error}");
    }
}

/// Stores a freshly issued access token and marks the session signed in. The sync
/// engine reacts with its startup restore check.
pub async fn sign_in(ctx: &AppContext, token: &str) -> CommandResult<bool> {
    let token = token.trim();
    if token.is_empty() {
        return err("access token is empty");
    }
    if let Err(error) = ctx.store.put_setting(KEY_ACCESS_TOKEN, token).await {
        return err(&error.to_string());
    }
    refresh_credentials(ctx).await;
    ctx.session.sign_in();
    log::info!("signed in");
    ok(true)
}

pub async fn sign_out(ctx: &AppContext) -> CommandResult<bool> {
    ctx.session.sign_out();
    match ctx.store.delete_setting(KEY_ACCESS_TOKEN).await {
        Ok(()) => {}
        Err(error) if error.is_not_found() => {}
        Err(error) => return err(&error.to_string()),
    }
    refresh_credentials(ctx).await;
    log::info!("signed out");
    ok(true)
}

pub async fn sync_to_calendar(ctx: &AppContext, id: TaskId) -> CommandResult<CalendarPush> {
    let Some(calendar) = &ctx.calendar else {
        return err("calendar is not configured");
    };
    from_result(push_to_calendar(ctx.store.as_ref(), calendar.as_ref(), &ctx.session, id).await)
}

/// Structures a voice note into a new task, or into `target` when re-dictating.
/// A new meeting also lands in the calendar while signed in.
pub async fn capture(
    ctx: &AppContext,
    clip: AudioClip,
    target: Option<TaskId>,
) -> CommandResult<Task> {
    let Some(structuring) = &ctx.structuring else {
        return err("voice capture is not configured");
    };
    let existing = match target {
        Some(id) => match ctx.store.get(id).await {
            Ok(Some(task)) => Some(task),
            Ok(None) => return err(&StoreError::NotFound(id).to_string()),
            Err(error) => return err(&error.to_string()),
        },
        None => None,
    };
    let draft = match structuring.structure(&clip, existing.as_ref()).await {
        Ok(draft) => draft,
        Err(error) => return err(&error.to_string()),
    };
    let today = ctx.aggregator.today();
    match apply_draft(ctx.store.as_ref(), draft, target, today, now_millis()).await {
        Ok(Captured::Created(task)) if task.kind == TaskKind::Meeting => {
            ok(push_new_meeting(ctx, task).await)
        }
        Ok(captured) => ok(captured.task().clone()),
        Err(error) => err(&error.to_string()),
    }
}

async fn push_new_meeting(ctx: &AppContext, task: Task) -> Task {
    let (Some(calendar), Some(id)) = (&ctx.calendar, task.id) else {
        return task;
    };
    if !ctx.session.is_signed_in() {
        return task;
    }
    match push_to_calendar(ctx.store.as_ref(), calendar.as_ref(), &ctx.session, id).await {
        Ok(_) => match ctx.store.get(id).await {
            Ok(Some(updated)) => updated,
            _ => task,
        },
        Err(error) => {
            log::warn!("calendar push for captured meeting failed task={id} err={error}");
            task
        }
    }
}
