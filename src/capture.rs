use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use serde_json::Value;

use crate::calendar::default_start_time;
use crate::error::{CaptureError, StoreError};
use crate::models::{
    parse_hhmm, SubItem, Task, TaskId, TaskKind, TaskPatch, TaskStatus, Timestamp, Urgency,
};
use crate::store::RecordStore;

const DEFAULT_TITLE: &str = "New entry";
const MEETING_MINUTES: u32 = 60;
const OTHER_MINUTES: u32 = 30;
const MAX_SUB_ITEMS: usize = 12;

/// Recorded audio handed to the structuring service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// The assistant's partial reading of a capture. Absent fields were not mentioned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskDraft {
    pub title: Option<String>,
    pub description: Option<String>,
    pub internal_notes: Option<String>,
    /// Raw kind word as spoken; see [`normalize_kind`].
    pub kind: Option<String>,
    pub urgency: Option<Urgency>,
    pub scheduled_date: Option<NaiveDate>,
    pub deadline_date: Option<NaiveDate>,
    pub start_time: Option<NaiveTime>,
    pub duration: Option<u32>,
    pub sub_items: Option<Vec<SubItem>>,
    pub progress: Option<u8>,
}

/// Turns raw audio into a draft. `existing` is the record being re-dictated, if any.
#[async_trait]
pub trait StructuringService: Send + Sync {
    async fn structure(
        &self,
        clip: &AudioClip,
        existing: Option<&Task>,
    ) -> Result<TaskDraft, CaptureError>;
}

/// Instruction text for a structuring model.
pub fn build_prompt(today: NaiveDate, now: NaiveTime, existing: Option<&Task>) -> String {
    let mut prompt = format!(
        "You turn a voice note into one structured record.\n\
         Today is {today} (time {now}).\n\
         Reply with a single JSON object only, using these fields:\n\
         - title: short, at most 5 words; meetings as \"NAME: TOPIC\"\n\
         - description: the essence of the note\n\
         - internalNotes: previous notes followed by new ones\n\
         - type: task | meeting | thought\n\
         - urgency: 3 urgent, 2 normal (default), 1 none\n\
         - tasks: always set deadline (YYYY-MM-DD), startTime defaults to \"15:00\"\n\
         - meetings: set date (YYYY-MM-DD) and startTime (HH:MM)\n\
         - duration: minutes of effort when mentioned\n",
        today = today.format("%Y-%m-%d"),
        now = now.format("%H:%M:%S"),
    );
    if let Some(task) = existing {
        prompt.push_str(&format!(
            "\nThe note updates this record and overrides it where they differ:\n\
             - title: {}\n- description: {}\n- type: {}\n- date: {}\n- internalNotes: {}\n",
            task.title,
            task.description,
            kind_word(task.kind),
            task.scheduled_date
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
            task.internal_notes,
        ));
    }
    prompt
}

fn kind_word(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::Task => "task",
        TaskKind::Meeting => "meeting",
        TaskKind::Thought => "thought",
    }
}

/// Maps the assistant's kind vocabulary (English or Czech) onto [`TaskKind`].
pub fn normalize_kind(raw: &str) -> Option<TaskKind> {
    let lowered = raw.trim().to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| lowered.contains(w));
    if has(&["task", "úkol"]) {
        Some(TaskKind::Task)
    } else if has(&["meeting", "sraz", "schůzka"]) {
        Some(TaskKind::Meeting)
    } else if has(&["thought", "myšlenka", "note"]) {
        Some(TaskKind::Thought)
    } else {
        None
    }
}

pub fn parse_draft(text: &str) -> Result<TaskDraft, CaptureError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(CaptureError::Empty);
    }

    let mut candidate = trimmed;
    if let Some(stripped) = strip_fenced_code_block(candidate) {
        candidate = stripped;
    }

    if let Ok(value) = serde_json::from_str::<Value>(candidate) {
        if let Ok(draft) = draft_from_value(&value) {
            return Ok(draft);
        }
    }

    // Fallback: the first {...} region.
    if let Some(extracted) = extract_first_json_object(candidate) {
        if let Ok(value) = serde_json::from_str::<Value>(extracted) {
            return draft_from_value(&value);
        }
    }

    Err(CaptureError::Parse("no json object in response".to_string()))
}

fn draft_from_value(value: &Value) -> Result<TaskDraft, CaptureError> {
    let obj = value
        .as_object()
        .ok_or_else(|| CaptureError::Parse("response json must be an object".to_string()))?;

    let text = |key: &str| {
        obj.get(key)
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    let number = |key: &str| match obj.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    let date = |key: &str| {
        text(key).and_then(|s| {
            let date_part = s.get(..10).unwrap_or(&s).to_string();
            NaiveDate::parse_from_str(&date_part, "%Y-%m-%d").ok()
        })
    };

    Ok(TaskDraft {
        title: text("title"),
        description: text("description"),
        internal_notes: text("internalNotes"),
        kind: text("type"),
        urgency: number("urgency")
            .filter(|n| *n >= 0.0)
            .map(|n| Urgency::from(n.round().min(f64::from(u8::MAX)) as u8)),
        scheduled_date: date("date"),
        deadline_date: date("deadline"),
        start_time: text("startTime").and_then(|s| parse_hhmm(&s)),
        duration: number("duration")
            .filter(|n| *n > 0.0)
            .map(|n| n.round().min(f64::from(u32::MAX)) as u32),
        sub_items: sub_items_from_value(obj.get("subTasks")),
        progress: number("progress")
            .filter(|n| *n >= 0.0)
            .map(|n| n.round().min(100.0) as u8),
    })
}

fn sub_items_from_value(value: Option<&Value>) -> Option<Vec<SubItem>> {
    let Some(Value::Array(items)) = value else {
        return None;
    };

    let mut out = Vec::new();
    for (index, item) in items.iter().enumerate() {
        let (id, title, completed) = match item {
            Value::String(title) => (None, title.as_str(), false),
            Value::Object(map) => {
                let Some(Value::String(title)) = map.get("title") else {
                    continue;
                };
                (
                    map.get("id").and_then(Value::as_str),
                    title.as_str(),
                    map.get("completed").and_then(Value::as_bool).unwrap_or(false),
                )
            }
            _ => continue,
        };
        let title = title.trim();
        if title.is_empty() {
            continue;
        }
        out.push(SubItem {
            id: id
                .map(str::to_string)
                .unwrap_or_else(|| format!("s{}", index + 1)),
            title: title.to_string(),
            completed,
        });
    }
    out.truncate(MAX_SUB_ITEMS);
    Some(out)
}

fn strip_fenced_code_block(text: &str) -> Option<&str> {
    let mut s = text.trim();
    if !s.starts_with("```") {
        return None;
    }
    s = &s[s.find('\n')? + 1..];
    let end = s.rfind("```")?;
    Some(s[..end].trim())
}

fn extract_first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(text[start..=end].trim())
}

#[derive(Debug, Clone, PartialEq)]
pub enum Captured {
    Created(Task),
    Updated(Task),
}

impl Captured {
    pub fn task(&self) -> &Task {
        match self {
            Captured::Created(task) | Captured::Updated(task) => task,
        }
    }
}

/// A new task from `draft`, with defaults for everything the note left out.
pub fn task_from_draft(draft: TaskDraft, today: NaiveDate, now: Timestamp) -> Task {
    let kind = draft
        .kind
        .as_deref()
        .and_then(normalize_kind)
        .unwrap_or(TaskKind::Thought);
    let minutes = draft.duration.unwrap_or(match kind {
        TaskKind::Meeting => MEETING_MINUTES,
        _ => OTHER_MINUTES,
    });
    let scheduled = draft.scheduled_date.unwrap_or(today);

    let mut task = Task::new(
        draft.title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
        kind,
        now,
    );
    task.description = draft.description.unwrap_or_default();
    task.internal_notes = draft.internal_notes.unwrap_or_default();
    task.status = TaskStatus::Pending;
    task.urgency = draft.urgency.unwrap_or_default();
    task.scheduled_date = Some(scheduled);
    task.deadline_date = Some(draft.deadline_date.or(draft.scheduled_date).unwrap_or(today));
    task.start_time = draft
        .start_time
        .or((kind == TaskKind::Meeting).then(default_start_time));
    task.remaining_duration = Some(minutes);
    task.total_duration = Some(minutes);
    task.sub_items = draft.sub_items.unwrap_or_default();
    task.progress = draft.progress.unwrap_or(0);
    task
}

/// Only the fields the note mentioned. An unrecognised kind word leaves the kind alone.
pub fn patch_from_draft(draft: TaskDraft) -> TaskPatch {
    TaskPatch {
        title: draft.title,
        description: draft.description,
        internal_notes: draft.internal_notes,
        kind: draft.kind.as_deref().and_then(normalize_kind),
        urgency: draft.urgency,
        scheduled_date: draft.scheduled_date.map(Some),
        deadline_date: draft.deadline_date.map(Some),
        start_time: draft.start_time.map(Some),
        remaining_duration: draft.duration.map(Some),
        sub_items: draft.sub_items,
        progress: draft.progress,
        ..TaskPatch::default()
    }
}

/// Creates a task from `draft`, or merges it into `target` when re-dictating.
pub async fn apply_draft(
    store: &dyn RecordStore,
    draft: TaskDraft,
    target: Option<TaskId>,
    today: NaiveDate,
    now: Timestamp,
) -> Result<Captured, StoreError> {
    match target {
        Some(id) => {
            let task = store.update(id, patch_from_draft(draft)).await?;
            log::info!("capture merged into task={id}");
            Ok(Captured::Updated(task))
        }
        None => {
            let mut task = task_from_draft(draft, today, now);
            let id = store.add(task.clone()).await?;
            task.id = Some(id);
            log::info!("capture created task={id} kind={:?}", task.kind);
            Ok(Captured::Created(task))
        }
    }
}
