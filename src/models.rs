use std::ops::RangeInclusive;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

/// Epoch milliseconds.
pub type Timestamp = i64;
pub type TaskId = i64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Task,
    Meeting,
    #[serde(alias = "note")]
    Thought,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn toggled(self) -> Self {
        match self {
            TaskStatus::Completed => TaskStatus::Pending,
            TaskStatus::Pending | TaskStatus::Cancelled => TaskStatus::Completed,
        }
    }
}

/// Bounded urgency ordinal, higher is more urgent. Persisted as the bare number.
///
/// Capture and the UI work on the three named steps. Older envelopes used a 1-5
/// scale; those values are kept as they are, so a restore followed by a backup
/// writes them back unchanged. Anything outside [`Urgency::SCALE`] is clamped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(from = "u8", into = "u8")]
pub struct Urgency(u8);

impl Urgency {
    pub const SCALE: RangeInclusive<u8> = 1..=5;
    pub const LOW: Urgency = Urgency(1);
    pub const NORMAL: Urgency = Urgency(2);
    pub const HIGH: Urgency = Urgency(3);

    pub fn new(level: u8) -> Self {
        Urgency(level.clamp(*Self::SCALE.start(), *Self::SCALE.end()))
    }

    pub fn level(self) -> u8 {
        self.0
    }
}

impl Default for Urgency {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl From<u8> for Urgency {
    fn from(value: u8) -> Self {
        Urgency::new(value)
    }
}

impl From<Urgency> for u8 {
    fn from(value: Urgency) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubItem {
    pub id: String,
    pub title: String,
    pub completed: bool,
}

/// A locally-owned record. Remote-provider records never take this shape; they
/// live in [`RemoteTask`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TaskId>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub internal_notes: String,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub status: TaskStatus,
    #[serde(default, rename = "date", with = "wire::opt_date")]
    pub scheduled_date: Option<NaiveDate>,
    #[serde(default, rename = "deadline", with = "wire::opt_date")]
    pub deadline_date: Option<NaiveDate>,
    #[serde(default, with = "wire::opt_hhmm")]
    pub start_time: Option<NaiveTime>,
    #[serde(default)]
    pub urgency: Urgency,
    #[serde(default, rename = "subTasks")]
    pub sub_items: Vec<SubItem>,
    #[serde(default)]
    pub progress: u8,
    #[serde(default, rename = "duration")]
    pub remaining_duration: Option<u32>,
    #[serde(default)]
    pub total_duration: Option<u32>,
    pub created_at: Timestamp,
    #[serde(
        default,
        rename = "googleEventId",
        skip_serializing_if = "Option::is_none"
    )]
    pub origin_external_id: Option<String>,
}

impl Task {
    pub fn new(title: impl Into<String>, kind: TaskKind, created_at: Timestamp) -> Self {
        Self {
            id: None,
            title: title.into(),
            description: String::new(),
            internal_notes: String::new(),
            kind,
            status: TaskStatus::Pending,
            scheduled_date: None,
            deadline_date: None,
            start_time: None,
            urgency: Urgency::default(),
            sub_items: Vec::new(),
            progress: 0,
            remaining_duration: None,
            total_duration: None,
            created_at,
            origin_external_id: None,
        }
    }

    /// Scheduled date, falling back to the deadline.
    pub fn effective_date(&self) -> Option<NaiveDate> {
        self.scheduled_date.or(self.deadline_date)
    }

    /// Flips one sub-item and recomputes the derived fields. Returns `false` when
    /// no sub-item has that id.
    pub fn toggle_sub_item(&mut self, sub_item_id: &str) -> bool {
        let Some(item) = self.sub_items.iter_mut().find(|s| s.id == sub_item_id) else {
            return false;
        };
        item.completed = !item.completed;
        self.recompute_progress();
        self.sync_remaining_duration();
        true
    }

    fn recompute_progress(&mut self) {
        if self.sub_items.is_empty() {
            return;
        }
        let done = self.sub_items.iter().filter(|s| s.completed).count();
        self.progress = progress_percent(done, self.sub_items.len());
    }

    fn sync_remaining_duration(&mut self) {
        let total = self
            .total_duration
            .or(self.remaining_duration)
            .unwrap_or(0);
        self.total_duration = Some(total);
        self.remaining_duration = Some(remaining_after(total, self.progress));
    }

    /// Shallow merge. `id` and `created_at` are never touched.
    pub fn apply_patch(&mut self, patch: TaskPatch) {
        let previous_progress = self.progress;
        let remaining_given = patch.remaining_duration.is_some();
        let sub_items_given = patch.sub_items.is_some();

        if let Some(title) = patch.title {
            self.title = title;
        }
        if let Some(description) = patch.description {
            self.description = description;
        }
        if let Some(notes) = patch.internal_notes {
            self.internal_notes = notes;
        }
        if let Some(kind) = patch.kind {
            self.kind = kind;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(date) = patch.scheduled_date {
            self.scheduled_date = date;
        }
        if let Some(date) = patch.deadline_date {
            self.deadline_date = date;
        }
        if let Some(time) = patch.start_time {
            self.start_time = time;
        }
        if let Some(urgency) = patch.urgency {
            self.urgency = urgency;
        }
        if let Some(items) = patch.sub_items {
            self.sub_items = items;
        }
        if let Some(progress) = patch.progress {
            self.progress = progress.min(100);
        }
        if let Some(total) = patch.total_duration {
            self.total_duration = total;
        }
        if let Some(remaining) = patch.remaining_duration {
            self.remaining_duration = remaining;
        }
        if let Some(external) = patch.origin_external_id {
            self.origin_external_id = external;
        }

        if sub_items_given {
            self.recompute_progress();
        }
        if self.progress != previous_progress && !remaining_given {
            self.sync_remaining_duration();
        }
    }
}

/// `round(100 * done / total)`, half rounding up.
pub fn progress_percent(done: usize, total: usize) -> u8 {
    // (200d + t) / 2t == floor(100d/t + 1/2)
    if total == 0 {
        return 0;
    }
    let done = done.min(total) as u64;
    let total = total as u64;
    ((200 * done + total) / (2 * total)).min(100) as u8
}

/// `round(total * (1 - progress / 100))`, half rounding up.
pub fn remaining_after(total: u32, progress: u8) -> u32 {
    let left = 100 - u64::from(progress.min(100));
    ((2 * u64::from(total) * left + 100) / 200) as u32
}

/// Partial update for [`Task`]. Outer `None` leaves a field alone; for optional
/// fields `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub internal_notes: Option<String>,
    pub kind: Option<TaskKind>,
    pub status: Option<TaskStatus>,
    pub scheduled_date: Option<Option<NaiveDate>>,
    pub deadline_date: Option<Option<NaiveDate>>,
    pub start_time: Option<Option<NaiveTime>>,
    pub urgency: Option<Urgency>,
    pub sub_items: Option<Vec<SubItem>>,
    pub progress: Option<u8>,
    pub remaining_duration: Option<Option<u32>>,
    pub total_duration: Option<Option<u32>>,
    pub origin_external_id: Option<Option<String>>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Setting {
    #[serde(rename = "id")]
    pub key: String,
    pub value: String,
}

impl Setting {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// The snapshot document exchanged with the backup transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupEnvelope {
    pub version: String,
    /// Write time of the envelope, not of any record inside it.
    pub timestamp: Timestamp,
    pub data: BackupData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(from = "BackupDataWire")]
pub struct BackupData {
    pub tasks: Vec<Task>,
    pub settings: Vec<Setting>,
}

// Early envelopes stored the bare task array under `data`.
#[derive(Deserialize)]
#[serde(untagged)]
enum BackupDataWire {
    Current {
        tasks: Vec<Task>,
        #[serde(default)]
        settings: Vec<Setting>,
    },
    Legacy(Vec<Task>),
}

impl From<BackupDataWire> for BackupData {
    fn from(value: BackupDataWire) -> Self {
        match value {
            BackupDataWire::Current { tasks, settings } => Self { tasks, settings },
            BackupDataWire::Legacy(tasks) => Self {
                tasks,
                settings: Vec::new(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RemoteTaskList {
    pub id: String,
    pub title: String,
}

/// A record owned by the remote task provider, rebuilt on every fetch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct RemoteTask {
    pub remote_id: String,
    pub list_id: String,
    pub title: String,
    pub notes: String,
    pub status: TaskStatus,
    pub due: Option<NaiveDate>,
    /// Provider `updated` time, standing in for a creation time.
    pub created_at: Timestamp,
}

impl RemoteTask {
    /// Remote records are always plain tasks.
    pub fn kind(&self) -> TaskKind {
        TaskKind::Task
    }
}

/// Fields the remote provider accepts on update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteTaskFields {
    pub title: Option<String>,
    pub notes: Option<String>,
    pub due: Option<Option<NaiveDate>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TasksFile {
    pub schema_version: u32,
    #[serde(default)]
    pub next_id: TaskId,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SettingsFile {
    pub schema_version: u32,
    pub settings: Vec<Setting>,
}

mod wire {
    pub mod opt_date {
        use chrono::NaiveDate;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<NaiveDate>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(date) => serializer.serialize_str(&date.format("%Y-%m-%d").to_string()),
                None => serializer.serialize_none(),
            }
        }

        // Accepts "", "YYYY-MM-DD" and full ISO timestamps (date part only).
        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<NaiveDate>, D::Error> {
            let raw = Option::<String>::deserialize(deserializer)?;
            let Some(raw) = raw else {
                return Ok(None);
            };
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            let date_part = trimmed.get(..10).unwrap_or(trimmed);
            NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
                .map(Some)
                .map_err(serde::de::Error::custom)
        }
    }

    pub mod opt_hhmm {
        use chrono::NaiveTime;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<NaiveTime>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(time) => serializer.serialize_str(&time.format("%H:%M").to_string()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<NaiveTime>, D::Error> {
            let raw = Option::<String>::deserialize(deserializer)?;
            let Some(raw) = raw else {
                return Ok(None);
            };
            super::super::parse_hhmm(&raw)
                .map(Some)
                .or_else(|| raw.trim().is_empty().then_some(None))
                .ok_or_else(|| serde::de::Error::custom(format!("invalid time: {raw}")))
        }
    }
}

/// Parses "HH:MM" or "HH:MM:SS".
pub fn parse_hhmm(raw: &str) -> Option<NaiveTime> {
    let trimmed = raw.trim();
    NaiveTime::parse_from_str(trimmed, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M:%S"))
        .ok()
}
