use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use serde::Deserialize;

use crate::error::RemoteError;
use crate::models::{RemoteTask, RemoteTaskFields, RemoteTaskList, TaskStatus, Timestamp};

/// External task-list service. Every call is a network round trip.
#[async_trait]
pub trait TaskProvider: Send + Sync {
    async fn list_lists(&self) -> Result<Vec<RemoteTaskList>, RemoteError>;
    async fn list_tasks(&self, list_id: &str) -> Result<Vec<RemoteTask>, RemoteError>;
    async fn create(
        &self,
        list_id: &str,
        fields: RemoteTaskFields,
    ) -> Result<RemoteTask, RemoteError>;
    async fn set_status(
        &self,
        remote_id: &str,
        list_id: &str,
        status: TaskStatus,
    ) -> Result<(), RemoteError>;
    async fn update(
        &self,
        remote_id: &str,
        list_id: &str,
        fields: RemoteTaskFields,
    ) -> Result<(), RemoteError>;
    async fn delete(&self, remote_id: &str, list_id: &str) -> Result<(), RemoteError>;
}

#[derive(Debug, Deserialize)]
pub struct WirePage<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
    #[serde(default, rename = "nextPageToken")]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WireTaskList {
    pub id: String,
    #[serde(default)]
    pub title: String,
}

/// Task as the provider sends it.
#[derive(Debug, Clone, Deserialize)]
pub struct WireTask {
    pub id: String,
    pub title: Option<String>,
    pub notes: Option<String>,
    pub status: Option<String>,
    pub due: Option<String>,
    pub updated: Option<String>,
}

impl From<WireTaskList> for RemoteTaskList {
    fn from(value: WireTaskList) -> Self {
        Self {
            id: value.id,
            title: value.title,
        }
    }
}

/// Provider vocabulary is two-valued: anything but "completed" is still open.
pub fn normalize_status(raw: Option<&str>) -> TaskStatus {
    match raw {
        Some("completed") => TaskStatus::Completed,
        _ => TaskStatus::Pending,
    }
}

pub fn wire_status(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Completed => "completed",
        TaskStatus::Pending | TaskStatus::Cancelled => "needsAction",
    }
}

/// Maps a provider task into the shape shown next to local tasks.
pub fn map_remote_task(list_id: &str, wire: WireTask) -> RemoteTask {
    RemoteTask {
        remote_id: wire.id,
        list_id: list_id.to_string(),
        title: wire.title.unwrap_or_default(),
        notes: wire.notes.unwrap_or_default(),
        status: normalize_status(wire.status.as_deref()),
        due: wire.due.as_deref().and_then(parse_due),
        created_at: wire
            .updated
            .as_deref()
            .and_then(parse_rfc3339_millis)
            .unwrap_or(0),
    }
}

/// The provider stores due dates as midnight UTC timestamps; only the date counts.
fn parse_due(raw: &str) -> Option<NaiveDate> {
    let date_part = raw.trim().get(..10)?;
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
}

pub fn parse_rfc3339_millis(raw: &str) -> Option<Timestamp> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.timestamp_millis())
}

pub fn wire_due(date: NaiveDate) -> String {
    format!("{}T00:00:00.000Z", date.format("%Y-%m-%d"))
}

/// Request body for create/patch; untouched fields are omitted.
pub fn fields_to_json(fields: &RemoteTaskFields) -> serde_json::Value {
    let mut body = serde_json::Map::new();
    if let Some(title) = &fields.title {
        body.insert("title".to_string(), title.clone().into());
    }
    if let Some(notes) = &fields.notes {
        body.insert("notes".to_string(), notes.clone().into());
    }
    match &fields.due {
        Some(Some(date)) => {
            body.insert("due".to_string(), wire_due(*date).into());
        }
        Some(None) => {
            body.insert("due".to_string(), serde_json::Value::Null);
        }
        None => {}
    }
    serde_json::Value::Object(body)
}
