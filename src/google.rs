use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime, TimeZone};
use reqwest::{Client, Method, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::calendar::{event_description, event_title, event_window, CalendarService};
use crate::config::{SyncConfig, KEY_ACCESS_TOKEN};
use crate::dates;
use crate::error::RemoteError;
use crate::models::{BackupEnvelope, RemoteTask, RemoteTaskFields, RemoteTaskList, Task, TaskStatus};
use crate::remote::{
    fields_to_json, map_remote_task, wire_status, TaskProvider, WirePage, WireTask, WireTaskList,
};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::RecordStore;
use crate::transport::BackupTransport;

const TASKS_API: &str = "https://tasks.googleapis.com/tasks/v1";
const DRIVE_API: &str = "https://www.googleapis.com/drive/v3";
const DRIVE_UPLOAD_API: &str = "https://www.googleapis.com/upload/drive/v3";
const CALENDAR_API: &str = "https://www.googleapis.com/calendar/v3";
const APP_DATA_SPACE: &str = "appDataFolder";
const MULTIPART_BOUNDARY: &str = "-------314159265358979323846";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(45);
const PAGE_SIZE: &str = "100";

/// One client for every Google surface the app talks to: Tasks (remote task
/// provider), Drive app data (backup transport) and Calendar.
///
/// The bearer token is read from the settings table on every request, so signing
/// in or out takes effect without rebuilding the client.
pub struct GoogleClient {
    http: Client,
    store: Arc<dyn RecordStore>,
    retry: RetryPolicy,
    backup_name: String,
}

impl GoogleClient {
    pub fn new(store: Arc<dyn RecordStore>, config: &SyncConfig) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            store,
            retry: config.retry.clone(),
            backup_name: config.backup_name.clone(),
        })
    }

    async fn access_token(&self) -> Result<String, RemoteError> {
        match self.store.get_setting(KEY_ACCESS_TOKEN).await {
            Ok(Some(token)) if !token.trim().is_empty() => Ok(token.trim().to_string()),
            Ok(_) => Err(RemoteError::NotAuthenticated),
            Err(err) => {
                log::warn!("access token lookup failed: {err}");
                Err(RemoteError::NotAuthenticated)
            }
        }
    }

    /// Sends the request built by `build` and returns the raw body. Transient
    /// failures are re-sent as [`retry_policy_for`] allows.
    async fn call<F>(&self, label: &str, build: F) -> Result<String, RemoteError>
    where
        F: FnOnce(&Client) -> RequestBuilder,
    {
        let token = self.access_token().await?;
        let request = build(&self.http)
            .bearer_auth(&token)
            .build()
            .map_err(request_error)?;
        let policy = retry_policy_for(request.method(), &self.retry);
        let http = &self.http;
        with_retry(&policy, label, || {
            let attempt = request.try_clone();
            async move {
                let attempt = attempt
                    .ok_or_else(|| RemoteError::Decode("request body cannot be replayed".into()))?;
                let response = http.execute(attempt).await.map_err(request_error)?;
                let status = response.status();
                let body = response.text().await.map_err(request_error)?;
                if status.is_success() {
                    Ok(body)
                } else {
                    Err(classify_failure(status.as_u16(), &body))
                }
            }
        })
        .await
    }

    async fn call_json<T, F>(&self, label: &str, build: F) -> Result<T, RemoteError>
    where
        T: DeserializeOwned,
        F: FnOnce(&Client) -> RequestBuilder,
    {
        let body = self.call(label, build).await?;
        decode(&body)
    }

    async fn find_backup_file(&self) -> Result<Option<String>, RemoteError> {
        let url = endpoint(DRIVE_API, &["files"])?;
        let query = format!("name = '{}'", self.backup_name);
        let page: DriveFileList = self
            .call_json("drive list", |http| {
                http.get(url).query(&backup_lookup_params(&query))
            })
            .await?;
        Ok(page.files.into_iter().next().map(|file| file.id))
    }
}

#[derive(Debug, Deserialize)]
struct DriveFileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CalendarEvent {
    id: String,
}

/// Base URL plus percent-encoded path segments.
fn endpoint(base: &str, segments: &[&str]) -> Result<Url, RemoteError> {
    let mut url = Url::parse(base).map_err(|err| RemoteError::Decode(err.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| RemoteError::Decode(format!("{base} cannot take a path")))?
        .extend(segments);
    Ok(url)
}

/// Creating requests are sent once. A timed-out POST may still have landed,
/// and sending it again would leave a duplicate task, event or backup file.
fn retry_policy_for(method: &Method, policy: &RetryPolicy) -> RetryPolicy {
    if *method == Method::POST {
        RetryPolicy::no_retry()
    } else {
        policy.clone()
    }
}

/// Newest file first, in case an earlier upload left a second copy behind.
fn backup_lookup_params(query: &str) -> [(&'static str, &str); 5] {
    [
        ("spaces", APP_DATA_SPACE),
        ("q", query),
        ("fields", "files(id, name)"),
        ("orderBy", "modifiedTime desc"),
        ("pageSize", "1"),
    ]
}

fn request_error(err: reqwest::Error) -> RemoteError {
    if err.is_decode() {
        RemoteError::Decode(err.to_string())
    } else {
        RemoteError::Transient(err.to_string())
    }
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T, RemoteError> {
    serde_json::from_str(body).map_err(|err| RemoteError::Decode(err.to_string()))
}

/// Maps a failed response. Google reports revoked or expired tokens either as a
/// bare 401 or with `error.status = "UNAUTHENTICATED"`.
pub fn classify_failure(status: u16, body: &str) -> RemoteError {
    let error = serde_json::from_str::<Value>(body)
        .ok()
        .map(|value| value["error"].clone())
        .unwrap_or(Value::Null);
    if error["status"].as_str() == Some("UNAUTHENTICATED") {
        return RemoteError::AuthExpired;
    }
    let message = error["message"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| body.trim().to_string());
    RemoteError::from_status(status, message)
}

/// `multipart/related` body carrying file metadata and content in one upload.
pub fn multipart_body(metadata: &Value, content: &str) -> String {
    format!(
        "--{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{metadata}\r\n\
         --{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{content}\r\n\
         --{b}--",
        b = MULTIPART_BOUNDARY
    )
}

fn local_rfc3339(at: NaiveDateTime) -> String {
    match Local.from_local_datetime(&at).earliest() {
        Some(local) => local.to_rfc3339(),
        // Skipped by a DST jump; shift past the gap.
        None => Local
            .from_local_datetime(&(at + chrono::Duration::hours(1)))
            .earliest()
            .map(|local| local.to_rfc3339())
            .unwrap_or_else(|| at.and_utc().to_rfc3339()),
    }
}

/// Calendar event resource for a meeting.
pub fn event_resource(task: &Task, today: chrono::NaiveDate) -> Value {
    let window = event_window(task, today);
    json!({
        "summary": event_title(task),
        "description": event_description(task),
        "start": { "dateTime": local_rfc3339(window.start) },
        "end": { "dateTime": local_rfc3339(window.end) },
    })
}

#[async_trait]
impl TaskProvider for GoogleClient {
    async fn list_lists(&self) -> Result<Vec<RemoteTaskList>, RemoteError> {
        let url = endpoint(TASKS_API, &["users", "@me", "lists"])?;
        let page: WirePage<WireTaskList> = self
            .call_json("tasks lists", |http| {
                http.get(url.clone()).query(&[("maxResults", PAGE_SIZE)])
            })
            .await?;
        Ok(page.items.into_iter().map(RemoteTaskList::from).collect())
    }

    async fn list_tasks(&self, list_id: &str) -> Result<Vec<RemoteTask>, RemoteError> {
        let url = endpoint(TASKS_API, &["lists", list_id, "tasks"])?;
        let mut tasks = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let token = page_token.take();
            let page: WirePage<WireTask> = self
                .call_json("tasks list", |http| {
                    let request = http.get(url.clone()).query(&[
                        ("showCompleted", "true"),
                        ("showHidden", "true"),
                        ("maxResults", PAGE_SIZE),
                    ]);
                    match &token {
                        Some(token) => request.query(&[("pageToken", token.as_str())]),
                        None => request,
                    }
                })
                .await?;
            tasks.extend(page.items.into_iter().map(|wire| map_remote_task(list_id, wire)));
            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }
        log::debug!("fetched remote tasks list={list_id} count={}", tasks.len());
        Ok(tasks)
    }

    async fn create(
        &self,
        list_id: &str,
        fields: RemoteTaskFields,
    ) -> Result<RemoteTask, RemoteError> {
        let url = endpoint(TASKS_API, &["lists", list_id, "tasks"])?;
        let body = fields_to_json(&fields);
        let wire: WireTask = self
            .call_json("tasks insert", |http| http.post(url.clone()).json(&body))
            .await?;
        Ok(map_remote_task(list_id, wire))
    }

    async fn set_status(
        &self,
        remote_id: &str,
        list_id: &str,
        status: TaskStatus,
    ) -> Result<(), RemoteError> {
        let url = endpoint(TASKS_API, &["lists", list_id, "tasks", remote_id])?;
        // Reopening needs the completion time cleared as well.
        let body = match status {
            TaskStatus::Completed => json!({ "status": wire_status(status) }),
            TaskStatus::Pending | TaskStatus::Cancelled => {
                json!({ "status": wire_status(status), "completed": null })
            }
        };
        self.call("tasks status", |http| http.patch(url.clone()).json(&body))
            .await
            .map(drop)
    }

    async fn update(
        &self,
        remote_id: &str,
        list_id: &str,
        fields: RemoteTaskFields,
    ) -> Result<(), RemoteError> {
        let url = endpoint(TASKS_API, &["lists", list_id, "tasks", remote_id])?;
        let body = fields_to_json(&fields);
        self.call("tasks patch", |http| http.patch(url.clone()).json(&body))
            .await
            .map(drop)
    }

    async fn delete(&self, remote_id: &str, list_id: &str) -> Result<(), RemoteError> {
        let url = endpoint(TASKS_API, &["lists", list_id, "tasks", remote_id])?;
        self.call("tasks delete", |http| http.delete(url.clone()))
            .await
            .map(drop)
    }
}

#[async_trait]
impl BackupTransport for GoogleClient {
    async fn load(&self) -> Result<Option<BackupEnvelope>, RemoteError> {
        let Some(file_id) = self.find_backup_file().await? else {
            return Ok(None);
        };
        let url = endpoint(DRIVE_API, &["files", &file_id])?;
        let envelope = self
            .call_json("drive download", |http| {
                http.get(url.clone()).query(&[("alt", "media")])
            })
            .await?;
        Ok(Some(envelope))
    }

    async fn save(&self, envelope: &BackupEnvelope) -> Result<(), RemoteError> {
        let existing = self.find_backup_file().await?;
        let mut metadata = json!({
            "name": self.backup_name,
            "mimeType": "application/json",
        });
        let (method, url) = match &existing {
            Some(file_id) => (Method::PATCH, endpoint(DRIVE_UPLOAD_API, &["files", file_id])?),
            None => {
                metadata["parents"] = json!([APP_DATA_SPACE]);
                (Method::POST, endpoint(DRIVE_UPLOAD_API, &["files"])?)
            }
        };
        let content =
            serde_json::to_string(envelope).map_err(|err| RemoteError::Decode(err.to_string()))?;
        let body = multipart_body(&metadata, &content);

        self.call("drive upload", |http| {
            http.request(method.clone(), url.clone())
                .query(&[("uploadType", "multipart")])
                .header(
                    reqwest::header::CONTENT_TYPE,
                    format!("multipart/related; boundary={MULTIPART_BOUNDARY}"),
                )
                .body(body.clone())
        })
        .await?;
        log::info!(
            "drive backup uploaded file={} bytes={}",
            existing.as_deref().unwrap_or("<new>"),
            content.len()
        );
        Ok(())
    }
}

#[async_trait]
impl CalendarService for GoogleClient {
    async fn upsert_event(
        &self,
        task: &Task,
        existing_id: Option<&str>,
    ) -> Result<String, RemoteError> {
        let resource = event_resource(task, dates::today());
        if let Some(event_id) = existing_id {
            let url = endpoint(CALENDAR_API, &["calendars", "primary", "events", event_id])?;
            let updated = self
                .call_json::<CalendarEvent, _>("calendar update", |http| {
                    http.put(url.clone()).json(&resource)
                })
                .await;
            match updated {
                Ok(event) => return Ok(event.id),
                // The event was removed on the calendar side; make a new one.
                Err(RemoteError::Http {
                    status: 404 | 410, ..
                }) => log::info!("calendar event {event_id} is gone; recreating"),
                Err(err) => return Err(err),
            }
        }
        let url = endpoint(CALENDAR_API, &["calendars", "primary", "events"])?;
        let event: CalendarEvent = self
            .call_json("calendar insert", |http| http.post(url.clone()).json(&resource))
            .await?;
        Ok(event.id)
    }

    async fn delete_event(&self, event_id: &str) -> Result<(), RemoteError> {
        let url = endpoint(CALENDAR_API, &["calendars", "primary", "events", event_id])?;
        match self
            .call("calendar delete", |http| http.delete(url.clone()))
            .await
        {
            Ok(_) | Err(RemoteError::Http { status: 404 | 410, .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskKind;
    use chrono::{NaiveDate, NaiveTime};

    #[test]
    fn unauthenticated_payloads_expire_the_session() {
        assert_eq!(classify_failure(401, ""), RemoteError::AuthExpired);
        let body = r#"{"error":{"code":403,"message":"bad token","status":"UNAUTHENTICATED"}}"#;
        assert_eq!(classify_failure(403, body), RemoteError::AuthExpired);
    }

    #[test]
    fn failure_messages_come_from_the_error_object() {
        let body = r#"{"error":{"code":404,"message":"Not Found","status":"NOT_FOUND"}}"#;
        assert_eq!(
            classify_failure(404, body),
            RemoteError::Http {
                status: 404,
                message: "Not Found".to_string()
            }
        );
        assert!(classify_failure(503, "upstream down").is_transient());
        assert_eq!(
            classify_failure(400, " plain text "),
            RemoteError::Http {
                status: 400,
                message: "plain text".to_string()
            }
        );
    }

    #[test]
    fn multipart_body_frames_both_parts() {
        let body = multipart_body(&json!({ "name": "x.json" }), r#"{"a":1}"#);
        let expected = "---------314159265358979323846\r\n\
                        Content-Type: application/json; charset=UTF-8\r\n\r\n\
                        {\"name\":\"x.json\"}\r\n\
                        ---------314159265358979323846\r\n\
                        Content-Type: application/json; charset=UTF-8\r\n\r\n\
                        {\"a\":1}\r\n\
                        ---------314159265358979323846--";
        assert_eq!(body, expected);
    }

    #[test]
    fn creating_requests_are_never_resent() {
        let policy = RetryPolicy::default();
        assert_eq!(retry_policy_for(&Method::POST, &policy), RetryPolicy::no_retry());
        for method in [Method::GET, Method::PATCH, Method::PUT, Method::DELETE] {
            assert_eq!(retry_policy_for(&method, &policy), policy, "{method}");
        }
    }

    #[test]
    fn backup_lookup_prefers_the_newest_copy() {
        let params = backup_lookup_params("name = 'b.json'");
        assert!(params.contains(&("orderBy", "modifiedTime desc")));
        assert!(params.contains(&("pageSize", "1")));
        assert!(params.contains(&("q", "name = 'b.json'")));
    }

    #[test]
    fn endpoints_encode_path_segments() {
        let url = endpoint(TASKS_API, &["lists", "a/b c", "tasks"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://tasks.googleapis.com/tasks/v1/lists/a%2Fb%20c/tasks"
        );
    }

    #[test]
    fn event_resource_uses_the_meeting_window() {
        let mut task = Task::new("Sync", TaskKind::Meeting, 1);
        task.scheduled_date = NaiveDate::from_ymd_opt(2024, 7, 1);
        task.start_time = NaiveTime::from_hms_opt(10, 30, 0);
        task.remaining_duration = Some(45);
        let today = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();

        let event = event_resource(&task, today);
        assert_eq!(event["summary"], "[BATTLE PLAN] Sync");
        let start = event["start"]["dateTime"].as_str().unwrap();
        let end = event["end"]["dateTime"].as_str().unwrap();
        assert!(start.starts_with("2024-07-01T10:30:00"), "{start}");
        assert!(end.starts_with("2024-07-01T11:15:00"), "{end}");
    }
}
