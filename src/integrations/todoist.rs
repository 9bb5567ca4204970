use crate::error::SyncError;
use crate::models::{Priority, Project, RemoteTask};
use crate::task_line::parse_date;
use chrono::NaiveDate;
use log::debug;
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.todoist.com/api/v1";
const PAGE_LIMIT: &str = "200";
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// The remote calls the sync engine needs. Every failure is returned to the
/// caller; nothing is retried here.
pub trait TaskGateway: Send + Sync {
    /// Every open task, with all pages drained.
    fn list_tasks(&self) -> Result<Vec<RemoteTask>, SyncError>;
    /// One task by id, open or closed. `Ok(None)` when it is gone.
    fn get_task(&self, id: &str) -> Result<Option<RemoteTask>, SyncError>;
    fn create_task(&self, content: &str, options: &CreateTaskOptions) -> Result<RemoteTask, SyncError>;
    fn update_task(&self, id: &str, update: &TaskUpdate) -> Result<RemoteTask, SyncError>;
    fn close_task(&self, id: &str) -> Result<bool, SyncError>;
    fn reopen_task(&self, id: &str) -> Result<bool, SyncError>;
    fn list_projects(&self) -> Result<Vec<Project>, SyncError>;
    /// `Ok(false)` when the token is rejected; transport failures are errors.
    fn verify_credential(&self) -> Result<bool, SyncError>;
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CreateTaskOptions {
    pub project_id: Option<String>,
    pub priority: Priority,
    pub due_date: Option<NaiveDate>,
    pub labels: Vec<String>,
    pub description: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DueUpdate {
    Set(NaiveDate),
    Clear,
}

/// Fields to change on an existing task; `None` leaves a field alone.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaskUpdate {
    pub content: Option<String>,
    pub priority: Option<Priority>,
    pub due: Option<DueUpdate>,
    pub labels: Option<Vec<String>>,
}

pub struct TodoistClient {
    client: Client,
    token: String,
    base_url: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Page<T> {
    Cursor {
        results: Vec<T>,
        #[serde(default)]
        next_cursor: Option<String>,
    },
    Plain(Vec<T>),
}

#[derive(Deserialize)]
struct TaskResponse {
    id: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    description: String,
    #[serde(default, alias = "is_completed")]
    checked: bool,
    #[serde(default)]
    priority: Option<u8>,
    #[serde(default)]
    project_id: Option<String>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    due: Option<DueResponse>,
    #[serde(default)]
    is_deleted: bool,
}

#[derive(Deserialize)]
struct DueResponse {
    date: String,
}

#[derive(Deserialize)]
struct ProjectResponse {
    id: String,
    name: String,
    #[serde(default, alias = "is_inbox_project")]
    inbox_project: bool,
}

#[derive(Serialize)]
struct CreateTaskRequest<'a> {
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    project_id: Option<&'a str>,
    priority: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    due_date: Option<String>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    labels: &'a [String],
}

#[derive(Serialize, Default)]
struct UpdateTaskRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    due_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    due_string: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    labels: Option<&'a [String]>,
}

impl TodoistClient {
    pub fn new(token: &str, base_url: &str) -> Result<Self, SyncError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(SyncError::Config(
                "Todoist API token is not configured. Set [todoist].api_token in config.toml."
                    .to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        let base_url = if base_url.trim().is_empty() {
            DEFAULT_BASE_URL
        } else {
            base_url.trim()
        };
        Ok(Self {
            client,
            token: token.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn send(&self, request: RequestBuilder, what: &str) -> Result<Response, SyncError> {
        let resp = request.bearer_auth(&self.token).send()?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().unwrap_or_default();
        Err(status_error(status, &body, what))
    }

    fn fetch_page<T>(&self, path: &str, cursor: Option<&str>, what: &str) -> Result<Page<T>, SyncError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let mut query = vec![("limit", PAGE_LIMIT)];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }
        let resp = self.send(self.client.get(self.url(path)).query(&query), what)?;
        let page = resp.json::<Page<T>>()?;
        Ok(page)
    }
}

impl TaskGateway for TodoistClient {
    fn list_tasks(&self) -> Result<Vec<RemoteTask>, SyncError> {
        let tasks: Vec<TaskResponse> =
            drain_pages(|cursor| self.fetch_page("tasks", cursor, "Task list"))?;
        debug!("event=list_tasks module=todoist status=ok count={}", tasks.len());
        Ok(tasks.into_iter().map(RemoteTask::from).collect())
    }

    fn get_task(&self, id: &str) -> Result<Option<RemoteTask>, SyncError> {
        let request = self.client.get(self.url(&format!("tasks/{id}")));
        match self.send(request, &format!("Task {id} lookup")) {
            Ok(resp) => {
                let task: TaskResponse = resp.json()?;
                Ok(live_task(task))
            }
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn create_task(&self, content: &str, options: &CreateTaskOptions) -> Result<RemoteTask, SyncError> {
        let body = CreateTaskRequest {
            content,
            description: options
                .description
                .as_deref()
                .filter(|d| !d.trim().is_empty()),
            project_id: options.project_id.as_deref().filter(|p| !p.trim().is_empty()),
            priority: options.priority.to_todoist(),
            due_date: options.due_date.map(format_date),
            labels: &options.labels,
        };
        let resp = self.send(self.client.post(self.url("tasks")).json(&body), "Task create")?;
        let created: TaskResponse = resp.json()?;
        Ok(created.into())
    }

    fn update_task(&self, id: &str, update: &TaskUpdate) -> Result<RemoteTask, SyncError> {
        let mut body = UpdateTaskRequest {
            content: update.content.as_deref(),
            priority: update.priority.map(Priority::to_todoist),
            labels: update.labels.as_deref(),
            ..UpdateTaskRequest::default()
        };
        match &update.due {
            Some(DueUpdate::Set(date)) => body.due_date = Some(format_date(*date)),
            Some(DueUpdate::Clear) => body.due_string = Some("no date"),
            None => {}
        }
        let resp = self.send(
            self.client.post(self.url(&format!("tasks/{id}"))).json(&body),
            &format!("Task {id} update"),
        )?;
        let updated: TaskResponse = resp.json()?;
        Ok(updated.into())
    }

    fn close_task(&self, id: &str) -> Result<bool, SyncError> {
        self.send(
            self.client.post(self.url(&format!("tasks/{id}/close"))),
            &format!("Task {id} close"),
        )?;
        Ok(true)
    }

    fn reopen_task(&self, id: &str) -> Result<bool, SyncError> {
        self.send(
            self.client.post(self.url(&format!("tasks/{id}/reopen"))),
            &format!("Task {id} reopen"),
        )?;
        Ok(true)
    }

    fn list_projects(&self) -> Result<Vec<Project>, SyncError> {
        let projects: Vec<ProjectResponse> =
            drain_pages(|cursor| self.fetch_page("projects", cursor, "Project list"))?;
        Ok(projects.into_iter().map(Project::from).collect())
    }

    fn verify_credential(&self) -> Result<bool, SyncError> {
        let request = self.client.get(self.url("projects")).query(&[("limit", "1")]);
        match self.send(request, "Credential check") {
            Ok(_) => Ok(true),
            Err(SyncError::Auth(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

impl From<TaskResponse> for RemoteTask {
    fn from(task: TaskResponse) -> Self {
        RemoteTask {
            id: task.id,
            content: task.content,
            description: task.description,
            completed: task.checked,
            due_date: task.due.as_ref().and_then(|due| due_date_from(&due.date)),
            priority: Priority::from_todoist(task.priority.unwrap_or(1)),
            project_id: task.project_id,
            labels: task.labels,
        }
    }
}

fn live_task(task: TaskResponse) -> Option<RemoteTask> {
    (!task.is_deleted).then(|| task.into())
}

impl From<ProjectResponse> for Project {
    fn from(project: ProjectResponse) -> Self {
        Project {
            id: project.id,
            name: project.name,
            is_inbox: project.inbox_project,
        }
    }
}

/// Follows `next_cursor` until the service stops handing one out. A bare
/// array response is already complete.
fn drain_pages<T, F>(mut fetch: F) -> Result<Vec<T>, SyncError>
where
    F: FnMut(Option<&str>) -> Result<Page<T>, SyncError>,
{
    let mut items = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        match fetch(cursor.as_deref())? {
            Page::Plain(batch) => {
                items.extend(batch);
                return Ok(items);
            }
            Page::Cursor {
                results,
                next_cursor,
            } => {
                items.extend(results);
                match next_cursor.filter(|next| !next.is_empty()) {
                    Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                    _ => return Ok(items),
                }
            }
        }
    }
}

fn status_error(status: StatusCode, body: &str, what: &str) -> SyncError {
    let detail = format_error_body(status, body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::Auth(detail),
        StatusCode::NOT_FOUND => SyncError::NotFound(format!("{what}: {detail}")),
        _ => SyncError::Request(format!("{what} failed: {detail}")),
    }
}

fn format_error_body(status: StatusCode, body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return format!("HTTP {status}");
    }
    format!("HTTP {status}: {}", truncate_error(trimmed))
}

fn truncate_error(message: &str) -> String {
    let mut out = message.replace(['\n', '\r'], " ");
    if out.len() > 240 {
        let mut cut = 240;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
        out.push_str("...");
    }
    out
}

fn due_date_from(value: &str) -> Option<NaiveDate> {
    value.get(..10).and_then(parse_date)
}

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[test]
    fn cursor_pages_are_drained_in_order() {
        let mut pages: VecDeque<Page<u32>> = VecDeque::from(vec![
            Page::Cursor {
                results: vec![1, 2],
                next_cursor: Some("c1".to_string()),
            },
            Page::Cursor {
                results: vec![3],
                next_cursor: Some("c2".to_string()),
            },
            Page::Cursor {
                results: vec![4],
                next_cursor: None,
            },
        ]);
        let mut seen = Vec::new();
        let items = drain_pages(|cursor| {
            seen.push(cursor.map(str::to_string));
            Ok(pages.pop_front().expect("page"))
        })
        .expect("drain");
        assert_eq!(items, vec![1, 2, 3, 4]);
        assert_eq!(seen, vec![None, Some("c1".to_string()), Some("c2".to_string())]);
    }

    #[test]
    fn plain_array_is_one_complete_page() {
        let page: Page<TaskResponse> =
            serde_json::from_str(r#"[{"id":"1","content":"a"},{"id":"2","content":"b"}]"#)
                .expect("parse");
        let mut calls = 0;
        let mut page = Some(page);
        let items = drain_pages(|_| {
            calls += 1;
            Ok(page.take().expect("single page"))
        })
        .expect("drain");
        assert_eq!(items.len(), 2);
        assert_eq!(calls, 1);
    }

    #[test]
    fn repeated_cursor_stops_draining() {
        let mut calls = 0;
        let items = drain_pages(|_| {
            calls += 1;
            Ok(Page::Cursor {
                results: vec![calls],
                next_cursor: Some("same".to_string()),
            })
        })
        .expect("drain");
        assert_eq!(items, vec![1, 2]);
    }

    #[test]
    fn page_error_propagates() {
        let result: Result<Vec<u32>, SyncError> =
            drain_pages(|_| Err(SyncError::Request("boom".to_string())));
        assert!(matches!(result, Err(SyncError::Request(_))));
    }

    #[test]
    fn converts_task_payload() {
        let json = r#"{
            "results": [{
                "id": "6X7rM8997g3RQmvh",
                "content": "Buy milk",
                "description": "2%",
                "checked": false,
                "priority": 4,
                "project_id": "220474322",
                "labels": ["errand"],
                "due": {"date": "2025-01-01T10:00:00", "is_recurring": false}
            }],
            "next_cursor": null
        }"#;
        let page: Page<TaskResponse> = serde_json::from_str(json).expect("parse");
        let Page::Cursor { mut results, next_cursor } = page else {
            panic!("expected cursor page");
        };
        assert!(next_cursor.is_none());
        let task = RemoteTask::from(results.remove(0));
        assert_eq!(task.id, "6X7rM8997g3RQmvh");
        assert_eq!(task.priority, Priority::High);
        assert_eq!(task.due_date, NaiveDate::from_ymd_opt(2025, 1, 1));
        assert_eq!(task.labels, vec!["errand"]);
        assert!(!task.completed);
    }

    #[test]
    fn legacy_completion_field_is_accepted() {
        let task: TaskResponse =
            serde_json::from_str(r#"{"id":"9","content":"x","is_completed":true,"due":null}"#)
                .expect("parse");
        let task = RemoteTask::from(task);
        assert!(task.completed);
        assert_eq!(task.priority, Priority::None);
        assert_eq!(task.due_date, None);
    }

    #[test]
    fn single_task_lookup_skips_deleted_tasks() {
        let closed: TaskResponse =
            serde_json::from_str(r#"{"id":"4","content":"Done","checked":true}"#).expect("parse");
        let task = live_task(closed).expect("closed task is still live");
        assert!(task.completed);

        let deleted: TaskResponse =
            serde_json::from_str(r#"{"id":"5","content":"Gone","checked":true,"is_deleted":true}"#)
                .expect("parse");
        assert!(live_task(deleted).is_none());
    }

    #[test]
    fn status_codes_map_to_error_kinds() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, "", "Credential check"),
            SyncError::Auth(_)
        ));
        let err = status_error(StatusCode::NOT_FOUND, "Task not found", "Task 1 close");
        assert!(err.is_not_found());
        let err = status_error(StatusCode::INTERNAL_SERVER_ERROR, "oops\nmore", "Task list");
        assert_eq!(err.message(), "Task list failed: HTTP 500 Internal Server Error: oops more");
    }

    #[test]
    fn create_request_skips_empty_fields() {
        let body = CreateTaskRequest {
            content: "Call mom",
            description: None,
            project_id: None,
            priority: Priority::None.to_todoist(),
            due_date: None,
            labels: &[],
        };
        let json = serde_json::to_value(&body).expect("json");
        assert_eq!(json, serde_json::json!({"content": "Call mom", "priority": 1}));
    }

    #[test]
    fn blank_token_is_a_config_error() {
        assert!(matches!(
            TodoistClient::new("  ", DEFAULT_BASE_URL),
            Err(SyncError::Config(_))
        ));
    }
}
