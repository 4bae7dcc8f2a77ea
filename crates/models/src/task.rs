// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// Lifecycle of a task as tracked by the manager.
///
/// `completed`, `failed` and `timeout` are terminal. `warning` means the
/// runner reported success but the completion callback could not be
/// delivered; a warning task may flip back to `completed` when a retry lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Warning,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }
}

/// Submission payload from a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Institution or organization requesting the task.
    pub etab_name: String,
    /// Client application, for auditing.
    pub app_name: String,
    #[serde(default)]
    pub app_version: Option<String>,
    pub task_type: String,
    /// Location of the input data; validated against SSRF rules.
    pub source_url: String,
    #[serde(default)]
    pub affiliation: Option<String>,
    /// Opaque task parameters, passed through to the runner.
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    /// Completion callback; validated against SSRF rules and re-checked at
    /// send time.
    pub notify_url: String,
}

/// One unit of work and its full lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    /// Runner assigned at admission. The runner may be evicted later; the id
    /// is kept for diagnostics either way.
    pub runner_id: String,
    pub status: TaskStatus,
    pub etab_name: String,
    pub app_name: String,
    #[serde(default)]
    pub app_version: Option<String>,
    pub task_type: String,
    pub source_url: String,
    #[serde(default)]
    pub affiliation: Option<String>,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    pub notify_url: String,
    /// Bearer token supplied by the client; forwarded on notify callbacks.
    #[serde(default)]
    pub client_token: Option<String>,
    /// ISO-8601 creation timestamp.
    pub created_at: String,
    /// ISO-8601 timestamp of the last state change. Monotonically
    /// non-decreasing; the merge rule keeps whichever copy is newer.
    pub updated_at: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub script_output: Option<String>,
}

impl Task {
    /// Build the record for a freshly admitted request. The task goes
    /// straight to `running`: handoff is already scheduled when this exists.
    pub fn from_request(
        request: &TaskRequest,
        task_id: String,
        runner_id: String,
        client_token: Option<String>,
    ) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            task_id,
            runner_id,
            status: TaskStatus::Running,
            etab_name: request.etab_name.clone(),
            app_name: request.app_name.clone(),
            app_version: request.app_version.clone(),
            task_type: request.task_type.clone(),
            source_url: request.source_url.clone(),
            affiliation: request.affiliation.clone(),
            parameters: request.parameters.clone(),
            notify_url: request.notify_url.clone(),
            client_token,
            created_at: now.clone(),
            updated_at: now,
            error: None,
            script_output: None,
        }
    }

    /// Bump `updated_at` to now.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now().to_rfc3339();
    }

    pub fn updated_at_instant(&self) -> DateTime<Utc> {
        parse_iso_instant(&self.updated_at)
    }

    pub fn created_at_instant(&self) -> DateTime<Utc> {
        parse_iso_instant(&self.created_at)
    }
}

/// Parse an ISO-8601 timestamp, treating anything unparseable as the minimum
/// instant so that a corrupt timestamp always loses a newest-wins merge.
pub fn parse_iso_instant(value: &str) -> DateTime<Utc> {
    if value.is_empty() {
        return DateTime::<Utc>::MIN_UTC;
    }
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Timestamps written by older workers lack an offset.
            chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
                .map(|naive| naive.and_utc())
        })
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Completion report from a runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompletionNotification {
    pub task_id: String,
    /// Final status from the runner's perspective: `completed`, `warning`,
    /// `failed` or `timeout`.
    pub status: TaskStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub script_output: Option<String>,
}

/// Listing of the files a task produced, relative to its output directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultManifest {
    pub task_id: String,
    #[serde(default)]
    pub files: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn request() -> TaskRequest {
        TaskRequest {
            etab_name: "UM".into(),
            app_name: "pod".into(),
            app_version: Some("1.0".into()),
            task_type: "encoding".into(),
            source_url: "https://example.com/video.mp4".into(),
            affiliation: None,
            parameters: HashMap::new(),
            notify_url: "https://example.com/notify".into(),
        }
    }

    #[test]
    fn from_request_starts_running_with_equal_timestamps() {
        let t = Task::from_request(&request(), "t1".into(), "r1".into(), None);
        assert_eq!(t.status, TaskStatus::Running);
        assert_eq!(t.created_at, t.updated_at);
        assert!(t.error.is_none());
    }

    #[test]
    fn touch_never_decreases_updated_at() {
        let mut t = Task::from_request(&request(), "t1".into(), "r1".into(), None);
        let before = t.updated_at_instant();
        t.touch();
        assert!(t.updated_at_instant() >= before);
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Timeout.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Warning.is_terminal());
    }

    #[test]
    fn status_round_trips_through_wire_strings() {
        for (status, wire) in [
            (TaskStatus::Pending, "\"pending\""),
            (TaskStatus::Running, "\"running\""),
            (TaskStatus::Completed, "\"completed\""),
            (TaskStatus::Failed, "\"failed\""),
            (TaskStatus::Timeout, "\"timeout\""),
            (TaskStatus::Warning, "\"warning\""),
        ] {
            assert_eq!(serde_json::to_string(&status).unwrap(), wire);
            let back: TaskStatus = serde_json::from_str(wire).unwrap();
            assert_eq!(back, status);
        }
    }

    #[test]
    fn unparseable_timestamp_sorts_first() {
        assert_eq!(parse_iso_instant("not-a-date"), DateTime::<Utc>::MIN_UTC);
        assert_eq!(parse_iso_instant(""), DateTime::<Utc>::MIN_UTC);
        // Both offset-bearing and naive timestamps parse.
        assert!(parse_iso_instant("2026-02-02T10:00:00+00:00") > DateTime::<Utc>::MIN_UTC);
        assert!(parse_iso_instant("2026-02-02T10:00:00.123456") > DateTime::<Utc>::MIN_UTC);
    }
}
