// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Append-only statistics sink: one CSV row per terminal task transition,
//! never compacted. Appends take a sidecar lock so rows from parallel
//! workers never interleave.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use models::Task;

use crate::{lock::FileLockGuard, StoreError};

const STATS_HEADER: [&str; 7] = [
    "task_id",
    "date",
    "task_type",
    "status",
    "app_name",
    "app_version",
    "etab_name",
];

pub struct StatsSink {
    csv_path: PathBuf,
    lock_timeout: Duration,
}

impl StatsSink {
    pub fn new(csv_path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            csv_path: csv_path.into(),
            lock_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.csv_path
    }

    /// Append one row for a task that just reached a terminal status. The
    /// date column is the task's creation date, left empty when the stored
    /// timestamp does not parse.
    pub fn append(&self, task: &Task) -> Result<(), StoreError> {
        if let Some(parent) = self.csv_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let lock_path = PathBuf::from(format!("{}.lock", self.csv_path.display()));
        let _lock = FileLockGuard::acquire(&lock_path, self.lock_timeout)?;

        let write_header = !self.csv_path.exists();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.csv_path)?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        if write_header {
            writer.write_record(STATS_HEADER)?;
        }

        let date = chrono::DateTime::parse_from_rfc3339(&task.created_at)
            .map(|dt| dt.date_naive().format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        let status = task.status.to_string();

        writer.write_record([
            task.task_id.as_str(),
            date.as_str(),
            task.task_type.as_str(),
            status.as_str(),
            task.app_name.as_str(),
            task.app_version.as_deref().unwrap_or(""),
            task.etab_name.as_str(),
        ])?;
        writer.flush()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::{TaskRequest, TaskStatus};
    use std::collections::HashMap;

    fn task(task_id: &str, status: TaskStatus) -> Task {
        let request = TaskRequest {
            etab_name: "UM".into(),
            app_name: "pod".into(),
            app_version: Some("1.0".into()),
            task_type: "encoding".into(),
            source_url: "https://example.com/video.mp4".into(),
            affiliation: None,
            parameters: HashMap::new(),
            notify_url: "https://example.com/notify".into(),
        };
        let mut t = Task::from_request(&request, task_id.into(), "r1".into(), None);
        t.status = status;
        t
    }

    #[test]
    fn writes_header_once_then_appends() {
        let dir = tempfile::tempdir().unwrap();
        let sink = StatsSink::new(dir.path().join("task_stats.csv"), Duration::from_secs(2));

        sink.append(&task("t1", TaskStatus::Completed)).unwrap();
        sink.append(&task("t2", TaskStatus::Failed)).unwrap();

        let raw = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("task_id,date,task_type,status"));
        assert!(lines[1].starts_with("t1,"));
        assert!(lines[1].contains(",completed,"));
        assert!(lines[2].contains(",failed,"));
    }

    #[test]
    fn invalid_created_at_leaves_date_empty() {
        let dir = tempfile::tempdir().unwrap();
        let sink = StatsSink::new(dir.path().join("task_stats.csv"), Duration::from_secs(2));

        let mut t = task("t-invalid", TaskStatus::Completed);
        t.created_at = "not-a-date".into();
        sink.append(&t).unwrap();

        let raw = std::fs::read_to_string(sink.path()).unwrap();
        let row = raw.lines().nth(1).unwrap();
        let cols: Vec<&str> = row.split(',').collect();
        assert_eq!(cols[0], "t-invalid");
        assert_eq!(cols[1], "");
    }
}
