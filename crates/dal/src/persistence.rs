// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! JSON-based task persistence with daily directory rotation: one directory
//! per day, one file per task, a `.lock` sidecar per day. All writes are
//! tmp-file + rename; corrupted files get a `.bak` copy and are skipped on
//! load instead of failing the whole directory.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{Local, NaiveDate};
use models::Task;
use serde_json::Value;

use crate::{lock::FileLockGuard, StoreError};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const SAVE_MAX_RETRIES: u32 = 3;

pub struct DailyJsonPersistence {
    data_directory: PathBuf,
    lock_timeout: Duration,
}

/// What [`DailyJsonPersistence::storage_info`] reports.
#[derive(Debug, Clone)]
pub struct StorageInfo {
    pub data_directory: PathBuf,
    pub current_date: String,
    pub current_directory_exists: bool,
    pub current_task_count: usize,
    pub total_days_stored: usize,
    pub available_dates: Vec<NaiveDate>,
}

impl DailyJsonPersistence {
    pub fn new(data_directory: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        let data_directory = data_directory.into();
        if let Err(e) = std::fs::create_dir_all(&data_directory) {
            tracing::error!(dir = %data_directory.display(), "could not create data directory: {e}");
        }
        Self {
            data_directory,
            lock_timeout,
        }
    }

    pub fn data_directory(&self) -> &Path {
        &self.data_directory
    }

    fn date_suffix(date: NaiveDate) -> String {
        date.format("%Y-%m-%d").to_string()
    }

    fn today() -> NaiveDate {
        Local::now().date_naive()
    }

    fn directory_path(&self, date: NaiveDate) -> PathBuf {
        self.data_directory.join(Self::date_suffix(date))
    }

    fn lock_path(&self, date: NaiveDate) -> PathBuf {
        self.directory_path(date).join(".lock")
    }

    fn task_file_path(&self, task_id: &str, date: NaiveDate) -> PathBuf {
        // Sanitize the id for use as a file name.
        let safe_id: String = task_id.replace(['/', '\\'], "_");
        self.directory_path(date).join(format!("{safe_id}.json"))
    }

    /// Save the full task map to today's directory, deleting files for tasks
    /// no longer present. Single-worker mode only; in shared mode use
    /// [`upsert_tasks`](Self::upsert_tasks) so sibling workers' files
    /// survive.
    pub fn save_tasks(&self, tasks: &HashMap<String, Task>) -> Result<(), StoreError> {
        self.with_retries("save_tasks", || self.save_tasks_once(tasks, true))
    }

    /// Write/update a file for every task in the map without deleting
    /// anything else on disk.
    pub fn upsert_tasks(&self, tasks: &HashMap<String, Task>) -> Result<(), StoreError> {
        self.with_retries("upsert_tasks", || self.save_tasks_once(tasks, false))
    }

    /// Transient write failures get a couple of retries. Lock timeouts do
    /// not: those must reach the operator.
    fn with_retries(
        &self,
        what: &str,
        mut op: impl FnMut() -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(()) => return Ok(()),
                Err(e @ StoreError::LockTimeout { .. }) => return Err(e),
                Err(e) if attempt < SAVE_MAX_RETRIES => {
                    tracing::warn!("{what} attempt {attempt} failed, retrying: {e}");
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!("{what} failed after {attempt} attempts: {e}");
                    return Err(e);
                }
            }
        }
    }

    fn save_tasks_once(
        &self,
        tasks: &HashMap<String, Task>,
        delete_missing: bool,
    ) -> Result<(), StoreError> {
        let today = Self::today();
        let directory = self.directory_path(today);
        std::fs::create_dir_all(&directory)?;

        let _lock = FileLockGuard::acquire(&self.lock_path(today), self.lock_timeout)?;

        let mut written = Vec::with_capacity(tasks.len());
        for (task_id, task) in tasks {
            let task_file = self.task_file_path(task_id, today);
            write_task_file(&task_file, task_id, task, today)?;
            written.push(task_file);
        }

        if delete_missing {
            for entry in std::fs::read_dir(&directory)?.flatten() {
                let path = entry.path();
                if path.extension().map(|e| e == "json").unwrap_or(false)
                    && !written.contains(&path)
                {
                    if let Err(e) = std::fs::remove_file(&path) {
                        tracing::error!(file = %path.display(), "error deleting removed task file: {e}");
                    }
                }
            }
        }

        tracing::debug!(count = tasks.len(), dir = %directory.display(), "saved tasks");
        Ok(())
    }

    /// Load and merge tasks from every date directory, preferring the most
    /// recent date's copy of an id. Unreadable directories are skipped.
    pub fn load_tasks_all(&self) -> HashMap<String, Task> {
        let mut merged = HashMap::new();
        let mut dates = self.list_available_dates();
        dates.sort_unstable();

        for date in dates.into_iter().rev() {
            self.merge_tasks_for_date(date, &mut merged);
        }

        tracing::info!(count = merged.len(), "loaded tasks from persistence");
        merged
    }

    fn merge_tasks_for_date(&self, date: NaiveDate, into: &mut HashMap<String, Task>) {
        let directory = self.directory_path(date);
        let _lock = match FileLockGuard::acquire(&self.lock_path(date), self.lock_timeout) {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!("could not lock {date} directory, skipping: {e}");
                return;
            }
        };

        let entries = match std::fs::read_dir(&directory) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %directory.display(), "error listing tasks, skipping: {e}");
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            if let Some((task_id, task)) = self.read_task_file(&path) {
                // A newer date already claimed this id.
                into.entry(task_id).or_insert(task);
            }
        }
    }

    /// Load tasks from a single date directory.
    pub fn load_tasks_for_date(&self, date: NaiveDate) -> HashMap<String, Task> {
        let directory = self.directory_path(date);
        if !directory.is_dir() {
            return HashMap::new();
        }

        let mut out = HashMap::new();
        self.merge_tasks_for_date(date, &mut out);
        out
    }

    /// Fetch a single task by id, searching the most recent date first.
    pub fn load_task(&self, task_id: &str) -> Option<Task> {
        let mut dates = self.list_available_dates();
        dates.sort_unstable();

        for date in dates.into_iter().rev() {
            let path = self.task_file_path(task_id, date);
            if !path.is_file() {
                continue;
            }
            let _lock = match FileLockGuard::acquire(&self.lock_path(date), self.lock_timeout) {
                Ok(guard) => guard,
                Err(e) => {
                    tracing::warn!("could not lock {date} directory for {task_id}: {e}");
                    continue;
                }
            };
            if let Some((_, task)) = self.read_task_file(&path) {
                return Some(task);
            }
        }
        None
    }

    fn read_task_file(&self, path: &Path) -> Option<(String, Task)> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!(file = %path.display(), "error reading task file: {e}");
                return None;
            }
        };

        let mut value: Value = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(file = %path.display(), "JSON decode error: {e}");
                backup_corrupted_file(path);
                return None;
            }
        };

        // The `_metadata` wrapper carries save bookkeeping, not task state.
        let metadata = value
            .as_object_mut()
            .and_then(|obj| obj.remove("_metadata"));
        let task_id = metadata
            .as_ref()
            .and_then(|m| m.get("task_id"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| {
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .map(str::to_string)
            })?;

        match serde_json::from_value::<Task>(value) {
            Ok(task) => Some((task_id, task)),
            Err(e) => {
                tracing::warn!(file = %path.display(), "skipping invalid persisted task: {e}");
                None
            }
        }
    }

    /// Load tasks from an inclusive date range for reporting. Ids are
    /// prefixed with their day (`YYYYMMDD_<task_id>`) so the same task
    /// appearing on several days stays distinguishable. The live task map is
    /// not touched.
    pub fn load_historical_tasks(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> HashMap<String, Task> {
        let mut all_tasks = HashMap::new();
        let mut current = start_date;

        while current <= end_date {
            let date_prefix = current.format("%Y%m%d").to_string();
            for (task_id, task) in self.load_tasks_for_date(current) {
                all_tasks.insert(format!("{date_prefix}_{task_id}"), task);
            }
            let Some(next) = current.succ_opt() else { break };
            current = next;
        }

        all_tasks
    }

    /// Summary of what is on disk, for operators.
    pub fn storage_info(&self) -> StorageInfo {
        let available_dates = self.list_available_dates();
        let today = Self::today();
        let current_directory = self.directory_path(today);

        let current_task_count = std::fs::read_dir(&current_directory)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| {
                        e.path().extension().map(|ext| ext == "json").unwrap_or(false)
                    })
                    .count()
            })
            .unwrap_or(0);

        StorageInfo {
            data_directory: self.data_directory.clone(),
            current_date: Self::date_suffix(today),
            current_directory_exists: current_directory.is_dir(),
            current_task_count,
            total_days_stored: available_dates.len(),
            available_dates,
        }
    }

    pub fn list_available_dates(&self) -> Vec<NaiveDate> {
        let Ok(entries) = std::fs::read_dir(&self.data_directory) else {
            return Vec::new();
        };

        let mut dates: Vec<NaiveDate> = entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .filter_map(|e| {
                NaiveDate::parse_from_str(&e.file_name().to_string_lossy(), "%Y-%m-%d").ok()
            })
            .collect();
        dates.sort_unstable();
        dates
    }

    /// Remove day directories older than `days_to_keep`. Returns how many
    /// were deleted.
    pub fn cleanup_old_files(&self, days_to_keep: u64) -> usize {
        let cutoff = Self::today() - chrono::Duration::days(days_to_keep as i64);
        let mut deleted = 0;

        for date in self.list_available_dates() {
            if date >= cutoff {
                continue;
            }
            let directory = self.directory_path(date);
            match std::fs::remove_dir_all(&directory) {
                Ok(()) => {
                    deleted += 1;
                    tracing::info!(dir = %directory.display(), "deleted old tasks directory");
                }
                Err(e) => {
                    tracing::error!(dir = %directory.display(), "error deleting: {e}");
                }
            }
        }

        deleted
    }
}

fn write_task_file(
    path: &Path,
    task_id: &str,
    task: &Task,
    date: NaiveDate,
) -> Result<(), StoreError> {
    let mut value = serde_json::to_value(task)?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert(
            "_metadata".to_string(),
            serde_json::json!({
                "saved_at": Local::now().to_rfc3339(),
                "task_id": task_id,
                "date": DailyJsonPersistence::date_suffix(date),
            }),
        );
    }

    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, serde_json::to_vec_pretty(&value)?)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn backup_corrupted_file(path: &Path) {
    let backup = path.with_extension("json.bak");
    match std::fs::copy(path, &backup) {
        Ok(_) => tracing::warn!(backup = %backup.display(), "created backup of corrupted file"),
        Err(e) => tracing::error!("failed to create backup file: {e}"),
    }
}
