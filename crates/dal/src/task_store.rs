// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! In-memory task map with write-through persistence.
//!
//! In development a single worker owns all tasks, so a save simply mirrors
//! the map to today's directory. In production every worker holds a partial
//! view and the disk is authoritative: saves merge the local view with what
//! is on disk (newest `updated_at` wins per task) and upsert the union
//! without deleting sibling workers' files. Readers tolerate seeing a more
//! advanced state than they last wrote and never roll it back.

use std::collections::HashMap;

use models::{Task, TaskStatus};
use parking_lot::RwLock;

use crate::{persistence::DailyJsonPersistence, StoreError};

pub struct TaskStore {
    production: bool,
    tasks: RwLock<HashMap<String, Task>>,
    persistence: DailyJsonPersistence,
}

impl TaskStore {
    /// Open the store and load the current on-disk state into memory.
    pub fn open(persistence: DailyJsonPersistence, production: bool) -> Self {
        let tasks = persistence.load_tasks_all();
        Self {
            production,
            tasks: RwLock::new(tasks),
            persistence,
        }
    }

    pub fn persistence(&self) -> &DailyJsonPersistence {
        &self.persistence
    }

    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    /// Insert a freshly created task and persist.
    pub fn insert(&self, task: Task) -> Result<(), StoreError> {
        self.tasks.write().insert(task.task_id.clone(), task);
        self.save()
    }

    /// Fetch one task. Production mode falls back to shared persistence and
    /// refreshes the local cache when the disk copy is newer.
    pub fn get(&self, task_id: &str) -> Option<Task> {
        let local = self.tasks.read().get(task_id).cloned();

        if !self.production {
            return local;
        }

        let persisted = self.persistence.load_task(task_id);

        match (local, persisted) {
            (None, None) => None,
            (Some(local), None) => Some(local),
            (None, Some(persisted)) => {
                tracing::info!(task_id, "loaded task from shared persistence");
                self.tasks
                    .write()
                    .insert(task_id.to_string(), persisted.clone());
                Some(persisted)
            }
            (Some(local), Some(persisted)) => {
                if persisted.updated_at_instant() > local.updated_at_instant() {
                    tracing::info!(task_id, "refreshed task from shared persistence");
                    self.tasks
                        .write()
                        .insert(task_id.to_string(), persisted.clone());
                    Some(persisted)
                } else {
                    Some(local)
                }
            }
        }
    }

    /// Read-modify-write one task against the freshest visible copy, then
    /// persist. Returns the updated record, or `None` for an unknown id.
    pub fn update(
        &self,
        task_id: &str,
        mutate: impl FnOnce(&mut Task),
    ) -> Result<Option<Task>, StoreError> {
        let Some(mut task) = self.get(task_id) else {
            return Ok(None);
        };
        mutate(&mut task);
        task.touch();
        self.tasks.write().insert(task_id.to_string(), task.clone());
        self.save()?;
        Ok(Some(task))
    }

    /// Drop a task from the in-memory view. Dev mode also removes its file
    /// on the next save; shared mode leaves files alone (another worker may
    /// still own the id).
    pub fn remove(&self, task_id: &str) -> Option<Task> {
        self.tasks.write().remove(task_id)
    }

    /// A consistent snapshot of all tasks. Production refreshes the local
    /// cache from the shared merge first.
    pub fn snapshot(&self) -> HashMap<String, Task> {
        if !self.production {
            return self.tasks.read().clone();
        }

        let merged = self.merge_with_persistence();
        *self.tasks.write() = merged.clone();
        merged
    }

    /// Persist the current state.
    pub fn save(&self) -> Result<(), StoreError> {
        if self.production {
            let merged = self.merge_with_persistence();
            self.persistence.upsert_tasks(&merged)?;
            *self.tasks.write() = merged;
            Ok(())
        } else {
            let tasks = self.tasks.read().clone();
            self.persistence.save_tasks(&tasks)
        }
    }

    fn merge_with_persistence(&self) -> HashMap<String, Task> {
        let mut merged = self.persistence.load_tasks_all();

        for (task_id, local) in self.tasks.read().iter() {
            match merged.get(task_id) {
                Some(persisted)
                    if persisted.updated_at_instant() > local.updated_at_instant() => {}
                _ => {
                    merged.insert(task_id.clone(), local.clone());
                }
            }
        }

        merged
    }

    /// Task counts per status, for monitoring surfaces.
    pub fn status_counts(&self) -> HashMap<TaskStatus, usize> {
        let mut counts = HashMap::new();
        for task in self.tasks.read().values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }

    /// Evict terminal tasks older than the retention horizon and drop old
    /// day directories. Returns `(evicted_tasks, deleted_directories)`.
    pub fn cleanup(&self, days_to_keep: u64) -> (usize, usize) {
        let horizon = chrono::Utc::now() - chrono::Duration::days(days_to_keep as i64);

        let expired: Vec<String> = self
            .tasks
            .read()
            .iter()
            .filter(|(_, t)| t.status.is_terminal() && t.created_at_instant() < horizon)
            .map(|(id, _)| id.clone())
            .collect();

        {
            let mut map = self.tasks.write();
            for id in &expired {
                map.remove(id);
                tracing::info!(task_id = %id, "task cleaned up past retention horizon");
            }
        }

        let deleted_dirs = self.persistence.cleanup_old_files(days_to_keep);
        (expired.len(), deleted_dirs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::{TaskRequest, TaskStatus};
    use std::time::Duration;

    fn store(dir: &std::path::Path, production: bool) -> TaskStore {
        TaskStore::open(
            DailyJsonPersistence::new(dir, Duration::from_secs(2)),
            production,
        )
    }

    fn task(task_id: &str) -> Task {
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
        Task::from_request(&request, task_id.into(), "r1".into(), None)
    }

    #[test]
    fn dev_mode_insert_update_get() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path(), false);

        s.insert(task("t1")).unwrap();
        let before = s.get("t1").unwrap().updated_at_instant();

        let updated = s
            .update("t1", |t| t.status = TaskStatus::Completed)
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Completed);
        assert!(updated.updated_at_instant() >= before);

        assert!(s.update("missing", |_| {}).unwrap().is_none());
    }

    #[test]
    fn reopen_recovers_persisted_tasks() {
        let dir = tempfile::tempdir().unwrap();
        {
            let s = store(dir.path(), false);
            s.insert(task("t1")).unwrap();
        }
        let reopened = store(dir.path(), false);
        assert!(reopened.get("t1").is_some());
    }

    #[test]
    fn production_save_does_not_delete_sibling_tasks() {
        let dir = tempfile::tempdir().unwrap();

        // Worker A persists ta.
        let a = store(dir.path(), true);
        a.insert(task("ta")).unwrap();

        // Worker B starts with an empty view and persists tb.
        let b = TaskStore::open(
            DailyJsonPersistence::new(dir.path(), Duration::from_secs(2)),
            true,
        );
        b.insert(task("tb")).unwrap();

        // Both workers now see both tasks, and A's next save keeps tb.
        a.save().unwrap();
        assert!(a.get("ta").is_some());
        assert!(a.get("tb").is_some());
        let snapshot = b.snapshot();
        assert!(snapshot.contains_key("ta"));
        assert!(snapshot.contains_key("tb"));
    }

    #[test]
    fn production_get_prefers_newer_disk_copy() {
        let dir = tempfile::tempdir().unwrap();

        let a = store(dir.path(), true);
        a.insert(task("t1")).unwrap();

        let b = TaskStore::open(
            DailyJsonPersistence::new(dir.path(), Duration::from_secs(2)),
            true,
        );
        // B advances the task and persists it.
        b.update("t1", |t| t.status = TaskStatus::Completed).unwrap();

        // A still has the running copy cached; get() must surface B's.
        let seen = a.get("t1").unwrap();
        assert_eq!(seen.status, TaskStatus::Completed);
    }

    #[test]
    fn stale_write_loses_the_merge() {
        let dir = tempfile::tempdir().unwrap();

        let a = store(dir.path(), true);
        a.insert(task("t1")).unwrap();

        let b = TaskStore::open(
            DailyJsonPersistence::new(dir.path(), Duration::from_secs(2)),
            true,
        );
        b.update("t1", |t| t.status = TaskStatus::Completed).unwrap();

        // A saves its stale running copy; the merge keeps B's newer one.
        a.save().unwrap();
        let snapshot = a.snapshot();
        assert_eq!(snapshot["t1"].status, TaskStatus::Completed);
    }

    #[test]
    fn cleanup_evicts_only_old_terminal_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path(), false);

        let mut old_done = task("old-done");
        old_done.status = TaskStatus::Completed;
        old_done.created_at = (chrono::Utc::now() - chrono::Duration::days(45)).to_rfc3339();
        let mut old_running = task("old-running");
        old_running.created_at = (chrono::Utc::now() - chrono::Duration::days(45)).to_rfc3339();

        s.insert(old_done).unwrap();
        s.insert(old_running).unwrap();
        s.insert(task("fresh")).unwrap();

        let (evicted, _) = s.cleanup(30);
        assert_eq!(evicted, 1);
        assert!(s.get("old-done").is_none());
        assert!(s.get("old-running").is_some());
        assert!(s.get("fresh").is_some());
    }
}
