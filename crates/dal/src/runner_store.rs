// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Runner registry storage with two modes selected at process start.
//!
//! In-memory mode keeps a process-local map and is the right choice for a
//! single worker. Shared mode backs the map with one JSON file guarded by an
//! advisory lock: every operation takes the lock, reads the whole file,
//! mutates and writes it back atomically, so parallel workers always observe
//! a coherent registry.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use models::Runner;
use parking_lot::RwLock;
use serde_json::Value;

use crate::{lock::FileLockGuard, StoreError};

struct SharedState {
    state_file: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

pub struct RunnerStore {
    memory: RwLock<HashMap<String, Runner>>,
    shared: Option<SharedState>,
}

impl RunnerStore {
    pub fn in_memory() -> Self {
        tracing::info!("runner store initialized in in-memory mode");
        Self {
            memory: RwLock::new(HashMap::new()),
            shared: None,
        }
    }

    pub fn shared(state_file: impl Into<PathBuf>, lock_timeout: Duration) -> Result<Self, StoreError> {
        let state_file = state_file.into();
        if let Some(parent) = state_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let lock_path = PathBuf::from(format!("{}.lock", state_file.display()));
        let store = Self {
            memory: RwLock::new(HashMap::new()),
            shared: Some(SharedState {
                state_file: state_file.clone(),
                lock_path,
                lock_timeout,
            }),
        };

        if !state_file.exists() {
            store.with_shared_lock(|shared| write_disk(&shared.state_file, &HashMap::new()))?;
        }

        tracing::info!(file = %state_file.display(), "runner store initialized in shared mode");
        Ok(store)
    }

    fn with_shared_lock<T>(
        &self,
        op: impl FnOnce(&SharedState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let shared = self
            .shared
            .as_ref()
            .expect("with_shared_lock called on in-memory store");
        let _lock = FileLockGuard::acquire(&shared.lock_path, shared.lock_timeout)?;
        op(shared)
    }

    pub fn get(&self, id: &str) -> Result<Option<Runner>, StoreError> {
        match &self.shared {
            None => Ok(self.memory.read().get(id).cloned()),
            Some(_) => self.with_shared_lock(|s| Ok(read_disk(&s.state_file).remove(id))),
        }
    }

    pub fn insert(&self, runner: Runner) -> Result<(), StoreError> {
        match &self.shared {
            None => {
                self.memory.write().insert(runner.id.clone(), runner);
                Ok(())
            }
            Some(_) => self.with_shared_lock(|s| {
                let mut data = read_disk(&s.state_file);
                data.insert(runner.id.clone(), runner);
                write_disk(&s.state_file, &data)
            }),
        }
    }

    /// Read-modify-write a single runner under the store's lock. Returns
    /// false when the id is unknown.
    pub fn update(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Runner),
    ) -> Result<bool, StoreError> {
        match &self.shared {
            None => {
                let mut map = self.memory.write();
                match map.get_mut(id) {
                    Some(runner) => {
                        mutate(runner);
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            Some(_) => self.with_shared_lock(|s| {
                let mut data = read_disk(&s.state_file);
                match data.get_mut(id) {
                    Some(runner) => {
                        mutate(runner);
                        write_disk(&s.state_file, &data)?;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }),
        }
    }

    pub fn remove(&self, id: &str) -> Result<Option<Runner>, StoreError> {
        match &self.shared {
            None => Ok(self.memory.write().remove(id)),
            Some(_) => self.with_shared_lock(|s| {
                let mut data = read_disk(&s.state_file);
                let removed = data.remove(id);
                if removed.is_some() {
                    write_disk(&s.state_file, &data)?;
                }
                Ok(removed)
            }),
        }
    }

    pub fn contains(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.get(id)?.is_some())
    }

    pub fn entries(&self) -> Result<Vec<(String, Runner)>, StoreError> {
        match &self.shared {
            None => Ok(self
                .memory
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()),
            Some(_) => {
                self.with_shared_lock(|s| Ok(read_disk(&s.state_file).into_iter().collect()))
            }
        }
    }

    pub fn values(&self) -> Result<Vec<Runner>, StoreError> {
        Ok(self.entries()?.into_iter().map(|(_, r)| r).collect())
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        match &self.shared {
            None => Ok(self.memory.read().len()),
            Some(_) => self.with_shared_lock(|s| Ok(read_disk(&s.state_file).len())),
        }
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        match &self.shared {
            None => {
                self.memory.write().clear();
                Ok(())
            }
            Some(_) => self.with_shared_lock(|s| write_disk(&s.state_file, &HashMap::new())),
        }
    }
}

fn read_disk(state_file: &Path) -> HashMap<String, Runner> {
    let raw = match std::fs::read_to_string(state_file) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
        Err(e) => {
            tracing::error!("failed to read runner state: {e}");
            return HashMap::new();
        }
    };

    let root: Value = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!("runner state JSON is invalid: {e}");
            return HashMap::new();
        }
    };

    let Value::Object(entries) = root else {
        tracing::error!("runner state JSON root must be an object");
        return HashMap::new();
    };

    let mut runners = HashMap::new();
    for (id, payload) in entries {
        match serde_json::from_value::<Runner>(payload) {
            Ok(runner) => {
                runners.insert(id, runner);
            }
            Err(e) => tracing::warn!("skipping invalid runner {id}: {e}"),
        }
    }
    runners
}

fn write_disk(state_file: &Path, data: &HashMap<String, Runner>) -> Result<(), StoreError> {
    let tmp_path = PathBuf::from(format!("{}.tmp", state_file.display()));
    std::fs::write(&tmp_path, serde_json::to_vec_pretty(data)?)?;
    std::fs::rename(&tmp_path, state_file)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use models::RunnerAvailability;

    fn runner(id: &str) -> Runner {
        Runner {
            id: id.into(),
            url: format!("http://{id}.example:8081"),
            task_types: vec!["encoding".into()],
            status: "online".into(),
            availability: RunnerAvailability::Available,
            last_heartbeat: Utc::now(),
            token: Some("tok".into()),
            version: Some("0.9.0".into()),
        }
    }

    #[test]
    fn in_memory_crud() {
        let store = RunnerStore::in_memory();
        assert!(store.is_empty().unwrap());

        store.insert(runner("r1")).unwrap();
        assert!(store.contains("r1").unwrap());
        assert_eq!(store.len().unwrap(), 1);

        let updated = store
            .update("r1", |r| r.availability = RunnerAvailability::Busy)
            .unwrap();
        assert!(updated);
        assert_eq!(
            store.get("r1").unwrap().unwrap().availability,
            RunnerAvailability::Busy
        );

        assert!(!store.update("missing", |_| {}).unwrap());

        store.remove("r1").unwrap();
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn shared_mode_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("runners_state.json");

        let store = RunnerStore::shared(&state_file, Duration::from_secs(2)).unwrap();
        store.insert(runner("r1")).unwrap();
        store.insert(runner("r2")).unwrap();
        drop(store);

        // A second worker opening the same file sees both runners.
        let other = RunnerStore::shared(&state_file, Duration::from_secs(2)).unwrap();
        assert_eq!(other.len().unwrap(), 2);
        assert!(other.contains("r2").unwrap());

        other.remove("r1").unwrap();
        let third = RunnerStore::shared(&state_file, Duration::from_secs(2)).unwrap();
        assert_eq!(third.values().unwrap().len(), 1);
    }

    #[test]
    fn shared_mode_updates_are_visible_to_other_workers() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("runners_state.json");

        let a = RunnerStore::shared(&state_file, Duration::from_secs(2)).unwrap();
        let b = RunnerStore::shared(&state_file, Duration::from_secs(2)).unwrap();

        a.insert(runner("r1")).unwrap();
        b.update("r1", |r| r.availability = RunnerAvailability::Busy)
            .unwrap();

        assert_eq!(
            a.get("r1").unwrap().unwrap().availability,
            RunnerAvailability::Busy
        );

        // An unknown id through either handle is a clean false.
        assert!(!a.update("ghost", |_| {}).unwrap());
    }

    #[test]
    fn shared_mode_skips_invalid_entries() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("runners_state.json");
        std::fs::write(
            &state_file,
            r#"{"good": {"id": "good", "url": "http://good.example"}, "bad": 42}"#,
        )
        .unwrap();

        let store = RunnerStore::shared(&state_file, Duration::from_secs(2)).unwrap();
        let ids: Vec<String> = store.entries().unwrap().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["good".to_string()]);
    }

    #[test]
    fn shared_mode_survives_corrupt_root() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("runners_state.json");
        std::fs::write(&state_file, "[1, 2, 3]").unwrap();

        let store = RunnerStore::shared(&state_file, Duration::from_secs(2)).unwrap();
        assert!(store.is_empty().unwrap());

        // Writing repairs the file.
        store.insert(runner("r1")).unwrap();
        assert_eq!(store.len().unwrap(), 1);
    }
}
