// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Persistence layer: daily-rotated JSON task files, the shared runner
//! store, the in-memory task store with its cross-worker merge protocol, and
//! the append-only statistics sink.
//!
//! Cross-process coordination is a single authoritative file per entity map,
//! guarded by an OS-level advisory lock with a bounded acquisition deadline.
//! Lock timeouts are surfaced as [`StoreError::LockTimeout`], never retried
//! silently.

pub mod lock;
pub mod persistence;
pub mod runner_store;
pub mod stats;
pub mod task_store;

use std::path::{Path, PathBuf};

pub use persistence::DailyJsonPersistence;
pub use runner_store::RunnerStore;
pub use stats::StatsSink;
pub use task_store::TaskStore;

/// Handles to every persistent map the manager owns. Built once at startup
/// and passed to handlers and background workers; nothing reaches for
/// ambient state.
pub struct Stores {
    pub runners: RunnerStore,
    pub tasks: TaskStore,
    pub stats: StatsSink,
}

impl Stores {
    /// Open all stores under `data_dir`. Production selects the shared,
    /// file-locked runner map and the merge-upsert task save path.
    pub fn open(data_dir: &Path, production: bool) -> Result<Self, StoreError> {
        let lock_timeout = persistence::DEFAULT_LOCK_TIMEOUT;

        let runners = if production {
            RunnerStore::shared(data_dir.join("runners_state.json"), lock_timeout)?
        } else {
            RunnerStore::in_memory()
        };

        let tasks = TaskStore::open(
            DailyJsonPersistence::new(data_dir, lock_timeout),
            production,
        );

        let stats = StatsSink::new(data_dir.join("task_stats.csv"), lock_timeout);

        Ok(Self {
            runners,
            tasks,
            stats,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("timed out acquiring file lock at {}", path.display())]
    LockTimeout { path: PathBuf },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("statistics write error: {0}")]
    Csv(#[from] csv::Error),
}
