// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use fs2::FileExt;

use crate::StoreError;

const LOCK_RETRY_SLEEP: Duration = Duration::from_millis(50);

/// Advisory exclusive lock on a sidecar file, released on drop.
///
/// Acquisition polls `try_lock_exclusive` until the deadline; a miss surfaces
/// as [`StoreError::LockTimeout`] so the caller can report an operator-visible
/// error instead of hanging a worker.
pub struct FileLockGuard {
    file: File,
    path: PathBuf,
}

impl FileLockGuard {
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;

        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    })
                }
                Err(_) if Instant::now() < deadline => std::thread::sleep(LOCK_RETRY_SLEEP),
                Err(_) => {
                    tracing::error!(path = %path.display(), "timed out acquiring file lock");
                    return Err(StoreError::LockTimeout {
                        path: path.to_path_buf(),
                    });
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
