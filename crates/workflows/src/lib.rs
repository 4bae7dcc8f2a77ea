// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Service layer: task admission, runner selection and handoff, the
//! domain-priority gate, and the long-running background workers (runner
//! liveness, task timeout, retention cleanup) with their supervisor.
//!
//! Everything here takes explicit store/config handles; transport composes
//! these services, the data layer knows nothing about them.

pub mod admission;
pub mod dispatch;
pub mod entry;
pub mod priorities;
pub mod runner_service;
pub mod task_service;

pub use admission::{submit_task, AdmissionError};
pub use entry::BackgroundServices;
