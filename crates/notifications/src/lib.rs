// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Outbound completion notifications: the callback POST to the client's
//! `notify_url`, the warning/restore status dance around delivery failures,
//! the background retry loop, and the URL-hardening pipeline every callback
//! target passes through (again at send time, against DNS rebinding).

pub mod engine;
pub mod urlguard;

pub use engine::{process_completion, CompletionError, CompletionOutcome};
pub use urlguard::{validate_notify_url, UrlGuardError};
