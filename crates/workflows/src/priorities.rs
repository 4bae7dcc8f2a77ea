// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Domain-based priority policy.
//!
//! When priorities are enabled, a priority domain is defined (suffix match)
//! and a maximum percentage of non-priority tasks is configured. The
//! percentage applies to the registered runner count, giving a deterministic
//! ceiling on concurrently running non-priority tasks without a global
//! queue.

use std::collections::HashMap;

use models::{urlcheck::hostname_of, Task, TaskStatus};

pub fn is_priority_hostname(hostname: Option<&str>, priority_domain: &str) -> bool {
    let Some(hostname) = hostname else {
        return false;
    };
    let domain = priority_domain.trim().to_ascii_lowercase();
    if domain.is_empty() {
        return false;
    }
    hostname == domain || hostname.ends_with(&format!(".{domain}"))
}

pub fn is_priority_task(task: &Task, priority_domain: &str) -> bool {
    is_priority_hostname(hostname_of(&task.notify_url).as_deref(), priority_domain)
}

/// Currently running tasks whose notify host does not match the priority
/// domain.
pub fn other_domain_running_count(tasks: &HashMap<String, Task>, priority_domain: &str) -> usize {
    tasks
        .values()
        .filter(|t| t.status == TaskStatus::Running)
        .filter(|t| !is_priority_task(t, priority_domain))
        .count()
}

/// `floor(capacity * percent / 100)` with the percent clamped to 0..=100.
pub fn max_other_concurrent_tasks(runner_capacity: usize, max_other_percent: u32) -> usize {
    let pct = max_other_percent.min(100) as f64;
    ((runner_capacity as f64) * (pct / 100.0)).floor() as usize
}

/// True when admitting a task with `request_notify_url` would exceed the
/// non-priority concurrency quota. Priority requests are never rejected
/// here.
pub fn would_exceed_other_domain_quota(
    request_notify_url: &str,
    tasks: &HashMap<String, Task>,
    runner_capacity: usize,
    priority_domain: &str,
    max_other_percent: u32,
) -> bool {
    let request_hostname = hostname_of(request_notify_url);
    if is_priority_hostname(request_hostname.as_deref(), priority_domain) {
        return false;
    }

    let allowed_other = max_other_concurrent_tasks(runner_capacity, max_other_percent);
    let current_other = other_domain_running_count(tasks, priority_domain);

    let reject = current_other >= allowed_other;
    if reject {
        tracing::info!(
            hostname = request_hostname.as_deref().unwrap_or(""),
            priority_domain,
            current_other,
            allowed_other,
            runner_capacity,
            "priority quota reached: rejecting non-priority task"
        );
    }
    reject
}
