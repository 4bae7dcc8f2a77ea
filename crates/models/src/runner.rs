// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a runner is ready to accept a new task push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunnerAvailability {
    #[default]
    Available,
    Busy,
}

/// A worker node registered with the manager.
///
/// The same shape doubles as the registration payload: a runner POSTs its
/// record and the manager overwrites `token`, `version` and `last_heartbeat`
/// before storing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    /// Stable, client-supplied identifier.
    pub id: String,
    /// Base URL where the runner accepts task pushes and probes.
    pub url: String,
    /// Task types this runner declares it can execute.
    #[serde(default)]
    pub task_types: Vec<String>,
    /// Client-reported lifecycle label (`online`/`offline`). Persisted
    /// verbatim; the API's online flag is always derived from heartbeat age.
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub availability: RunnerAvailability,
    /// Wall-clock time of the last accepted heartbeat.
    #[serde(default = "Utc::now")]
    pub last_heartbeat: DateTime<Utc>,
    /// Bearer token the runner authenticated with at registration; required
    /// on every subsequent heartbeat and completion report.
    #[serde(default)]
    pub token: Option<String>,
    /// Runner software version as accepted by the version gate.
    #[serde(default)]
    pub version: Option<String>,
}

fn default_status() -> String {
    "online".to_string()
}

impl Runner {
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_heartbeat
    }

    /// Online iff the last heartbeat is younger than the staleness threshold.
    pub fn is_online(&self, now: DateTime<Utc>, staleness_seconds: u64) -> bool {
        self.heartbeat_age(now) < chrono::Duration::seconds(staleness_seconds as i64)
    }

    pub fn handles_task_type(&self, task_type: &str) -> bool {
        self.task_types.iter().any(|t| t == task_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(age_seconds: i64) -> Runner {
        Runner {
            id: "r1".into(),
            url: "http://r1.example:8081".into(),
            task_types: vec!["encoding".into(), "transcription".into()],
            status: "online".into(),
            availability: RunnerAvailability::Available,
            last_heartbeat: Utc::now() - chrono::Duration::seconds(age_seconds),
            token: Some("tok".into()),
            version: Some("0.9.0".into()),
        }
    }

    #[test]
    fn online_tracks_heartbeat_age() {
        let now = Utc::now();
        assert!(runner(10).is_online(now, 60));
        assert!(!runner(61).is_online(now, 60));
    }

    #[test]
    fn task_type_membership() {
        let r = runner(0);
        assert!(r.handles_task_type("encoding"));
        assert!(!r.handles_task_type("studio"));
    }

    #[test]
    fn availability_serializes_lowercase() {
        let r = runner(0);
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["availability"], "available");
    }

    #[test]
    fn registration_payload_defaults_apply() {
        // A minimal payload, as a freshly installed runner would send it.
        let r: Runner = serde_json::from_value(serde_json::json!({
            "id": "r2",
            "url": "http://r2.example"
        }))
        .unwrap();
        assert_eq!(r.status, "online");
        assert_eq!(r.availability, RunnerAvailability::Available);
        assert!(r.token.is_none());
    }
}
