//! Per-server health tracking.
//!
//! State machine:
//! `unknown → healthy` on first successful probe, `healthy → unhealthy` after
//! N consecutive errors, `→ disabled` after M cumulative errors. `disabled`
//! is sticky: it persists to `health/<server>.json` across restarts and only
//! an explicit enable clears it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, warn};

use crate::config::Paths;
use crate::utils::{atomic_write, now_ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
    Disabled,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthState::Unknown => "unknown",
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
            HealthState::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HealthRecord {
    #[serde(default)]
    pub state: HealthState,
    /// Consecutive errors since the last success.
    #[serde(rename = "errorCount", default)]
    pub error_count: u32,
    /// Total errors over the server's lifetime in this profile.
    #[serde(rename = "cumulativeErrors", default)]
    pub cumulative_errors: u32,
    #[serde(rename = "lastError", default)]
    pub last_error: Option<String>,
    #[serde(rename = "lastCheckAtMs", default)]
    pub last_check_at_ms: Option<i64>,
    #[serde(rename = "disabledReason", default)]
    pub disabled_reason: Option<String>,
}

/// Single-writer store over small per-server records; readers get copies.
pub struct HealthStore {
    paths: Paths,
    records: Mutex<HashMap<String, HealthRecord>>,
}

impl HealthStore {
    /// Load persisted snapshots so quarantine survives restarts.
    pub fn load(paths: Paths) -> Self {
        let mut records = HashMap::new();
        if let Ok(entries) = std::fs::read_dir(paths.health_dir()) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_none_or(|e| e != "json") {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                match std::fs::read_to_string(&path)
                    .map_err(anyhow::Error::from)
                    .and_then(|c| serde_json::from_str::<HealthRecord>(&c).map_err(Into::into))
                {
                    Ok(record) => {
                        records.insert(stem.to_string(), record);
                    }
                    Err(e) => warn!("ignoring unreadable health snapshot {}: {}", path.display(), e),
                }
            }
        }
        Self {
            paths,
            records: Mutex::new(records),
        }
    }

    pub fn get(&self, server: &str) -> HealthRecord {
        self.records
            .lock()
            .expect("health store lock")
            .get(server)
            .cloned()
            .unwrap_or_default()
    }

    pub fn all(&self) -> HashMap<String, HealthRecord> {
        self.records.lock().expect("health store lock").clone()
    }

    pub fn is_disabled(&self, server: &str) -> bool {
        self.get(server).state == HealthState::Disabled
    }

    /// Record a successful probe or call. Resets the consecutive error count
    /// and promotes to healthy — unless the server is disabled, which only an
    /// explicit enable clears.
    pub fn record_success(&self, server: &str) -> HealthRecord {
        let mut records = self.records.lock().expect("health store lock");
        let record = records.entry(server.to_string()).or_default();
        if record.state != HealthState::Disabled {
            record.state = HealthState::Healthy;
            record.error_count = 0;
            record.last_error = None;
        }
        record.last_check_at_ms = Some(now_ms());
        let snapshot = record.clone();
        drop(records);
        self.persist(server, &snapshot);
        snapshot
    }

    /// Record a health-affecting failure. Transitions to unhealthy after
    /// `unhealthy_after` consecutive errors and to disabled after
    /// `disable_after` cumulative errors.
    pub fn record_failure(
        &self,
        server: &str,
        error: &str,
        unhealthy_after: u32,
        disable_after: u32,
    ) -> HealthRecord {
        let mut records = self.records.lock().expect("health store lock");
        let record = records.entry(server.to_string()).or_default();
        record.error_count += 1;
        record.cumulative_errors += 1;
        record.last_error = Some(error.to_string());
        record.last_check_at_ms = Some(now_ms());

        if record.state != HealthState::Disabled {
            if record.cumulative_errors >= disable_after {
                record.state = HealthState::Disabled;
                record.disabled_reason = Some(format!(
                    "quarantined after {} errors (last: {})",
                    record.cumulative_errors, error
                ));
                warn!("server '{}' quarantined: {}", server, error);
            } else if record.error_count >= unhealthy_after {
                record.state = HealthState::Unhealthy;
            }
        }
        let snapshot = record.clone();
        drop(records);
        self.persist(server, &snapshot);
        snapshot
    }

    /// Manual enable/disable. Enabling clears quarantine and both error
    /// counters; disabling records the operator-supplied reason.
    pub fn set_enabled(&self, server: &str, enabled: bool, reason: Option<String>) -> HealthRecord {
        let mut records = self.records.lock().expect("health store lock");
        let record = records.entry(server.to_string()).or_default();
        if enabled {
            record.state = HealthState::Unknown;
            record.error_count = 0;
            record.cumulative_errors = 0;
            record.last_error = None;
            record.disabled_reason = None;
            info!("server '{}' re-enabled", server);
        } else {
            record.state = HealthState::Disabled;
            record.disabled_reason = reason.or_else(|| Some("disabled by operator".to_string()));
            info!("server '{}' disabled", server);
        }
        let snapshot = record.clone();
        drop(records);
        self.persist(server, &snapshot);
        snapshot
    }

    fn persist(&self, server: &str, record: &HealthRecord) {
        let path = self.paths.health_file(server);
        match serde_json::to_string_pretty(record) {
            Ok(json) => {
                if let Err(e) = atomic_write(&path, &json) {
                    warn!("failed to persist health for '{}': {}", server, e);
                }
            }
            Err(e) => warn!("failed to serialize health for '{}': {}", server, e),
        }
    }
}
