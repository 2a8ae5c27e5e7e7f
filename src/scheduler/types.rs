use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use anyhow::Result;

/// Canonical stored schedule: a 5-field cron expression with an optional
/// IANA timezone, or a one-shot absolute timestamp. Natural-language input
/// is lowered to one of these before storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum JobSchedule {
    #[serde(rename = "cron")]
    Cron {
        expr: String,
        #[serde(default)]
        tz: Option<String>,
    },
    #[serde(rename = "at")]
    At { at: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Active,
    Paused,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    Running,
    Success,
    Failure,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// Unique per store.
    pub name: String,
    #[serde(rename = "toolId")]
    pub tool_id: String,
    #[serde(default)]
    pub parameters: Value,
    pub schedule: JobSchedule,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "lastFiredAt", default)]
    pub last_fired_at: Option<DateTime<Utc>>,
    #[serde(rename = "executionCount", default)]
    pub execution_count: u32,
    #[serde(rename = "maxExecutions", default)]
    pub max_executions: Option<u32>,
    #[serde(rename = "endAt", default)]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(rename = "fireOnce", default)]
    pub fire_once: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "consecutiveFailures", default)]
    pub consecutive_failures: u32,
    /// Informational; recomputed from the schedule on restart.
    #[serde(rename = "nextFireAt", default)]
    pub next_fire_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    #[serde(rename = "executionId")]
    pub execution_id: String,
    #[serde(rename = "jobId")]
    pub job_id: String,
    #[serde(rename = "jobName")]
    pub job_name: String,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "endedAt", default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(rename = "durationMs", default)]
    pub duration_ms: Option<u64>,
    pub status: ExecStatus,
    #[serde(rename = "errorMessage", default)]
    pub error_message: Option<String>,
    #[serde(rename = "resultSummary", default)]
    pub result_summary: Option<String>,
}

/// Normalize a cron expression to the 6-field form the `cron` crate parses
/// (prepend a seconds field to 5-field input), then validate.
pub fn validate_cron_expr(expr: &str) -> Result<String> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    };
    normalized
        .parse::<Schedule>()
        .map_err(|e| anyhow::anyhow!("Invalid cron expression '{}': {}", expr, e))?;
    Ok(normalized)
}

/// Next fire time strictly after `after`, or None when the schedule is
/// exhausted.
pub fn next_fire(schedule: &JobSchedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match schedule {
        JobSchedule::At { at } => {
            if *at > after {
                Some(*at)
            } else {
                None
            }
        }
        JobSchedule::Cron { expr, tz } => {
            let normalized = validate_cron_expr(expr).ok()?;
            let parsed = normalized.parse::<Schedule>().ok()?;
            let zone = match tz {
                Some(tz_str) => match tz_str.parse::<Tz>() {
                    Ok(zone) => zone,
                    Err(_) => {
                        warn!("invalid timezone '{}', falling back to UTC", tz_str);
                        Tz::UTC
                    }
                },
                None => Tz::UTC,
            };
            let local_after = after.with_timezone(&zone);
            parsed
                .after(&local_after)
                .next()
                .map(|dt| dt.with_timezone(&Utc))
        }
    }
}
