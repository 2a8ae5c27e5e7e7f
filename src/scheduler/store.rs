//! Durable job and execution storage: one JSON file per job under
//! `schedules/`, one per execution under `executions/`, written atomically.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use tracing::warn;

use super::types::{ExecutionRecord, Job};
use crate::config::Paths;
use crate::utils::atomic_write;

pub struct JobStore {
    paths: Paths,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed_by_age: usize,
    pub removed_by_cap: usize,
}

impl JobStore {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    pub fn save_job(&self, job: &Job) -> Result<()> {
        let json = serde_json::to_string_pretty(job).context("serializing job")?;
        atomic_write(&self.paths.job_file(&job.id), &json)
    }

    pub fn load_jobs(&self) -> Vec<Job> {
        let mut jobs = self.read_dir_json::<Job>(&self.paths.schedules_dir());
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }

    pub fn get_job(&self, job_id: &str) -> Option<Job> {
        let raw = std::fs::read_to_string(self.paths.job_file(job_id)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Job> {
        self.load_jobs().into_iter().find(|j| j.name == name)
    }

    pub fn delete_job(&self, job_id: &str) -> bool {
        std::fs::remove_file(self.paths.job_file(job_id)).is_ok()
    }

    pub fn save_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let json = serde_json::to_string_pretty(record).context("serializing execution")?;
        atomic_write(&self.paths.execution_file(&record.execution_id), &json)
    }

    /// Execution history, newest first, optionally filtered by job.
    pub fn load_executions(&self, job_id: Option<&str>) -> Vec<ExecutionRecord> {
        let mut records = self.read_dir_json::<ExecutionRecord>(&self.paths.executions_dir());
        if let Some(job_id) = job_id {
            records.retain(|r| r.job_id == job_id);
        }
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        records
    }

    /// Delete execution records older than `max_age_days` and cap the number
    /// retained per job (most recent kept).
    pub fn cleanup_executions(&self, max_age_days: u32, keep_per_job: usize) -> CleanupReport {
        let mut report = CleanupReport::default();
        let cutoff = Utc::now() - Duration::days(i64::from(max_age_days));

        let records = self.load_executions(None);
        let mut kept_per_job: std::collections::HashMap<&str, usize> =
            std::collections::HashMap::new();
        // `records` is newest-first, so the cap naturally keeps the latest.
        for record in &records {
            if record.started_at < cutoff {
                if self.remove_execution(&record.execution_id) {
                    report.removed_by_age += 1;
                }
                continue;
            }
            let kept = kept_per_job.entry(record.job_id.as_str()).or_insert(0);
            if *kept >= keep_per_job {
                if self.remove_execution(&record.execution_id) {
                    report.removed_by_cap += 1;
                }
            } else {
                *kept += 1;
            }
        }
        report
    }

    fn remove_execution(&self, execution_id: &str) -> bool {
        std::fs::remove_file(self.paths.execution_file(execution_id)).is_ok()
    }

    fn read_dir_json<T: serde::de::DeserializeOwned>(&self, dir: &std::path::Path) -> Vec<T> {
        let mut items = Vec::new();
        let Ok(entries) = std::fs::read_dir(dir) else {
            return items;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|raw| serde_json::from_str::<T>(&raw).map_err(Into::into))
            {
                Ok(item) => items.push(item),
                Err(e) => warn!("skipping unreadable record {}: {}", path.display(), e),
            }
        }
        items
    }
}
