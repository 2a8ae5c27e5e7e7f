//! Cron-style scheduler: durable jobs fired through the router's `run` entry
//! point, with execution history.
//!
//! One dispatcher loop holds the earliest-firing active job in a min-heap
//! keyed by next-fire time, sleeps until the head's deadline, and fires it on
//! a spawned task. At most one execution per job is in flight — a firing that
//! lands while the previous one is still running is skipped, not queued.
//! Every execution goes through the router, so job runs respect the same
//! validation and confirmation policy as direct upstream calls.

pub mod natural;

mod store;
mod types;

pub use natural::{detect_system_timezone, parse_schedule};
pub use store::{CleanupReport, JobStore};
pub use types::{ExecStatus, ExecutionRecord, Job, JobSchedule, JobStatus, next_fire, validate_cron_expr};

use chrono::Utc;
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Paths;
use crate::errors::{PatchbayError, PatchbayResult};
use crate::router::Router;

/// Consecutive failed executions before a job transitions to `error`.
const FAILURE_THRESHOLD: u32 = 3;
const POLL_WHEN_EMPTY: Duration = Duration::from_secs(30);
const MAX_SLEEP: Duration = Duration::from_secs(30);
const CLEANUP_MAX_AGE_DAYS: u32 = 14;
const CLEANUP_KEEP_PER_JOB: usize = 100;
const RESULT_SUMMARY_CHARS: usize = 200;

/// Creation request; everything else on [`Job`] is assigned.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub tool_id: String,
    pub parameters: Value,
    pub schedule: JobSchedule,
    pub max_executions: Option<u32>,
    pub end_at: Option<chrono::DateTime<Utc>>,
    pub fire_once: bool,
    pub description: Option<String>,
}

pub struct Scheduler {
    store: JobStore,
    router: Arc<Router>,
    running: AtomicBool,
    wake: Notify,
    in_flight: Mutex<HashSet<String>>,
}

impl Scheduler {
    pub fn new(router: Arc<Router>, paths: Paths) -> Self {
        Self {
            store: JobStore::new(paths),
            router,
            running: AtomicBool::new(false),
            wake: Notify::new(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn create_job(&self, spec: JobSpec) -> PatchbayResult<Job> {
        if self.store.find_by_name(&spec.name).is_some() {
            return Err(PatchbayError::InvalidParams(format!(
                "a job named '{}' already exists",
                spec.name
            )));
        }
        let now = Utc::now();
        let next = next_fire(&spec.schedule, now);
        if next.is_none() {
            return Err(PatchbayError::InvalidParams(
                "schedule never fires (one-shot timestamp in the past?)".to_string(),
            ));
        }
        let job = Job {
            id: Uuid::new_v4().to_string(),
            name: spec.name,
            tool_id: spec.tool_id,
            parameters: spec.parameters,
            schedule: spec.schedule,
            status: JobStatus::Active,
            created_at: now,
            last_fired_at: None,
            execution_count: 0,
            max_executions: spec.max_executions,
            end_at: spec.end_at,
            fire_once: spec.fire_once,
            description: spec.description,
            consecutive_failures: 0,
            next_fire_at: next,
        };
        self.store.save_job(&job)?;
        self.wake.notify_one();
        info!("job '{}' created ({})", job.name, job.id);
        Ok(job)
    }

    pub fn list_jobs(&self) -> Vec<Job> {
        self.store.load_jobs()
    }

    /// Look a job up by id, falling back to its unique name.
    pub fn get_job(&self, id_or_name: &str) -> PatchbayResult<Job> {
        self.store
            .get_job(id_or_name)
            .or_else(|| self.store.find_by_name(id_or_name))
            .ok_or_else(|| PatchbayError::NotFound(format!("job '{}'", id_or_name)))
    }

    pub fn pause_job(&self, id_or_name: &str) -> PatchbayResult<Job> {
        let mut job = self.get_job(id_or_name)?;
        job.status = JobStatus::Paused;
        job.next_fire_at = None;
        self.store.save_job(&job)?;
        self.wake.notify_one();
        Ok(job)
    }

    /// Resume a paused (or errored) job; failure counters reset.
    pub fn resume_job(&self, id_or_name: &str) -> PatchbayResult<Job> {
        let mut job = self.get_job(id_or_name)?;
        job.status = JobStatus::Active;
        job.consecutive_failures = 0;
        job.next_fire_at = next_fire(&job.schedule, Utc::now());
        if job.next_fire_at.is_none() {
            job.status = JobStatus::Completed;
        }
        self.store.save_job(&job)?;
        self.wake.notify_one();
        Ok(job)
    }

    pub fn delete_job(&self, id_or_name: &str) -> PatchbayResult<Job> {
        let job = self.get_job(id_or_name)?;
        self.store.delete_job(&job.id);
        self.wake.notify_one();
        Ok(job)
    }

    pub fn cleanup(&self) -> CleanupReport {
        self.store
            .cleanup_executions(CLEANUP_MAX_AGE_DAYS, CLEANUP_KEEP_PER_JOB)
    }

    /// Fire one job immediately through the normal execution path.
    pub async fn run_job_now(self: &Arc<Self>, id_or_name: &str) -> PatchbayResult<ExecutionRecord> {
        let mut job = self.get_job(id_or_name)?;
        job.last_fired_at = Some(Utc::now());
        job.execution_count += 1;
        self.store.save_job(&job)?;
        Ok(self.execute(job).await)
    }

    /// Restore the active-job ⇔ live-timer invariant from the durable store:
    /// next-fire times are recomputed from *now* (missed firings are skipped,
    /// not replayed), paused jobs stay paused.
    pub fn restore(&self) {
        let now = Utc::now();
        for mut job in self.store.load_jobs() {
            if job.status != JobStatus::Active {
                continue;
            }
            let next = next_fire(&job.schedule, now);
            if next.is_none() {
                info!("job '{}' has no future firing; marking completed", job.name);
                job.status = JobStatus::Completed;
            }
            if job.next_fire_at != next || job.status != JobStatus::Active {
                job.next_fire_at = next;
                if let Err(e) = self.store.save_job(&job) {
                    warn!("failed to persist restored job '{}': {}", job.id, e);
                }
            }
        }
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// The dispatcher loop. Runs until [`shutdown`](Self::shutdown).
    pub async fn run_loop(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        self.restore();
        info!("scheduler started");

        while self.running.load(Ordering::SeqCst) {
            let mut heap: BinaryHeap<Reverse<(chrono::DateTime<Utc>, String)>> = BinaryHeap::new();
            for job in self.store.load_jobs() {
                if job.status == JobStatus::Active {
                    if let Some(next) = job.next_fire_at {
                        heap.push(Reverse((next, job.id)));
                    }
                }
            }

            let Some(Reverse((due, job_id))) = heap.pop() else {
                self.wait(POLL_WHEN_EMPTY).await;
                continue;
            };

            let now = Utc::now();
            if due > now {
                let until = (due - now).to_std().unwrap_or(MAX_SLEEP);
                self.wait(until.min(MAX_SLEEP)).await;
                continue;
            }

            self.fire(&job_id);
        }
        info!("scheduler stopped");
    }

    async fn wait(&self, duration: Duration) {
        tokio::select! {
            () = tokio::time::sleep(duration) => {}
            () = self.wake.notified() => {}
        }
    }

    /// Advance a due job and spawn its execution. Advancing next-fire happens
    /// before executing so the job cannot re-fire on the next pass; a firing
    /// that lands while the previous execution is in flight is skipped.
    fn fire(self: &Arc<Self>, job_id: &str) {
        let Some(mut job) = self.store.get_job(job_id) else {
            return;
        };
        if job.status != JobStatus::Active {
            return;
        }
        let now = Utc::now();
        job.next_fire_at = next_fire(&job.schedule, now);

        let busy = self
            .in_flight
            .lock()
            .expect("in-flight lock")
            .contains(&job.id);
        if busy {
            info!(
                "skipping firing of '{}': previous execution still running",
                job.name
            );
            if let Err(e) = self.store.save_job(&job) {
                warn!("failed to persist job '{}': {}", job.id, e);
            }
            return;
        }

        job.last_fired_at = Some(now);
        job.execution_count += 1;
        if let Err(e) = self.store.save_job(&job) {
            warn!("failed to persist job '{}' before firing: {}", job.id, e);
            return;
        }

        self.in_flight
            .lock()
            .expect("in-flight lock")
            .insert(job.id.clone());
        let scheduler = self.clone();
        let id = job.id.clone();
        info!("firing job '{}' ({})", job.name, job.id);
        tokio::spawn(async move {
            scheduler.execute(job).await;
            scheduler
                .in_flight
                .lock()
                .expect("in-flight lock")
                .remove(&id);
            scheduler.wake.notify_one();
        });
    }

    /// Run one execution through the router and record the outcome.
    async fn execute(&self, job: Job) -> ExecutionRecord {
        let started = std::time::Instant::now();
        let mut record = ExecutionRecord {
            execution_id: Uuid::new_v4().to_string(),
            job_id: job.id.clone(),
            job_name: job.name.clone(),
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            status: ExecStatus::Running,
            error_message: None,
            result_summary: None,
        };
        if let Err(e) = self.store.save_execution(&record) {
            warn!("failed to persist execution record: {}", e);
        }

        let outcome = self.router.run(&job.tool_id, job.parameters.clone()).await;

        record.ended_at = Some(Utc::now());
        record.duration_ms = Some(started.elapsed().as_millis() as u64);
        let failed = match outcome {
            Ok(value) => {
                record.status = ExecStatus::Success;
                record.result_summary = Some(summarize_result(&value));
                false
            }
            Err(run_err) => {
                record.status = if matches!(run_err.error, PatchbayError::Timeout(_)) {
                    ExecStatus::Timeout
                } else {
                    ExecStatus::Failure
                };
                record.error_message = Some(format!(
                    "[{}] {}",
                    run_err.error.kind(),
                    run_err.error.client_message()
                ));
                warn!("job '{}' failed: {}", job.name, run_err.error);
                true
            }
        };
        if let Err(e) = self.store.save_execution(&record) {
            warn!("failed to persist execution record: {}", e);
        }

        // Re-read the job: a pause or delete may have landed mid-execution.
        if let Some(mut current) = self.store.get_job(&job.id) {
            current.consecutive_failures = if failed {
                current.consecutive_failures + 1
            } else {
                0
            };
            if current.status == JobStatus::Active {
                let now = Utc::now();
                if current.consecutive_failures >= FAILURE_THRESHOLD {
                    warn!(
                        "job '{}' errored after {} consecutive failures",
                        current.name, current.consecutive_failures
                    );
                    current.status = JobStatus::Error;
                    current.next_fire_at = None;
                } else if current.fire_once
                    || current
                        .max_executions
                        .is_some_and(|max| current.execution_count >= max)
                    || current.end_at.is_some_and(|end| now >= end)
                    || current.next_fire_at.is_none()
                {
                    current.status = JobStatus::Completed;
                    current.next_fire_at = None;
                }
            }
            if let Err(e) = self.store.save_job(&current) {
                warn!("failed to persist job '{}' after execution: {}", current.id, e);
            }
        }
        record
    }
}

/// Short human-readable summary of a result envelope.
fn summarize_result(value: &Value) -> String {
    let text = value
        .pointer("/content/0/text")
        .and_then(Value::as_str)
        .unwrap_or("(no text content)");
    text.chars().take(RESULT_SUMMARY_CHARS).collect()
}
