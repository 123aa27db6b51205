//! In-memory job registry polled by asynchronous callers

use genloop_common::MetricsRegistry;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};
use uuid::Uuid;

pub type JobId = String;

/// Job state machine: queued -> [loading] -> generating -> [encoding] -> done,
/// or any state -> error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Loading,
    Generating,
    Encoding,
    Done,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    /// Fraction in [0, 1]
    pub progress: f32,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub created_at: SystemTime,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Fields to merge into a job record; unset fields are left alone
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<f32>,
    pub error: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn progress(progress: f32) -> Self {
        Self {
            progress: Some(progress),
            ..Self::default()
        }
    }

    pub fn done(result: serde_json::Value) -> Self {
        Self {
            status: Some(JobStatus::Done),
            progress: Some(1.0),
            result: Some(result),
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Error),
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_progress(mut self, progress: f32) -> Self {
        self.progress = Some(progress);
        self
    }
}

pub struct JobTracker {
    jobs: RwLock<HashMap<JobId, Job>>,
    metrics: MetricsRegistry,
}

impl JobTracker {
    pub fn new(metrics: MetricsRegistry) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Register a queued job and return its id. Does not start any work.
    pub fn create(&self, metadata: serde_json::Map<String, serde_json::Value>) -> JobId {
        let id = Uuid::new_v4().simple().to_string();
        let job = Job {
            id: id.clone(),
            status: JobStatus::Queued,
            progress: 0.0,
            error: None,
            result: None,
            created_at: SystemTime::now(),
            metadata,
        };

        self.jobs.write().insert(id.clone(), job);
        self.metrics.jobs.created_total.inc();
        self.metrics.jobs.active.inc();
        debug!(job_id = %id, "Job created");

        id
    }

    /// Merge `update` into the job. Unknown ids and terminal jobs are left
    /// untouched.
    pub fn update(&self, id: &str, update: JobUpdate) {
        let mut jobs = self.jobs.write();
        let Some(job) = jobs.get_mut(id) else {
            debug!(job_id = %id, "Update for unknown job ignored");
            return;
        };

        if job.status.is_terminal() {
            debug!(job_id = %id, status = ?job.status, "Update for finished job ignored");
            return;
        }

        if let Some(progress) = update.progress {
            job.progress = progress.clamp(0.0, 1.0);
        }
        if let Some(error) = update.error {
            job.error = Some(error);
        }
        if let Some(result) = update.result {
            job.result = Some(result);
        }
        if let Some(status) = update.status {
            job.status = status;
            if status.is_terminal() {
                self.metrics.jobs.active.dec();
                if status == JobStatus::Error {
                    self.metrics.jobs.failed_total.inc();
                }
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.jobs.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }

    /// Evict jobs older than `max_age`, whatever their status
    pub fn cleanup(&self, max_age: Duration) -> usize {
        self.cleanup_as_of(SystemTime::now(), max_age)
    }

    pub fn cleanup_as_of(&self, now: SystemTime, max_age: Duration) -> usize {
        let mut jobs = self.jobs.write();
        let before = jobs.len();

        jobs.retain(|id, job| {
            // A creation time in the future (clock step) counts as age zero
            let age = now.duration_since(job.created_at).unwrap_or_default();
            let keep = age <= max_age;
            if !keep {
                if !job.status.is_terminal() {
                    self.metrics.jobs.active.dec();
                }
                debug!(job_id = %id, status = ?job.status, "Evicting job");
            }
            keep
        });

        let evicted = before - jobs.len();
        if evicted > 0 {
            self.metrics.jobs.evicted_total.inc_by(evicted as u64);
            info!("Evicted {} jobs older than {:?}", evicted, max_age);
        }
        evicted
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, id: &str, by: Duration) {
        if let Some(job) = self.jobs.write().get_mut(id) {
            job.created_at -= by;
        }
    }
}
