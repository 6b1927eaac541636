pub mod client;
pub mod engine;
pub mod runner;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

use crate::config::JOB_LOG_LIMIT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Complete,
    Failed,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed | JobStatus::Error)
    }
}

/// What a status poll returns. A summary of the run, never its results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub status: JobStatus,
    pub progress: u64,
    pub total: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Default for JobProgress {
    fn default() -> Self {
        Self {
            status: JobStatus::Queued,
            progress: 0,
            total: 0,
            logs: Vec::new(),
            eval_id: None,
            finished_at: None,
        }
    }
}

impl JobProgress {
    pub fn percent(&self) -> u64 {
        progress_percent(self.progress, self.total)
    }

    // Each transition returns whether anything changed. Status only moves
    // forward: queued, running, then one terminal state.

    fn start(&mut self) -> bool {
        if self.status != JobStatus::Queued {
            return false;
        }
        self.status = JobStatus::Running;
        true
    }

    fn set_total(&mut self, total: u64) -> bool {
        if self.status.is_terminal() || self.total == total {
            return false;
        }
        self.total = total;
        true
    }

    fn advance(&mut self, by: u64) -> bool {
        if self.status.is_terminal() || by == 0 {
            return false;
        }
        self.progress += by;
        true
    }

    fn log(&mut self, line: String) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if self.logs.len() >= JOB_LOG_LIMIT {
            self.logs.remove(0);
        }
        self.logs.push(line);
        true
    }

    fn finish(&mut self, status: JobStatus, eval_id: Option<String>, lines: Vec<String>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        if eval_id.is_some() {
            self.eval_id = eval_id;
        }
        self.logs.extend(lines);
        if self.logs.len() > JOB_LOG_LIMIT {
            let excess = self.logs.len() - JOB_LOG_LIMIT;
            self.logs.drain(..excess);
        }
        self.finished_at = Some(Utc::now());
        true
    }
}

/// `round(100 * progress / total)`, or 0 when nothing is scheduled.
pub fn progress_percent(progress: u64, total: u64) -> u64 {
    if total == 0 {
        return 0;
    }
    (progress as f64 / total as f64 * 100.0).round() as u64
}

/// Write side of one job, held by whatever executes it.
#[derive(Clone)]
pub struct JobHandle {
    pub id: String,
    progress: Arc<watch::Sender<JobProgress>>,
}

impl JobHandle {
    fn update(&self, f: impl FnOnce(&mut JobProgress) -> bool) -> bool {
        self.progress.send_if_modified(f)
    }

    /// Moves a queued job to running. False if it already started or finished.
    pub fn start(&self) -> bool {
        self.update(JobProgress::start)
    }

    pub fn set_total(&self, total: u64) {
        self.update(|p| p.set_total(total));
    }

    pub fn advance(&self) {
        self.update(|p| p.advance(1));
    }

    pub fn log(&self, line: impl Into<String>) {
        let line = line.into();
        self.update(|p| p.log(line));
    }

    pub fn complete(&self, eval_id: &str) -> bool {
        self.update(|p| p.finish(JobStatus::Complete, Some(eval_id.to_string()), Vec::new()))
    }

    pub fn fail(&self, status: JobStatus, lines: Vec<String>) -> bool {
        self.update(|p| p.finish(status, None, lines))
    }

    pub fn is_finished(&self) -> bool {
        self.progress.borrow().status.is_terminal()
    }

    pub fn snapshot(&self) -> JobProgress {
        self.progress.borrow().clone()
    }
}

/// All jobs known to this process, keyed by id.
#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, JobHandle>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new queued job.
    pub async fn create(&self) -> JobHandle {
        let (tx, _) = watch::channel(JobProgress::default());
        let handle = JobHandle {
            id: uuid::Uuid::new_v4().to_string(),
            progress: Arc::new(tx),
        };
        self.jobs
            .write()
            .await
            .insert(handle.id.clone(), handle.clone());
        debug!("Registered job {}", handle.id);
        handle
    }

    pub async fn get(&self, id: &str) -> Option<JobProgress> {
        self.jobs.read().await.get(id).map(JobHandle::snapshot)
    }

    /// Live view of one job; the receiver always holds the latest state.
    pub async fn subscribe(&self, id: &str) -> Option<watch::Receiver<JobProgress>> {
        self.jobs
            .read()
            .await
            .get(id)
            .map(|h| h.progress.subscribe())
    }

    /// Ends a queued or running job as failed. Returns `None` for unknown ids and
    /// `Some(false)` when the job had already finished.
    pub async fn cancel(&self, id: &str) -> Option<bool> {
        let jobs = self.jobs.read().await;
        let handle = jobs.get(id)?;
        let cancelled = handle.fail(JobStatus::Failed, vec!["Job cancelled".to_string()]);
        if cancelled {
            info!("Cancelled job {}", id);
        }
        Some(cancelled)
    }

    /// Drops finished jobs whose terminal state is older than `retention`.
    pub async fn prune_finished(&self, retention: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d))
        else {
            return 0;
        };
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, h| match h.progress.borrow().finished_at {
            Some(at) => at > cutoff,
            None => true,
        });
        let pruned = before - jobs.len();
        if pruned > 0 {
            debug!("Pruned {} finished jobs", pruned);
        }
        pruned
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }
}
