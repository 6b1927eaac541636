use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

use super::engine::RunRequest;
use super::{JobProgress, JobStatus};
use crate::config::JOB_POLL_INTERVAL_MS;
use crate::error::{Result, StoreError};
use crate::evaluation::ResultsFile;

/// What one poll response means for the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Pending { percent: u64 },
    Complete { eval_id: Option<String> },
    Failed { message: String },
}

pub fn interpret_poll(progress: &JobProgress) -> PollOutcome {
    match progress.status {
        JobStatus::Queued => PollOutcome::Pending { percent: 0 },
        JobStatus::Running => PollOutcome::Pending {
            percent: progress.percent(),
        },
        JobStatus::Complete => PollOutcome::Complete {
            eval_id: progress.eval_id.clone(),
        },
        JobStatus::Failed | JobStatus::Error => {
            let message = progress.logs.join("\n");
            PollOutcome::Failed {
                message: if message.is_empty() {
                    "Job failed".to_string()
                } else {
                    message
                },
            }
        }
    }
}

#[derive(Deserialize)]
struct SubmitResponse {
    id: String,
}

/// Remote side of the job protocol: submit, poll on a fixed interval until a
/// terminal state, then re-fetch the finished eval. Nothing is retried.
#[derive(Clone)]
pub struct JobClient {
    http: reqwest::Client,
    base_url: String,
    interval: Duration,
}

impl JobClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            interval: Duration::from_millis(JOB_POLL_INTERVAL_MS),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    async fn checked(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::NOT_FOUND {
            Err(StoreError::NotFound(body))
        } else {
            Err(StoreError::Transport(format!("{}: {}", status, body)))
        }
    }

    pub async fn submit(&self, request: &RunRequest) -> Result<String> {
        let resp = self
            .http
            .post(format!("{}/api/eval/job", self.base_url))
            .json(request)
            .send()
            .await?;
        let submitted: SubmitResponse = Self::checked(resp).await?.json().await?;
        info!("Submitted job {}", submitted.id);
        Ok(submitted.id)
    }

    pub async fn poll_once(&self, job_id: &str) -> Result<JobProgress> {
        let resp = self
            .http
            .get(format!("{}/api/eval/job/{}/", self.base_url, job_id))
            .send()
            .await?;
        Ok(Self::checked(resp).await?.json().await?)
    }

    /// Polls until the job finishes and returns its eval id. `on_progress`
    /// sees the percentage after every non-terminal poll.
    pub async fn wait_for_completion(
        &self,
        job_id: &str,
        mut on_progress: impl FnMut(u64),
    ) -> Result<String> {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            let progress = self.poll_once(job_id).await?;
            match interpret_poll(&progress) {
                PollOutcome::Pending { percent } => {
                    debug!("Job {} at {}%", job_id, percent);
                    on_progress(percent);
                }
                PollOutcome::Complete { eval_id: Some(id) } => return Ok(id),
                PollOutcome::Complete { eval_id: None } => {
                    return Err(StoreError::JobFailed(format!(
                        "Job {} completed without an eval id",
                        job_id
                    )))
                }
                PollOutcome::Failed { message } => return Err(StoreError::JobFailed(message)),
            }
        }
    }

    pub async fn fetch_eval(&self, eval_id: &str) -> Result<ResultsFile> {
        let resp = self
            .http
            .get(format!("{}/api/eval/{}", self.base_url, eval_id))
            .send()
            .await?;
        Ok(Self::checked(resp).await?.json().await?)
    }

    /// Submit, wait, and fetch the finished eval.
    pub async fn run(&self, request: &RunRequest) -> Result<ResultsFile> {
        let job_id = self.submit(request).await?;
        let eval_id = self.wait_for_completion(&job_id, |_| {}).await?;
        self.fetch_eval(&eval_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(status: JobStatus, progress: u64, total: u64, logs: &[&str]) -> JobProgress {
        JobProgress {
            status,
            progress,
            total,
            logs: logs.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_running_with_zero_total_is_zero_percent() {
        assert_eq!(
            interpret_poll(&progress(JobStatus::Running, 0, 0, &[])),
            PollOutcome::Pending { percent: 0 }
        );
        assert_eq!(
            interpret_poll(&progress(JobStatus::Running, 1, 4, &[])),
            PollOutcome::Pending { percent: 25 }
        );
    }

    #[test]
    fn test_queued_job_is_pending_at_zero() {
        assert_eq!(
            interpret_poll(&progress(JobStatus::Queued, 0, 6, &[])),
            PollOutcome::Pending { percent: 0 }
        );
        assert_eq!(
            interpret_poll(&JobProgress::default()),
            PollOutcome::Pending { percent: 0 }
        );
    }

    #[test]
    fn test_failed_message_joins_logs() {
        assert_eq!(
            interpret_poll(&progress(JobStatus::Failed, 0, 0, &["x", "y"])),
            PollOutcome::Failed {
                message: "x\ny".to_string()
            }
        );
        assert_eq!(
            interpret_poll(&progress(JobStatus::Error, 0, 0, &[])),
            PollOutcome::Failed {
                message: "Job failed".to_string()
            }
        );
    }

    #[test]
    fn test_complete_carries_eval_id() {
        let mut p = progress(JobStatus::Complete, 2, 2, &[]);
        p.eval_id = Some("eval-1".to_string());
        assert_eq!(
            interpret_poll(&p),
            PollOutcome::Complete {
                eval_id: Some("eval-1".to_string())
            }
        );
    }
}
