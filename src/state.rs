use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::{StoreConfig, JOB_RETENTION_SECS};
use crate::evaluation::db::EvalDb;
use crate::jobs::engine::JobContext;
use crate::jobs::runner::{EchoRunner, TestRunner};
use crate::jobs::JobRegistry;
use crate::log_capture::LogState;
use crate::settings::RuntimePolicy;

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub config: StoreConfig,
    pub db: Arc<EvalDb>,
    pub policy: RuntimePolicy,
    pub jobs: JobRegistry,
    pub logs: Arc<LogState>,
    pub runner: Arc<dyn TestRunner>,
    pub started_at: DateTime<Utc>,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    pub fn new(config: StoreConfig, db: EvalDb, policy: RuntimePolicy) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            db: Arc::new(db),
            policy,
            jobs: JobRegistry::new(),
            logs: Arc::new(LogState::new()),
            runner: Arc::new(EchoRunner),
            started_at: Utc::now(),
            shutdown_tx,
        }
    }

    /// Replaces the built-in echo runner.
    pub fn with_runner(mut self, runner: Arc<dyn TestRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn job_context(&self) -> JobContext {
        JobContext {
            db: self.db.clone(),
            runner: self.runner.clone(),
            logs: self.logs.clone(),
            policy: self.policy.clone(),
        }
    }
}

/// Periodically drops finished jobs past the retention window. Stops on shutdown.
pub fn spawn_job_pruner(state: SharedState) -> JoinHandle<()> {
    let mut shutdown_rx = state.shutdown_tx.subscribe();
    tokio::spawn(async move {
        let retention = Duration::from_secs(JOB_RETENTION_SECS);
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let pruned = state.jobs.prune_finished(retention).await;
                    if pruned > 0 {
                        debug!("Job pruner removed {} jobs", pruned);
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    })
}
