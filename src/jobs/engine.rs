use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::runner::{RunCase, TestRunner, ECHO_PROVIDER};
use super::{JobHandle, JobStatus};
use crate::evaluation::db::EvalDb;
use crate::evaluation::record::CreateOptions;
use crate::error::Result;
use crate::evaluation::{CompletedPrompt, Eval, Prompt, PromptMetrics, UnifiedConfig};
use crate::log_capture::{LogLevel, LogSource, LogState};
use crate::settings::RuntimePolicy;

/// Body of a run submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    #[serde(default)]
    pub config: UnifiedConfig,
    pub prompts: Vec<Prompt>,
    /// Provider ids; every prompt runs against each. Defaults to `echo`.
    #[serde(default)]
    pub providers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

impl RunRequest {
    /// One rendered prompt per (provider, prompt) pair, provider-major.
    pub fn expanded_prompts(&self) -> Vec<Prompt> {
        let providers: Vec<&str> = if self.providers.is_empty() {
            vec![ECHO_PROVIDER]
        } else {
            self.providers.iter().map(String::as_str).collect()
        };
        providers
            .iter()
            .flat_map(|provider| {
                self.prompts.iter().map(move |p| Prompt {
                    provider: Some(provider.to_string()),
                    ..p.clone()
                })
            })
            .collect()
    }
}

/// What a run needs from the service.
#[derive(Clone)]
pub struct JobContext {
    pub db: Arc<EvalDb>,
    pub runner: Arc<dyn TestRunner>,
    pub logs: Arc<LogState>,
    pub policy: RuntimePolicy,
}

/// Writes the metrics folded so far onto the eval's prompts, so stored
/// results and prompt metrics agree even when a run stops early.
fn write_prompt_metrics(ctx: &JobContext, eval: &mut Eval, metrics: Vec<PromptMetrics>) -> Result<()> {
    let completed: Vec<CompletedPrompt> = eval
        .prompts
        .iter()
        .cloned()
        .zip(metrics)
        .map(|(mut p, m)| {
            p.metrics = Some(m);
            p
        })
        .collect();
    eval.add_prompts(&ctx.db, completed)
}

/// Executes one run to a terminal state. Provider failures become
/// error-outcome results; store failures end the job in `error`.
pub async fn run_job(ctx: JobContext, handle: JobHandle, request: RunRequest) {
    if !handle.start() {
        info!("Job {} finished before it started; nothing to run", handle.id);
        return;
    }
    let prompts = request.expanded_prompts();
    let tests = request.config.test_cases();
    handle.set_total((tests.len() * prompts.len()) as u64);

    let author = request.author.clone().or_else(|| ctx.policy.default_author.clone());
    let mut eval = match Eval::create(
        &ctx.db,
        request.config.clone(),
        &prompts,
        CreateOptions {
            author,
            ..Default::default()
        },
    ) {
        Ok(eval) => eval,
        Err(e) => {
            error!("Job {} could not create its eval: {}", handle.id, e);
            handle.fail(JobStatus::Error, vec![format!("Failed to create eval: {}", e)]);
            return;
        }
    };

    ctx.logs
        .emit(
            LogSource::Job,
            LogLevel::Info,
            format!(
                "Job {} started eval {}: {} tests x {} prompts",
                handle.id,
                eval.id,
                tests.len(),
                prompts.len()
            ),
        )
        .await;

    let mut metrics = vec![PromptMetrics::default(); prompts.len()];
    for (test_idx, test_case) in tests.iter().enumerate() {
        for (prompt_idx, prompt) in prompts.iter().enumerate() {
            if handle.is_finished() {
                info!(
                    "Job {} stopped after {} results",
                    handle.id,
                    eval.results_count()
                );
                if let Err(err) = write_prompt_metrics(&ctx, &mut eval, metrics) {
                    warn!("Job {} could not write partial metrics for eval {}: {}", handle.id, eval.id, err);
                }
                ctx.logs
                    .emit(
                        LogSource::Job,
                        LogLevel::Warn,
                        format!("Job {} cancelled; eval {} is partial", handle.id, eval.id),
                    )
                    .await;
                return;
            }

            let case = RunCase {
                prompt: prompt.clone(),
                prompt_idx,
                provider: prompt.provider.clone().unwrap_or_else(|| ECHO_PROVIDER.to_string()),
                test_case: test_case.clone(),
                test_idx,
            };
            let result = match ctx.runner.run(&case).await {
                Ok(result) => result,
                Err(e) => {
                    warn!("Case {}/{} failed in job {}: {}", test_idx, prompt_idx, handle.id, e);
                    case.error_result(e.to_string())
                }
            };

            match eval.add_result(&ctx.db, result) {
                Ok(record) => metrics[prompt_idx].record(&record.result),
                Err(e) => {
                    error!("Job {} failed to store a result: {}", handle.id, e);
                    if let Err(err) = write_prompt_metrics(&ctx, &mut eval, metrics) {
                        warn!("Job {} could not write partial metrics for eval {}: {}", handle.id, eval.id, err);
                    }
                    handle.fail(JobStatus::Error, vec![format!("Failed to store result: {}", e)]);
                    return;
                }
            }
            handle.advance();
        }
    }

    if let Err(e) = write_prompt_metrics(&ctx, &mut eval, metrics) {
        error!("Job {} failed to finalize eval {}: {}", handle.id, eval.id, e);
        handle.fail(JobStatus::Error, vec![format!("Failed to finalize eval: {}", e)]);
        return;
    }

    let stats = eval.get_stats();
    if handle.complete(&eval.id) {
        ctx.policy.telemetry.record(
            "eval_job_complete",
            &serde_json::json!({
                "results": eval.results_count(),
                "prompts": eval.prompts.len(),
            }),
        );
        ctx.logs
            .emit(
                LogSource::Job,
                LogLevel::Info,
                format!(
                    "Job {} complete: eval {} ({} passed, {} failed, {} errors)",
                    handle.id, eval.id, stats.successes, stats.failures, stats.errors
                ),
            )
            .await;
    }
}
