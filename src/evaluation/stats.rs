use tracing::warn;

use super::db::EvalDb;
use super::queries::{self, SummaryRow};
use super::record::ResultShape;
use super::{CompletedPrompt, Eval, EvalSummary, EvaluateStats, PromptMetrics};
use crate::error::{Result, StoreError};

/// Additive fold of prompt metrics. Prompts without metrics add nothing.
pub fn fold_prompt_stats(prompts: &[CompletedPrompt]) -> EvaluateStats {
    let mut stats = EvaluateStats::default();
    for metrics in prompts.iter().filter_map(|p| p.metrics.as_ref()) {
        stats.successes += metrics.test_pass_count;
        stats.failures += metrics.test_fail_count;
        stats.errors += metrics.test_error_count;
        stats.token_usage.add(&metrics.token_usage);
    }
    stats
}

impl Eval {
    pub fn get_stats(&self) -> EvaluateStats {
        fold_prompt_stats(self.get_prompts())
    }

    /// Recomputes every prompt's metrics from the stored results, batch by
    /// batch, and writes the new prompt list.
    pub fn rebuild_prompt_metrics(&mut self, db: &EvalDb) -> Result<()> {
        if let ResultShape::Legacy(_) = self.shape {
            return Err(StoreError::Precondition(format!(
                "eval {} keeps its metrics in the embedded table",
                self.id
            )));
        }
        let mut metrics = vec![PromptMetrics::default(); self.prompts.len()];
        let mut fold = |records: &[super::ResultRecord]| {
            for record in records {
                match metrics.get_mut(record.result.prompt_idx) {
                    Some(m) => m.record(&record.result),
                    None => warn!(
                        "Result {} points at prompt {} which eval {} does not have",
                        record.id, record.result.prompt_idx, self.id
                    ),
                }
            }
        };
        for batch in self.fetch_results_batched(db, None) {
            fold(batch?.as_slice());
        }

        let prompts = self
            .prompts
            .iter()
            .cloned()
            .zip(metrics)
            .map(|(mut p, m)| {
                p.metrics = Some(m);
                p
            })
            .collect();
        self.add_prompts(db, prompts)
    }
}

/// Derives a summary from prompt metrics. Every prompt must report the same
/// number of test runs.
pub fn summarize_eval(row: SummaryRow) -> Result<EvalSummary> {
    let run_counts: Vec<u64> = row
        .prompts
        .iter()
        .map(|p| p.metrics.as_ref().map(PromptMetrics::test_run_count).unwrap_or(0))
        .collect();
    if let Some(first) = run_counts.first() {
        if run_counts.iter().any(|c| c != first) {
            return Err(StoreError::InconsistentData(format!(
                "eval {}: prompts report different test counts {:?}",
                row.eval_id, run_counts
            )));
        }
    }

    let pass_count: u64 = row
        .prompts
        .iter()
        .filter_map(|p| p.metrics.as_ref())
        .map(|m| m.test_pass_count)
        .sum();
    let num_tests = run_counts.first().copied().unwrap_or(0);
    let runs = num_tests * row.prompts.len() as u64;
    let pass_rate = if runs > 0 {
        pass_count as f64 / runs as f64 * 100.0
    } else {
        0.0
    };
    let label = match row.description.as_deref() {
        Some(desc) if !desc.is_empty() => format!("{} ({})", desc, row.eval_id),
        _ => row.eval_id.clone(),
    };

    Ok(EvalSummary {
        eval_id: row.eval_id,
        created_at: row.created_at,
        description: row.description,
        num_tests,
        dataset_id: row.dataset_id,
        is_redteam: row.is_redteam,
        pass_rate,
        label,
    })
}

/// Summaries of every eval, or only those linked to `dataset_id`. A single
/// inconsistent eval fails the whole call.
pub fn get_eval_summaries(db: &EvalDb, dataset_id: Option<&str>) -> Result<Vec<EvalSummary>> {
    queries::summary_rows(db, dataset_id)?
        .into_iter()
        .map(summarize_eval)
        .collect()
}
