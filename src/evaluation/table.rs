use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

use super::{CompletedPrompt, EvaluateTable, ResultRecord, TableCell, TableHead, TableRow};

/// Sorted distinct `test_case.vars` keys across `results`.
pub fn distinct_vars(results: &[ResultRecord]) -> Vec<String> {
    results
        .iter()
        .flat_map(|r| r.result.vars().into_iter().map(|(k, _)| k))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn cell_text(record: &ResultRecord) -> String {
    let r = &record.result;
    match r.response.as_ref().and_then(|resp| resp.get("output")) {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Null) | None => r.error.clone().unwrap_or_default(),
        Some(other) => other.to_string(),
    }
}

fn var_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Tabular view of a normalized eval: one row per test index in ascending
/// order, one cell per prompt. Results pointing past the prompt list are
/// left out of the grid.
pub fn results_to_table(prompts: &[CompletedPrompt], results: &[ResultRecord]) -> EvaluateTable {
    let vars = distinct_vars(results);
    let mut rows: BTreeMap<usize, TableRow> = BTreeMap::new();

    for record in results {
        let r = &record.result;
        if r.prompt_idx >= prompts.len() {
            warn!(
                "Skipping result {}: prompt {} of {}",
                record.id,
                r.prompt_idx,
                prompts.len()
            );
            continue;
        }
        let row = rows.entry(r.test_idx).or_insert_with(|| {
            let test_vars: Map<String, Value> = r.vars();
            TableRow {
                description: r
                    .test_case
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                outputs: Vec::new(),
                test: r.test_case.clone(),
                test_idx: r.test_idx,
                vars: vars.iter().map(|name| var_text(test_vars.get(name))).collect(),
            }
        });

        if row.outputs.len() < prompts.len() {
            row.outputs.resize_with(prompts.len(), TableCell::default);
        }
        row.outputs[r.prompt_idx] = TableCell {
            id: record.id.clone(),
            pass: r.success,
            score: r.score,
            text: cell_text(record),
            prompt_idx: r.prompt_idx,
            failure_reason: r.failure_reason,
            latency_ms: r.latency_ms,
            cost: r.cost,
            extra: Map::new(),
        };
    }

    EvaluateTable {
        head: TableHead {
            prompts: prompts.to_vec(),
            vars,
        },
        body: rows.into_values().collect(),
    }
}
