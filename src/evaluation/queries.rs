use rusqlite::params;
use std::collections::BTreeMap;

use super::db::EvalDb;
use super::CompletedPrompt;
use crate::error::Result;

/// The columns summaries are computed from, one per eval.
#[derive(Debug, Clone)]
pub struct SummaryRow {
    pub eval_id: String,
    pub created_at: i64,
    pub description: Option<String>,
    pub dataset_id: Option<String>,
    pub is_redteam: bool,
    /// From the embedded table for legacy evals, the prompts column otherwise.
    pub prompts: Vec<CompletedPrompt>,
}

/// Every eval (optionally only those linked to `dataset_id`), newest first.
pub fn summary_rows(db: &EvalDb, dataset_id: Option<&str>) -> Result<Vec<SummaryRow>> {
    let conn = db.conn();
    let mut stmt = conn.prepare(
        "SELECT e.id, e.created_at, e.description, etd.dataset_id,
                json_type(e.config, '$.redteam') IS NOT NULL
                    AND json_type(e.config, '$.redteam') != 'null',
                CASE WHEN json_type(e.results, '$.table') IS NOT NULL
                     THEN json_extract(e.results, '$.table.head.prompts')
                     ELSE e.prompts END
         FROM evals e
         LEFT JOIN evals_to_datasets etd ON etd.eval_id = e.id
         WHERE (?1 IS NULL OR etd.dataset_id = ?1)
         ORDER BY e.created_at DESC, e.rowid DESC",
    )?;
    let rows = stmt.query_map(params![dataset_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, bool>(4)?,
            row.get::<_, Option<String>>(5)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (eval_id, created_at, description, dataset_id, is_redteam, prompts) = row?;
        let prompts = match prompts.as_deref() {
            Some(text) => serde_json::from_str::<Option<Vec<CompletedPrompt>>>(text)?.unwrap_or_default(),
            None => Vec::new(),
        };
        out.push(SummaryRow {
            eval_id,
            created_at,
            description,
            dataset_id,
            is_redteam,
            prompts,
        });
    }
    Ok(out)
}

/// Distinct variable names across the eval's stored test cases, sorted.
pub fn vars_for_eval(db: &EvalDb, eval_id: &str) -> Result<Vec<String>> {
    let conn = db.conn();
    let mut stmt = conn.prepare_cached(
        "SELECT DISTINCT j.key
         FROM eval_results r, json_each(json_extract(r.test_case, '$.vars')) j
         WHERE r.eval_id = ?1 AND json_type(r.test_case, '$.vars') = 'object'
         ORDER BY j.key",
    )?;
    let rows = stmt.query_map(params![eval_id], |r| r.get(0))?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Into::into)
}

/// Variable names for several evals at once, keyed by eval id. Evals without
/// stored results are absent from the map.
pub fn vars_for_evals(db: &EvalDb, eval_ids: &[String]) -> Result<BTreeMap<String, Vec<String>>> {
    let conn = db.conn();
    let mut stmt = conn.prepare_cached(
        "SELECT DISTINCT r.eval_id, j.key
         FROM eval_results r, json_each(json_extract(r.test_case, '$.vars')) j
         WHERE r.eval_id = ?1 AND json_type(r.test_case, '$.vars') = 'object'
         ORDER BY j.key",
    )?;
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for eval_id in eval_ids {
        let rows = stmt.query_map(params![eval_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (id, key) = row?;
            out.entry(id).or_default().push(key);
        }
    }
    Ok(out)
}

/// Ids of the evals linked to a dataset, newest first.
pub fn evals_for_dataset(db: &EvalDb, dataset_id: &str) -> Result<Vec<String>> {
    let conn = db.conn();
    let mut stmt = conn.prepare(
        "SELECT e.id FROM evals e
         JOIN evals_to_datasets etd ON etd.eval_id = e.id
         WHERE etd.dataset_id = ?1
         ORDER BY e.created_at DESC, e.rowid DESC",
    )?;
    let rows = stmt.query_map(params![dataset_id], |r| r.get(0))?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Into::into)
}

pub fn tags_for_eval(db: &EvalDb, eval_id: &str) -> Result<BTreeMap<String, String>> {
    let conn = db.conn();
    let mut stmt = conn.prepare(
        "SELECT t.name, t.value FROM tags t
         JOIN evals_to_tags ett ON ett.tag_id = t.id
         WHERE ett.eval_id = ?1",
    )?;
    let rows = stmt.query_map(params![eval_id], |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
    })?;
    rows.collect::<std::result::Result<BTreeMap<_, _>, _>>()
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::record::CreateOptions;
    use crate::evaluation::{Eval, EvaluateResult, Outcome, UnifiedConfig};
    use serde_json::json;

    fn result_with_vars(test_idx: usize, vars: serde_json::Value) -> EvaluateResult {
        let mut r = EvaluateResult::with_outcome(0, test_idx, Outcome::Pass);
        r.test_case = json!({ "vars": vars });
        r
    }

    #[test]
    fn test_vars_are_distinct_and_sorted() {
        let db = EvalDb::in_memory().unwrap();
        let eval = Eval::create(
            &db,
            UnifiedConfig::default(),
            &[],
            CreateOptions {
                results: vec![
                    result_with_vars(0, json!({"topic": "a", "lang": "en"})),
                    result_with_vars(1, json!({"topic": "b"})),
                    result_with_vars(2, json!("not an object")),
                ],
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(vars_for_eval(&db, &eval.id).unwrap(), vec!["lang", "topic"]);

        let many = vars_for_evals(&db, &[eval.id.clone(), "missing".to_string()]).unwrap();
        assert_eq!(many.len(), 1);
        assert_eq!(many[&eval.id], vec!["lang", "topic"]);
    }

    #[test]
    fn test_tags_and_dataset_links() {
        let db = EvalDb::in_memory().unwrap();
        let config = UnifiedConfig {
            tags: Some(BTreeMap::from([("env".to_string(), "ci".to_string())])),
            tests: Some(json!([{"vars": {"x": 1}}])),
            ..Default::default()
        };
        let eval = Eval::create(&db, config, &[], CreateOptions::default()).unwrap();
        let tags = tags_for_eval(&db, &eval.id).unwrap();
        assert_eq!(tags.get("env").map(String::as_str), Some("ci"));

        let dataset = eval.dataset_id.clone().unwrap();
        assert_eq!(evals_for_dataset(&db, &dataset).unwrap(), vec![eval.id.clone()]);
        assert!(evals_for_dataset(&db, "other").unwrap().is_empty());
    }
}
