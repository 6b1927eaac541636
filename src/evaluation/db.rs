use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use super::{EvaluateResult, ResultRecord};
use crate::error::Result;

/// Raw `evals` row. JSON columns stay serialized here; `Eval` decodes them.
#[derive(Debug, Clone)]
pub struct EvalRow {
    pub id: String,
    pub created_at: i64,
    pub updated_at: Option<i64>,
    pub author: Option<String>,
    pub description: Option<String>,
    pub config: String,
    pub results: String,
    pub prompts: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PromptLink {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone)]
pub struct TagLink {
    pub id: String,
    pub name: String,
    pub value: String,
}

/// Everything written when an eval is created, applied in one transaction.
pub struct NewEvalBundle<'a> {
    pub row: EvalRow,
    pub prompts: Vec<PromptLink>,
    pub dataset_id: String,
    pub dataset_tests: String,
    pub tags: Vec<TagLink>,
    pub results: &'a [ResultRecord],
}

const RESULT_COLUMNS: &str = "id, eval_id, created_at, prompt_idx, test_idx, test_case, prompt, provider,
     response, error, failure_reason, success, score, latency_ms, cost, grading_result,
     named_scores, metadata, token_usage";

const EVAL_COLUMNS: &str =
    "id, created_at, updated_at, author, description, config, results, prompts";

pub struct EvalDb {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
}

impl EvalDb {
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
            db_path: Some(db_path.to_path_buf()),
        };
        db.init_schema()?;
        Ok(db)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
            db_path: None,
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS evals (
                id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                updated_at INTEGER,
                author TEXT,
                description TEXT,
                config TEXT NOT NULL,
                results TEXT NOT NULL DEFAULT '{}',
                prompts TEXT
            );

            CREATE TABLE IF NOT EXISTS prompts (
                id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                prompt TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS evals_to_prompts (
                eval_id TEXT NOT NULL REFERENCES evals(id),
                prompt_id TEXT NOT NULL REFERENCES prompts(id),
                PRIMARY KEY (eval_id, prompt_id)
            );

            CREATE TABLE IF NOT EXISTS datasets (
                id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                tests TEXT
            );

            CREATE TABLE IF NOT EXISTS evals_to_datasets (
                eval_id TEXT NOT NULL REFERENCES evals(id),
                dataset_id TEXT NOT NULL REFERENCES datasets(id),
                PRIMARY KEY (eval_id, dataset_id)
            );

            CREATE TABLE IF NOT EXISTS tags (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS evals_to_tags (
                eval_id TEXT NOT NULL REFERENCES evals(id),
                tag_id TEXT NOT NULL REFERENCES tags(id),
                PRIMARY KEY (eval_id, tag_id)
            );

            CREATE TABLE IF NOT EXISTS eval_results (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                eval_id TEXT NOT NULL REFERENCES evals(id),
                created_at INTEGER NOT NULL,
                prompt_idx INTEGER NOT NULL,
                test_idx INTEGER NOT NULL,
                test_case TEXT NOT NULL,
                prompt TEXT NOT NULL,
                provider TEXT NOT NULL,
                response TEXT,
                error TEXT,
                failure_reason INTEGER NOT NULL DEFAULT 0,
                success INTEGER NOT NULL,
                score REAL NOT NULL DEFAULT 0,
                latency_ms INTEGER NOT NULL DEFAULT 0,
                cost REAL NOT NULL DEFAULT 0,
                grading_result TEXT,
                named_scores TEXT NOT NULL DEFAULT '{}',
                metadata TEXT NOT NULL DEFAULT 'null',
                token_usage TEXT NOT NULL DEFAULT '{}'
            );

            CREATE INDEX IF NOT EXISTS idx_evals_created ON evals(created_at);
            CREATE INDEX IF NOT EXISTS idx_er_eval_id ON eval_results(eval_id);
            CREATE INDEX IF NOT EXISTS idx_er_eval_test ON eval_results(eval_id, test_idx);
            CREATE INDEX IF NOT EXISTS idx_etd_dataset ON evals_to_datasets(dataset_id);
        ",
        )?;
        Ok(())
    }

    /// On-disk location; `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave SQLite itself half-written.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ========================================================================
    // Eval rows
    // ========================================================================

    /// Inserts the eval row together with its prompt, dataset and tag links and
    /// any initial results. Nothing is written unless everything is.
    pub fn insert_eval_bundle(&self, bundle: &NewEvalBundle<'_>) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let row = &bundle.row;

        tx.execute(
            "INSERT INTO evals (id, created_at, updated_at, author, description, config, results, prompts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.id,
                row.created_at,
                row.updated_at,
                row.author,
                row.description,
                row.config,
                row.results,
                row.prompts,
            ],
        )?;

        for prompt in &bundle.prompts {
            tx.execute(
                "INSERT INTO prompts (id, created_at, prompt) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO NOTHING",
                params![prompt.id, row.created_at, prompt.label],
            )?;
            tx.execute(
                "INSERT INTO evals_to_prompts (eval_id, prompt_id) VALUES (?1, ?2)
                 ON CONFLICT DO NOTHING",
                params![row.id, prompt.id],
            )?;
            debug!("Linked prompt {} to {}", prompt.id, row.id);
        }

        tx.execute(
            "INSERT INTO datasets (id, created_at, tests) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO NOTHING",
            params![bundle.dataset_id, row.created_at, bundle.dataset_tests],
        )?;
        tx.execute(
            "INSERT INTO evals_to_datasets (eval_id, dataset_id) VALUES (?1, ?2)
             ON CONFLICT DO NOTHING",
            params![row.id, bundle.dataset_id],
        )?;

        for tag in &bundle.tags {
            tx.execute(
                "INSERT INTO tags (id, name, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO NOTHING",
                params![tag.id, tag.name, tag.value],
            )?;
            tx.execute(
                "INSERT INTO evals_to_tags (eval_id, tag_id) VALUES (?1, ?2)
                 ON CONFLICT DO NOTHING",
                params![row.id, tag.id],
            )?;
        }

        for record in bundle.results {
            insert_result_row(&tx, record)?;
        }

        tx.commit()?;
        debug!(
            "Created eval {} with {} prompts, {} tags, {} results",
            row.id,
            bundle.prompts.len(),
            bundle.tags.len(),
            bundle.results.len()
        );
        Ok(())
    }

    /// Eval row plus its dataset link, read in one transaction.
    pub fn get_eval_with_dataset(&self, id: &str) -> Result<Option<(EvalRow, Option<String>)>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let row = tx
            .query_row(
                &format!("SELECT {} FROM evals WHERE id=?1", EVAL_COLUMNS),
                params![id],
                eval_row,
            )
            .optional()?;
        let Some(row) = row else {
            return Ok(None);
        };
        let dataset_id: Option<String> = tx
            .query_row(
                "SELECT dataset_id FROM evals_to_datasets WHERE eval_id=?1 LIMIT 1",
                params![id],
                |r| r.get(0),
            )
            .optional()?;
        tx.commit()?;
        Ok(Some((row, dataset_id)))
    }

    pub fn latest_eval_id(&self) -> Result<Option<String>> {
        let conn = self.conn();
        let id = conn
            .query_row(
                "SELECT id FROM evals ORDER BY created_at DESC, rowid DESC LIMIT 1",
                [],
                |r| r.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn list_evals(&self, limit: usize) -> Result<Vec<EvalRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM evals ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            EVAL_COLUMNS
        ))?;
        let rows = stmt.query_map(params![limit as i64], eval_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Writes the mutable fields of an existing eval row. The `results` blob is
    /// only replaced when `write_results` is set. Returns false when the row is gone.
    pub fn update_eval_row(&self, row: &EvalRow, write_results: bool) -> Result<bool> {
        let conn = self.conn();
        let updated = if write_results {
            conn.execute(
                "UPDATE evals SET updated_at=?2, author=?3, description=?4, config=?5, prompts=?6, results=?7
                 WHERE id=?1",
                params![
                    row.id,
                    row.updated_at,
                    row.author,
                    row.description,
                    row.config,
                    row.prompts,
                    row.results,
                ],
            )?
        } else {
            conn.execute(
                "UPDATE evals SET updated_at=?2, author=?3, description=?4, config=?5, prompts=?6
                 WHERE id=?1",
                params![
                    row.id,
                    row.updated_at,
                    row.author,
                    row.description,
                    row.config,
                    row.prompts,
                ],
            )?
        };
        Ok(updated > 0)
    }

    pub fn update_eval_prompts(&self, id: &str, prompts_json: &str) -> Result<bool> {
        let conn = self.conn();
        let updated = conn.execute(
            "UPDATE evals SET prompts=?2, updated_at=?3 WHERE id=?1",
            params![id, prompts_json, chrono::Utc::now().timestamp_millis()],
        )?;
        Ok(updated > 0)
    }

    /// Removes the eval, its results and every link row in one transaction.
    /// Shared prompt, dataset and tag rows stay for other evals.
    pub fn delete_eval(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM evals_to_datasets WHERE eval_id=?1", params![id])?;
        tx.execute("DELETE FROM evals_to_prompts WHERE eval_id=?1", params![id])?;
        tx.execute("DELETE FROM evals_to_tags WHERE eval_id=?1", params![id])?;
        tx.execute("DELETE FROM eval_results WHERE eval_id=?1", params![id])?;
        let deleted = tx.execute("DELETE FROM evals WHERE id=?1", params![id])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    // ========================================================================
    // Result rows
    // ========================================================================

    pub fn insert_result(&self, record: &ResultRecord) -> Result<()> {
        let conn = self.conn();
        insert_result_row(&conn, record)
    }

    pub fn insert_results(&self, records: &[ResultRecord]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for record in records {
            insert_result_row(&tx, record)?;
        }
        tx.commit()?;
        Ok(records.len())
    }

    /// Swaps the stored result set of an eval for `records` in one transaction.
    pub fn replace_results(&self, eval_id: &str, records: &[ResultRecord]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM eval_results WHERE eval_id=?1", params![eval_id])?;
        for record in records {
            insert_result_row(&tx, record)?;
        }
        tx.commit()?;
        Ok(records.len())
    }

    /// All results of an eval, optionally restricted to one test index, in insertion order.
    pub fn results_for_eval(&self, eval_id: &str, test_idx: Option<usize>) -> Result<Vec<ResultRecord>> {
        let conn = self.conn();
        let records = match test_idx {
            Some(idx) => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {} FROM eval_results WHERE eval_id=?1 AND test_idx=?2 ORDER BY seq",
                    RESULT_COLUMNS
                ))?;
                let rows = stmt.query_map(params![eval_id, idx], result_record)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {} FROM eval_results WHERE eval_id=?1 ORDER BY seq",
                    RESULT_COLUMNS
                ))?;
                let rows = stmt.query_map(params![eval_id], result_record)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            }
        };
        Ok(records)
    }

    /// Up to `limit` results with a sequence number above `after_seq`, plus the
    /// last sequence number returned. Each call is an independent short read.
    pub fn results_page(
        &self,
        eval_id: &str,
        after_seq: i64,
        limit: usize,
    ) -> Result<(Vec<ResultRecord>, Option<i64>)> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT seq, {} FROM eval_results WHERE eval_id=?1 AND seq>?2 ORDER BY seq LIMIT ?3",
            RESULT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![eval_id, after_seq, limit as i64], |row| {
            let seq: i64 = row.get(0)?;
            Ok((seq, result_record_at(row, 1)?))
        })?;
        let mut last_seq = None;
        let mut records = Vec::new();
        for row in rows {
            let (seq, record) = row?;
            last_seq = Some(seq);
            records.push(record);
        }
        Ok((records, last_seq))
    }

    pub fn count_results(&self, eval_id: &str) -> Result<usize> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM eval_results WHERE eval_id=?1",
            params![eval_id],
            |r| r.get(0),
        )?;
        Ok(count as usize)
    }

    /// Rows in any table that still reference `eval_id`.
    pub fn count_references(&self, eval_id: &str) -> Result<usize> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT
                (SELECT COUNT(*) FROM evals WHERE id=?1)
              + (SELECT COUNT(*) FROM eval_results WHERE eval_id=?1)
              + (SELECT COUNT(*) FROM evals_to_prompts WHERE eval_id=?1)
              + (SELECT COUNT(*) FROM evals_to_datasets WHERE eval_id=?1)
              + (SELECT COUNT(*) FROM evals_to_tags WHERE eval_id=?1)",
            params![eval_id],
            |r| r.get(0),
        )?;
        Ok(count as usize)
    }
}

// ============================================================================
// Row mapping
// ============================================================================

fn insert_result_row(conn: &Connection, record: &ResultRecord) -> Result<()> {
    let r = &record.result;
    let mut stmt = conn.prepare_cached(&format!(
        "INSERT INTO eval_results ({})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
        RESULT_COLUMNS
    ))?;
    stmt.execute(params![
        record.id,
        record.eval_id,
        record.created_at,
        r.prompt_idx,
        r.test_idx,
        serde_json::to_string(&r.test_case)?,
        serde_json::to_string(&r.prompt)?,
        serde_json::to_string(&r.provider)?,
        r.response.as_ref().map(serde_json::to_string).transpose()?,
        r.error,
        u8::from(r.failure_reason) as i64,
        r.success as i64,
        r.score,
        r.latency_ms as i64,
        r.cost,
        r.grading_result.as_ref().map(serde_json::to_string).transpose()?,
        serde_json::to_string(&r.named_scores)?,
        serde_json::to_string(&r.metadata)?,
        serde_json::to_string(&r.token_usage)?,
    ])?;
    Ok(())
}

fn eval_row(row: &Row<'_>) -> rusqlite::Result<EvalRow> {
    Ok(EvalRow {
        id: row.get(0)?,
        created_at: row.get(1)?,
        updated_at: row.get(2)?,
        author: row.get(3)?,
        description: row.get(4)?,
        config: row.get(5)?,
        results: row.get(6)?,
        prompts: row.get(7)?,
    })
}

fn json_at<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_json_at<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(None),
    }
}

fn result_record(row: &Row<'_>) -> rusqlite::Result<ResultRecord> {
    result_record_at(row, 0)
}

fn result_record_at(row: &Row<'_>, base: usize) -> rusqlite::Result<ResultRecord> {
    let failure_reason: i64 = row.get(base + 10)?;
    Ok(ResultRecord {
        id: row.get(base)?,
        eval_id: row.get(base + 1)?,
        created_at: row.get(base + 2)?,
        result: EvaluateResult {
            prompt_idx: row.get(base + 3)?,
            test_idx: row.get(base + 4)?,
            test_case: json_at(row, base + 5)?,
            prompt: json_at(row, base + 6)?,
            provider: json_at(row, base + 7)?,
            response: opt_json_at(row, base + 8)?,
            error: row.get(base + 9)?,
            failure_reason: (failure_reason as u8).try_into().unwrap_or_default(),
            success: row.get::<_, i64>(base + 11)? != 0,
            score: row.get(base + 12)?,
            latency_ms: row.get::<_, i64>(base + 13)? as u64,
            cost: row.get(base + 14)?,
            grading_result: opt_json_at(row, base + 15)?,
            named_scores: json_at(row, base + 16)?,
            metadata: json_at(row, base + 17)?,
            token_usage: json_at(row, base + 18)?,
        },
    })
}
