use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use tracing::{debug, info};

use super::db::{EvalDb, EvalRow, NewEvalBundle, PromptLink, TagLink};
use super::{
    ids, queries, table, CompletedPrompt, EvaluateResult, EvaluateSummary, EvaluateTable,
    LegacySummary, Prompt, ResultRecord, ResultsFile, SummaryV2, SummaryV3, UnifiedConfig,
};
use crate::error::{Result, StoreError};
use crate::settings::RuntimePolicy;

/// Version 3 and older keep the whole table and stats inside the eval row.
pub const LEGACY_VERSION: u32 = 3;
/// Version 4 keeps one row per result and derives tables on demand.
pub const NORMALIZED_VERSION: u32 = 4;

/// How an eval's results are stored. An eval is exactly one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultShape {
    Legacy(LegacySummary),
    /// `results` is the resident subset; `count` is every result ever added.
    Normalized {
        results: Vec<ResultRecord>,
        count: usize,
    },
}

impl Default for ResultShape {
    fn default() -> Self {
        ResultShape::Normalized {
            results: Vec::new(),
            count: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EvalOptions {
    pub id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub author: Option<String>,
    pub description: Option<String>,
    pub prompts: Vec<CompletedPrompt>,
    pub dataset_id: Option<String>,
    pub persisted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub author: Option<String>,
    pub results: Vec<EvaluateResult>,
}

#[derive(Debug, Clone)]
pub struct Eval {
    pub id: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: i64,
    pub author: Option<String>,
    pub description: Option<String>,
    pub config: UnifiedConfig,
    pub prompts: Vec<CompletedPrompt>,
    pub dataset_id: Option<String>,
    pub persisted: bool,
    pub(super) shape: ResultShape,
}

impl Eval {
    /// An eval that lives only in this process until `save` is called.
    pub fn new(config: UnifiedConfig, opts: EvalOptions) -> Self {
        let created_at = opts.created_at.unwrap_or_else(Utc::now);
        Self {
            id: opts.id.unwrap_or_else(|| ids::create_eval_id(created_at)),
            created_at: created_at.timestamp_millis(),
            author: opts.author,
            description: opts.description.or_else(|| config.description.clone()),
            config,
            prompts: opts.prompts,
            dataset_id: opts.dataset_id,
            persisted: opts.persisted,
            shape: ResultShape::default(),
        }
    }

    /// Creates and durably stores an eval with its prompt, dataset and tag
    /// links and any initial results, all in one transaction.
    pub fn create(
        db: &EvalDb,
        config: UnifiedConfig,
        rendered_prompts: &[Prompt],
        opts: CreateOptions,
    ) -> Result<Eval> {
        let prompts = rendered_prompts
            .iter()
            .map(|p| CompletedPrompt::from_prompt(p, p.provider.as_deref().unwrap_or_default()))
            .collect();
        let mut eval = Eval::new(
            config,
            EvalOptions {
                id: opts.id,
                created_at: opts.created_at,
                author: opts.author,
                prompts,
                ..Default::default()
            },
        );
        let records: Vec<ResultRecord> = opts
            .results
            .into_iter()
            .map(|r| ResultRecord::from_evaluate_result(&eval.id, r))
            .collect();

        let links = rendered_prompts
            .iter()
            .map(|p| PromptLink {
                id: ids::hash_prompt(p),
                label: p.display_label().to_string(),
            })
            .collect();
        eval.insert_new(db, links, &records)?;
        eval.shape = ResultShape::Normalized {
            results: Vec::new(),
            count: records.len(),
        };
        info!("Created eval {} ({} initial results)", eval.id, records.len());
        Ok(eval)
    }

    /// Writes a not-yet-persisted eval and all of its links in one transaction.
    fn insert_new(&mut self, db: &EvalDb, prompts: Vec<PromptLink>, results: &[ResultRecord]) -> Result<()> {
        let dataset_id = ids::dataset_id(&self.config);
        let tags = self
            .config
            .tags
            .iter()
            .flatten()
            .map(|(name, value)| TagLink {
                id: ids::tag_id(name, value),
                name: name.clone(),
                value: value.clone(),
            })
            .collect();
        let dataset_tests = serde_json::to_string(
            self.config
                .tests
                .as_ref()
                .unwrap_or(&serde_json::Value::Array(Vec::new())),
        )?;

        db.insert_eval_bundle(&NewEvalBundle {
            row: self.to_row()?,
            prompts,
            dataset_id: dataset_id.clone(),
            dataset_tests,
            tags,
            results,
        })?;
        self.dataset_id = Some(dataset_id);
        self.persisted = true;
        Ok(())
    }

    /// Loads an eval and its dataset link. A missing eval is `Ok(None)`.
    pub fn find_by_id(db: &EvalDb, id: &str) -> Result<Option<Eval>> {
        match db.get_eval_with_dataset(id)? {
            Some((row, dataset_id)) => Ok(Some(Eval::from_row(row, dataset_id)?)),
            None => Ok(None),
        }
    }

    pub fn latest(db: &EvalDb) -> Result<Option<Eval>> {
        match db.latest_eval_id()? {
            Some(id) => Eval::find_by_id(db, &id),
            None => Ok(None),
        }
    }

    /// Most recent evals first.
    pub fn get_many(db: &EvalDb, limit: usize) -> Result<Vec<Eval>> {
        db.list_evals(limit)?
            .into_iter()
            .map(|row| Eval::from_row(row, None))
            .collect()
    }

    fn from_row(row: EvalRow, dataset_id: Option<String>) -> Result<Eval> {
        let config: UnifiedConfig = serde_json::from_str(&row.config)?;
        let prompts: Vec<CompletedPrompt> = match row.prompts.as_deref() {
            Some(text) => serde_json::from_str::<Option<Vec<CompletedPrompt>>>(text)?.unwrap_or_default(),
            None => Vec::new(),
        };
        let blob: serde_json::Value = serde_json::from_str(&row.results)?;
        let shape = if LegacySummary::is_legacy_blob(&blob) {
            ResultShape::Legacy(serde_json::from_value(blob)?)
        } else {
            ResultShape::default()
        };

        Ok(Eval {
            id: row.id,
            created_at: row.created_at,
            author: row.author,
            description: row.description,
            config,
            prompts,
            dataset_id,
            persisted: true,
            shape,
        })
    }

    fn to_row(&self) -> Result<EvalRow> {
        let results = match &self.shape {
            ResultShape::Legacy(summary) => serde_json::to_string(summary)?,
            ResultShape::Normalized { .. } => "{}".to_string(),
        };
        Ok(EvalRow {
            id: self.id.clone(),
            created_at: self.created_at,
            updated_at: Some(Utc::now().timestamp_millis()),
            author: self.author.clone(),
            description: self.description.clone(),
            config: serde_json::to_string(&self.config)?,
            results,
            prompts: Some(serde_json::to_string(&self.prompts)?),
        })
    }

    // ========================================================================
    // Versioning
    // ========================================================================

    pub fn version(&self) -> u32 {
        match self.shape {
            ResultShape::Legacy(_) => LEGACY_VERSION,
            ResultShape::Normalized { .. } => NORMALIZED_VERSION,
        }
    }

    pub fn uses_legacy_results(&self) -> bool {
        self.version() < NORMALIZED_VERSION
    }

    pub fn legacy_summary(&self) -> Option<&LegacySummary> {
        match &self.shape {
            ResultShape::Legacy(summary) => Some(summary),
            ResultShape::Normalized { .. } => None,
        }
    }

    /// Replaces the embedded table. Only valid for legacy evals.
    pub fn set_table(&mut self, table: EvaluateTable) -> Result<()> {
        match &mut self.shape {
            ResultShape::Legacy(summary) => {
                summary.table = Some(table);
                Ok(())
            }
            ResultShape::Normalized { .. } => Err(StoreError::Precondition(format!(
                "eval {} is version {}; set_table needs version {} or older",
                self.id, NORMALIZED_VERSION, LEGACY_VERSION
            ))),
        }
    }

    /// Persists config, prompts, description and author. The embedded result
    /// blob is written for legacy evals only. A never-persisted eval is inserted
    /// with its links and any resident results, which are then released.
    pub fn save(&mut self, db: &EvalDb) -> Result<()> {
        if !self.persisted {
            let links = self
                .prompts
                .iter()
                .map(|p| PromptLink {
                    id: ids::hash_completed_prompt(p),
                    label: p.label.clone(),
                })
                .collect();
            let pending = match &mut self.shape {
                ResultShape::Normalized { results, .. } => std::mem::take(results),
                ResultShape::Legacy(_) => Vec::new(),
            };
            if let Err(e) = self.insert_new(db, links, &pending) {
                if let ResultShape::Normalized { results, .. } = &mut self.shape {
                    *results = pending;
                }
                return Err(e);
            }
            debug!("Saved new eval {} with {} results", self.id, pending.len());
            return Ok(());
        }

        let write_results = match &self.shape {
            ResultShape::Legacy(_) => true,
            ResultShape::Normalized { .. } => false,
        };
        if db.update_eval_row(&self.to_row()?, write_results)? {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("eval {}", self.id)))
        }
    }

    // ========================================================================
    // Version-aware reads
    // ========================================================================

    pub fn get_prompts(&self) -> &[CompletedPrompt] {
        match &self.shape {
            ResultShape::Legacy(summary) => summary
                .table
                .as_ref()
                .map(|t| t.head.prompts.as_slice())
                .unwrap_or_default(),
            ResultShape::Normalized { .. } => &self.prompts,
        }
    }

    pub fn get_vars(&self, db: &EvalDb) -> Result<Vec<String>> {
        match &self.shape {
            ResultShape::Legacy(summary) => Ok(summary
                .table
                .as_ref()
                .map(|t| t.head.vars.clone())
                .unwrap_or_default()),
            ResultShape::Normalized { results, .. } if !self.persisted => {
                Ok(table::distinct_vars(results))
            }
            ResultShape::Normalized { .. } => queries::vars_for_eval(db, &self.id),
        }
    }

    pub fn get_table(&mut self, db: &EvalDb) -> Result<EvaluateTable> {
        if let ResultShape::Legacy(summary) = &self.shape {
            return Ok(summary.table.clone().unwrap_or_default());
        }
        self.ensure_results_resident(db)?;
        Ok(table::results_to_table(&self.prompts, self.results()))
    }

    pub fn add_prompts(&mut self, db: &EvalDb, prompts: Vec<CompletedPrompt>) -> Result<()> {
        self.prompts = prompts;
        if self.persisted {
            let updated = db.update_eval_prompts(&self.id, &serde_json::to_string(&self.prompts)?)?;
            if !updated {
                return Err(StoreError::NotFound(format!("eval {}", self.id)));
            }
        }
        Ok(())
    }

    pub fn to_evaluate_summary(&mut self, db: &EvalDb, policy: &RuntimePolicy) -> Result<EvaluateSummary> {
        let timestamp = self.timestamp();
        if let ResultShape::Legacy(summary) = &self.shape {
            return Ok(EvaluateSummary::V2(SummaryV2 {
                version: 2,
                timestamp,
                results: summary.results.clone(),
                table: summary.table.clone(),
                stats: summary.stats.clone(),
            }));
        }

        self.ensure_results_resident(db)?;
        let stats = self.get_stats();
        let prompts = if policy.strip_prompt_text {
            self.prompts
                .iter()
                .cloned()
                .map(|mut p| {
                    p.raw = "[prompt stripped]".to_string();
                    p
                })
                .collect()
        } else {
            self.prompts.clone()
        };

        Ok(EvaluateSummary::V3(SummaryV3 {
            version: 3,
            timestamp,
            prompts,
            results: self.results().iter().map(ResultRecord::to_evaluate_result).collect(),
            stats,
        }))
    }

    pub fn to_results_file(&mut self, db: &EvalDb, policy: &RuntimePolicy) -> Result<ResultsFile> {
        let results = self.to_evaluate_summary(db, policy)?;
        Ok(ResultsFile {
            version: self.version(),
            created_at: self.timestamp(),
            results,
            config: self.config.clone(),
            author: self.author.clone(),
            prompts: self.get_prompts().to_vec(),
            dataset_id: self.dataset_id.clone(),
        })
    }

    /// Rebuilds an in-process eval from an export. The result keeps the
    /// export's storage generation.
    pub fn from_results_file(file: ResultsFile) -> Result<Eval> {
        let created_at = DateTime::parse_from_rfc3339(&file.created_at)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| {
                StoreError::Precondition(format!(
                    "results file createdAt {:?} is not an RFC 3339 timestamp: {}",
                    file.created_at, e
                ))
            })?;
        let mut eval = Eval::new(
            file.config,
            EvalOptions {
                created_at: Some(created_at),
                author: file.author,
                prompts: file.prompts,
                dataset_id: file.dataset_id,
                ..Default::default()
            },
        );
        eval.shape = match file.results {
            EvaluateSummary::V2(summary) => ResultShape::Legacy(LegacySummary {
                version: Some(summary.version),
                timestamp: Some(summary.timestamp),
                results: summary.results,
                table: summary.table,
                stats: summary.stats,
            }),
            EvaluateSummary::V3(summary) => {
                let results: Vec<ResultRecord> = summary
                    .results
                    .into_iter()
                    .map(|r| ResultRecord::from_evaluate_result(&eval.id, r))
                    .collect();
                ResultShape::Normalized {
                    count: results.len(),
                    results,
                }
            }
        };
        Ok(eval)
    }

    /// Stores an imported export as a new eval.
    pub fn import(db: &EvalDb, file: ResultsFile) -> Result<Eval> {
        let mut eval = Eval::from_results_file(file)?;
        eval.save(db)?;
        info!("Imported eval {} (version {})", eval.id, eval.version());
        Ok(eval)
    }

    /// Removes the eval, its results and all links atomically.
    pub fn delete(&self, db: &EvalDb) -> Result<bool> {
        let deleted = db.delete_eval(&self.id)?;
        if deleted {
            info!("Deleted eval {}", self.id);
        }
        Ok(deleted)
    }

    fn timestamp(&self) -> String {
        Utc.timestamp_millis_opt(self.created_at)
            .single()
            .unwrap_or_else(Utc::now)
            .to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}
