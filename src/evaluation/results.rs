use tracing::debug;

use super::db::EvalDb;
use super::record::ResultShape;
use super::{Eval, EvalResults, EvaluateResult, ResultRecord};
use crate::config::DEFAULT_BATCH_SIZE;
use crate::error::{Result, StoreError};

impl Eval {
    fn legacy_misuse(&self, op: &str) -> StoreError {
        StoreError::Precondition(format!(
            "{} needs a version 4 eval; {} is version {}",
            op,
            self.id,
            self.version()
        ))
    }

    /// Appends one result. Persisted evals write straight through to storage
    /// and keep nothing resident; unpersisted evals hold it until `save`.
    pub fn add_result(&mut self, db: &EvalDb, result: EvaluateResult) -> Result<ResultRecord> {
        let record = ResultRecord::from_evaluate_result(&self.id, result);
        let persisted = self.persisted;
        match &mut self.shape {
            ResultShape::Legacy(_) => Err(self.legacy_misuse("add_result")),
            ResultShape::Normalized { results, count } => {
                if persisted {
                    db.insert_result(&record)?;
                } else {
                    results.push(record.clone());
                }
                *count += 1;
                Ok(record)
            }
        }
    }

    /// Appends several results; persisted evals write them in one transaction.
    pub fn add_results(&mut self, db: &EvalDb, batch: Vec<EvaluateResult>) -> Result<usize> {
        let records: Vec<ResultRecord> = batch
            .into_iter()
            .map(|r| ResultRecord::from_evaluate_result(&self.id, r))
            .collect();
        let persisted = self.persisted;
        match &mut self.shape {
            ResultShape::Legacy(_) => Err(self.legacy_misuse("add_results")),
            ResultShape::Normalized { results, count } => {
                let added = records.len();
                if persisted {
                    db.insert_results(&records)?;
                } else {
                    results.extend(records);
                }
                *count += added;
                Ok(added)
            }
        }
    }

    /// Replaces the whole result set. For persisted evals the replacement is
    /// durable and atomic; the resident list stays empty.
    pub fn set_results(&mut self, db: &EvalDb, replacement: Vec<EvaluateResult>) -> Result<()> {
        let records: Vec<ResultRecord> = replacement
            .into_iter()
            .map(|r| ResultRecord::from_evaluate_result(&self.id, r))
            .collect();
        let persisted = self.persisted;
        let eval_id = self.id.clone();
        match &mut self.shape {
            ResultShape::Legacy(_) => Err(self.legacy_misuse("set_results")),
            ResultShape::Normalized { results, count } => {
                *count = records.len();
                if persisted {
                    db.replace_results(&eval_id, &records)?;
                    results.clear();
                } else {
                    *results = records;
                }
                Ok(())
            }
        }
    }

    /// Reads every stored result into the resident list and refreshes the count.
    pub fn load_results(&mut self, db: &EvalDb) -> Result<()> {
        if let ResultShape::Legacy(_) = self.shape {
            return Err(self.legacy_misuse("load_results"));
        }
        let loaded = db.results_for_eval(&self.id, None)?;
        debug!("Loaded {} results for eval {}", loaded.len(), self.id);
        if let ResultShape::Normalized { results, count } = &mut self.shape {
            *count = loaded.len();
            *results = loaded;
        }
        Ok(())
    }

    pub(super) fn ensure_results_resident(&mut self, db: &EvalDb) -> Result<()> {
        if self.persisted {
            self.load_results(db)?;
        }
        Ok(())
    }

    /// Streams results in batches of at most `batch_size` (default
    /// [`DEFAULT_BATCH_SIZE`]), in insertion order. Persisted evals page
    /// through storage; unpersisted evals chunk the resident list. Each call
    /// starts a fresh cursor.
    pub fn fetch_results_batched<'a>(&'a self, db: &'a EvalDb, batch_size: Option<usize>) -> ResultBatches<'a> {
        let source = if self.persisted {
            BatchSource::Stored {
                db,
                eval_id: self.id.clone(),
                after_seq: 0,
            }
        } else {
            BatchSource::Resident(self.results())
        };
        ResultBatches {
            source,
            batch_size: batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1),
            done: false,
        }
    }

    pub fn fetch_results_by_test_idx(&self, db: &EvalDb, test_idx: usize) -> Result<Vec<ResultRecord>> {
        match &self.shape {
            ResultShape::Legacy(_) => Err(self.legacy_misuse("fetch_results_by_test_idx")),
            ResultShape::Normalized { results, .. } if !self.persisted => Ok(results
                .iter()
                .filter(|r| r.result.test_idx == test_idx)
                .cloned()
                .collect()),
            ResultShape::Normalized { .. } => db.results_for_eval(&self.id, Some(test_idx)),
        }
    }

    /// Version-aware result access: the embedded list for legacy evals, every
    /// stored result otherwise.
    pub fn get_results(&mut self, db: &EvalDb) -> Result<EvalResults> {
        if let ResultShape::Legacy(summary) = &self.shape {
            return Ok(EvalResults::Legacy(summary.results.clone()));
        }
        self.ensure_results_resident(db)?;
        Ok(EvalResults::Normalized(self.results().to_vec()))
    }

    /// The resident results. Empty for persisted evals until loaded.
    pub fn results(&self) -> &[ResultRecord] {
        match &self.shape {
            ResultShape::Normalized { results, .. } => results,
            ResultShape::Legacy(_) => &[],
        }
    }

    /// Results added through this instance plus whatever it was created or loaded with.
    pub fn results_count(&self) -> usize {
        match &self.shape {
            ResultShape::Normalized { count, .. } => *count,
            ResultShape::Legacy(summary) => summary.results.len(),
        }
    }

    /// Counts stored results and refreshes the in-process counter.
    pub fn count_results(&mut self, db: &EvalDb) -> Result<usize> {
        let stored = db.count_results(&self.id)?;
        if let ResultShape::Normalized { count, .. } = &mut self.shape {
            *count = stored;
        }
        Ok(stored)
    }
}

/// Batched reader over an eval's results.
pub struct ResultBatches<'a> {
    source: BatchSource<'a>,
    batch_size: usize,
    done: bool,
}

enum BatchSource<'a> {
    /// Keyset pagination over stored rows.
    Stored {
        db: &'a EvalDb,
        eval_id: String,
        after_seq: i64,
    },
    Resident(&'a [ResultRecord]),
}

impl<'a> Iterator for ResultBatches<'a> {
    type Item = Result<Vec<ResultRecord>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let batch_size = self.batch_size;
        match &mut self.source {
            BatchSource::Resident(rest) => {
                let remaining: &'a [ResultRecord] = rest;
                if remaining.is_empty() {
                    self.done = true;
                    return None;
                }
                let (batch, tail) = remaining.split_at(batch_size.min(remaining.len()));
                *rest = tail;
                Some(Ok(batch.to_vec()))
            }
            BatchSource::Stored {
                db,
                eval_id,
                after_seq,
            } => match db.results_page(eval_id, *after_seq, batch_size) {
                Ok((batch, Some(last_seq))) => {
                    *after_seq = last_seq;
                    if batch.len() < batch_size {
                        self.done = true;
                    }
                    Some(Ok(batch))
                }
                Ok((_, None)) => {
                    self.done = true;
                    None
                }
                Err(e) => {
                    self.done = true;
                    Some(Err(e))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::record::CreateOptions;
    use crate::evaluation::{Outcome, UnifiedConfig};

    fn persisted(db: &EvalDb) -> Eval {
        Eval::create(db, UnifiedConfig::default(), &[], CreateOptions::default()).unwrap()
    }

    #[test]
    fn test_persisted_add_result_stays_out_of_memory() {
        let db = EvalDb::in_memory().unwrap();
        let mut eval = persisted(&db);
        eval.add_result(&db, EvaluateResult::with_outcome(0, 0, Outcome::Pass)).unwrap();
        assert!(eval.results().is_empty());
        assert_eq!(eval.results_count(), 1);
        assert_eq!(eval.count_results(&db).unwrap(), 1);
    }

    #[test]
    fn test_set_results_on_persisted_eval_replaces_stored_rows() {
        let db = EvalDb::in_memory().unwrap();
        let mut eval = persisted(&db);
        for i in 0..3 {
            eval.add_result(&db, EvaluateResult::with_outcome(0, i, Outcome::Fail)).unwrap();
        }
        eval.set_results(&db, vec![EvaluateResult::with_outcome(0, 0, Outcome::Pass)])
            .unwrap();
        assert_eq!(eval.results_count(), 1);
        assert!(eval.results().is_empty());
        eval.load_results(&db).unwrap();
        assert_eq!(eval.results().len(), 1);
        assert!(eval.results()[0].result.success);
    }

    #[test]
    fn test_batches_cover_every_result_once() {
        let db = EvalDb::in_memory().unwrap();
        let mut eval = persisted(&db);
        let batch: Vec<_> = (0..7)
            .map(|i| EvaluateResult::with_outcome(0, i, Outcome::Pass))
            .collect();
        eval.add_results(&db, batch).unwrap();

        let sizes: Vec<usize> = eval
            .fetch_results_batched(&db, Some(3))
            .map(|b| b.unwrap().len())
            .collect();
        assert_eq!(sizes, vec![3, 3, 1]);

        let exact: Vec<usize> = eval
            .fetch_results_batched(&db, Some(7))
            .map(|b| b.unwrap().len())
            .collect();
        assert_eq!(exact, vec![7]);
    }

    #[test]
    fn test_batches_of_empty_eval_yield_nothing() {
        let db = EvalDb::in_memory().unwrap();
        let eval = persisted(&db);
        assert_eq!(eval.fetch_results_batched(&db, None).count(), 0);
    }

    #[test]
    fn test_batches_of_unpersisted_eval_cover_resident_results() {
        let db = EvalDb::in_memory().unwrap();
        let mut eval = Eval::new(UnifiedConfig::default(), Default::default());
        for i in 0..5 {
            eval.add_result(&db, EvaluateResult::with_outcome(0, i, Outcome::Pass)).unwrap();
        }
        let batches: Vec<Vec<ResultRecord>> = eval
            .fetch_results_batched(&db, Some(2))
            .map(|b| b.unwrap())
            .collect();
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        let test_idxs: Vec<usize> = batches.iter().flatten().map(|r| r.result.test_idx).collect();
        assert_eq!(test_idxs, vec![0, 1, 2, 3, 4]);
        assert_eq!(eval.results_count(), 5);
    }

    #[test]
    fn test_persisted_result_with_unstorable_index_is_rejected() {
        let db = EvalDb::in_memory().unwrap();
        let mut eval = persisted(&db);
        let err = eval
            .add_result(&db, EvaluateResult::with_outcome(usize::MAX, 0, Outcome::Pass))
            .unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));
        assert_eq!(eval.results_count(), 0);
        assert_eq!(eval.count_results(&db).unwrap(), 0);
    }

    #[test]
    fn test_fetch_by_test_idx_unpersisted() {
        let db = EvalDb::in_memory().unwrap();
        let mut eval = Eval::new(UnifiedConfig::default(), Default::default());
        eval.add_result(&db, EvaluateResult::with_outcome(0, 1, Outcome::Pass)).unwrap();
        eval.add_result(&db, EvaluateResult::with_outcome(1, 1, Outcome::Fail)).unwrap();
        eval.add_result(&db, EvaluateResult::with_outcome(0, 2, Outcome::Pass)).unwrap();
        assert_eq!(eval.fetch_results_by_test_idx(&db, 1).unwrap().len(), 2);
        assert_eq!(db.count_results(&eval.id).unwrap(), 0);
    }
}
