pub mod db;
pub mod ids;
pub mod queries;
pub mod record;
pub mod results;
pub mod stats;
pub mod table;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub use record::Eval;

// ============================================================================
// Token usage
// ============================================================================

/// Accepts absent, null or fractional counts and reads them as whole tokens.
fn count<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<f64>::deserialize(deserializer)?;
    Ok(value.filter(|v| v.is_finite() && *v > 0.0).unwrap_or(0.0) as u64)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompletionDetails {
    #[serde(deserialize_with = "count")]
    pub reasoning: u64,
    #[serde(deserialize_with = "count")]
    pub accepted_prediction: u64,
    #[serde(deserialize_with = "count")]
    pub rejected_prediction: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AssertionTokens {
    #[serde(deserialize_with = "count")]
    pub total: u64,
    #[serde(deserialize_with = "count")]
    pub prompt: u64,
    #[serde(deserialize_with = "count")]
    pub completion: u64,
    #[serde(deserialize_with = "count")]
    pub cached: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenUsage {
    #[serde(deserialize_with = "count")]
    pub prompt: u64,
    #[serde(deserialize_with = "count")]
    pub completion: u64,
    #[serde(deserialize_with = "count")]
    pub cached: u64,
    #[serde(deserialize_with = "count")]
    pub total: u64,
    #[serde(deserialize_with = "count")]
    pub num_requests: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_details: Option<CompletionDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assertions: Option<AssertionTokens>,
}

impl TokenUsage {
    /// Usage with both sub-breakdowns present and zeroed.
    pub fn zeroed() -> Self {
        Self {
            completion_details: Some(CompletionDetails::default()),
            assertions: Some(AssertionTokens::default()),
            ..Default::default()
        }
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt += other.prompt;
        self.completion += other.completion;
        self.cached += other.cached;
        self.total += other.total;
        self.num_requests += other.num_requests;

        if let Some(theirs) = &other.completion_details {
            let ours = self.completion_details.get_or_insert_with(Default::default);
            ours.reasoning += theirs.reasoning;
            ours.accepted_prediction += theirs.accepted_prediction;
            ours.rejected_prediction += theirs.rejected_prediction;
        }
        if let Some(theirs) = &other.assertions {
            let ours = self.assertions.get_or_insert_with(Default::default);
            ours.total += theirs.total;
            ours.prompt += theirs.prompt;
            ours.completion += theirs.completion;
            ours.cached += theirs.cached;
        }
    }
}

// ============================================================================
// Result records
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum FailureReason {
    #[default]
    None,
    Assert,
    Error,
}

impl From<FailureReason> for u8 {
    fn from(reason: FailureReason) -> u8 {
        match reason {
            FailureReason::None => 0,
            FailureReason::Assert => 1,
            FailureReason::Error => 2,
        }
    }
}

impl TryFrom<u8> for FailureReason {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, String> {
        match value {
            0 => Ok(FailureReason::None),
            1 => Ok(FailureReason::Assert),
            2 => Ok(FailureReason::Error),
            other => Err(format!("unknown failure reason {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
    Error,
}

/// One outcome for a (test case, prompt) pairing as produced by a provider run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResult {
    pub prompt_idx: usize,
    pub test_idx: usize,
    #[serde(default)]
    pub test_case: Value,
    #[serde(default)]
    pub prompt: Value,
    #[serde(default)]
    pub provider: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub failure_reason: FailureReason,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grading_result: Option<Value>,
    #[serde(default)]
    pub named_scores: BTreeMap<String, f64>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub token_usage: TokenUsage,
}

impl EvaluateResult {
    pub fn with_outcome(prompt_idx: usize, test_idx: usize, outcome: Outcome) -> Self {
        let (success, failure_reason, score) = match outcome {
            Outcome::Pass => (true, FailureReason::None, 1.0),
            Outcome::Fail => (false, FailureReason::Assert, 0.0),
            Outcome::Error => (false, FailureReason::Error, 0.0),
        };
        Self {
            prompt_idx,
            test_idx,
            test_case: Value::Null,
            prompt: Value::Null,
            provider: Value::Null,
            response: None,
            error: None,
            success,
            failure_reason,
            score,
            latency_ms: 0,
            cost: 0.0,
            grading_result: None,
            named_scores: BTreeMap::new(),
            metadata: Value::Null,
            token_usage: TokenUsage::default(),
        }
    }

    pub fn outcome(&self) -> Outcome {
        if self.success {
            Outcome::Pass
        } else if self.failure_reason == FailureReason::Error {
            Outcome::Error
        } else {
            Outcome::Fail
        }
    }

    /// Variables of the test case, or an empty map.
    pub fn vars(&self) -> Map<String, Value> {
        self.test_case
            .get("vars")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    }
}

/// A stored result row. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub id: String,
    pub eval_id: String,
    pub created_at: i64,
    #[serde(flatten)]
    pub result: EvaluateResult,
}

impl ResultRecord {
    pub fn from_evaluate_result(eval_id: &str, result: EvaluateResult) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            eval_id: eval_id.to_string(),
            created_at: chrono::Utc::now().timestamp_millis(),
            result,
        }
    }

    pub fn to_evaluate_result(&self) -> EvaluateResult {
        self.result.clone()
    }
}

/// Version-aware result set returned by `Eval::get_results`.
#[derive(Debug, Clone)]
pub enum EvalResults {
    Legacy(Vec<Value>),
    Normalized(Vec<ResultRecord>),
}

impl EvalResults {
    pub fn len(&self) -> usize {
        match self {
            EvalResults::Legacy(results) => results.len(),
            EvalResults::Normalized(results) => results.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Prompts
// ============================================================================

/// A prompt as rendered for a run, before any metrics exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub raw: String,
    #[serde(default)]
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl Prompt {
    pub fn new(raw: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            label: label.into(),
            display: None,
            id: None,
            provider: None,
        }
    }

    pub fn display_label(&self) -> &str {
        if !self.label.is_empty() {
            &self.label
        } else if let Some(display) = self.display.as_deref().filter(|d| !d.is_empty()) {
            display
        } else {
            &self.raw
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PromptMetrics {
    pub score: f64,
    #[serde(deserialize_with = "count")]
    pub test_pass_count: u64,
    #[serde(deserialize_with = "count")]
    pub test_fail_count: u64,
    #[serde(deserialize_with = "count")]
    pub test_error_count: u64,
    #[serde(deserialize_with = "count")]
    pub assert_pass_count: u64,
    #[serde(deserialize_with = "count")]
    pub assert_fail_count: u64,
    #[serde(deserialize_with = "count")]
    pub total_latency_ms: u64,
    pub token_usage: TokenUsage,
    pub named_scores: BTreeMap<String, f64>,
    pub cost: f64,
}

impl PromptMetrics {
    /// Folds one result into the running totals.
    pub fn record(&mut self, result: &EvaluateResult) {
        self.score += result.score;
        match result.outcome() {
            Outcome::Pass => self.test_pass_count += 1,
            Outcome::Fail => self.test_fail_count += 1,
            Outcome::Error => self.test_error_count += 1,
        }
        self.total_latency_ms += result.latency_ms;
        self.cost += result.cost;
        self.token_usage.add(&result.token_usage);
        if result.token_usage.num_requests == 0 {
            self.token_usage.num_requests += 1;
        }
        for (name, value) in &result.named_scores {
            *self.named_scores.entry(name.clone()).or_insert(0.0) += value;
        }

        let components = result
            .grading_result
            .as_ref()
            .and_then(|g| g.get("componentResults"))
            .and_then(Value::as_array);
        for component in components.into_iter().flatten() {
            if component.get("pass").and_then(Value::as_bool).unwrap_or(false) {
                self.assert_pass_count += 1;
            } else {
                self.assert_fail_count += 1;
            }
        }
    }

    pub fn test_run_count(&self) -> u64 {
        self.test_pass_count + self.test_fail_count + self.test_error_count
    }
}

/// A prompt plus its aggregate metrics across a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPrompt {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub raw: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<PromptMetrics>,
}

impl CompletedPrompt {
    pub fn from_prompt(prompt: &Prompt, provider: &str) -> Self {
        Self {
            id: Some(ids::hash_prompt(prompt)),
            raw: prompt.raw.clone(),
            label: prompt.display_label().to_string(),
            provider: provider.to_string(),
            metrics: Some(PromptMetrics::default()),
        }
    }
}

// ============================================================================
// Configuration snapshot
// ============================================================================

/// The configuration used to produce an eval. Treated as an opaque snapshot;
/// only the keys the store reads are typed, the rest round-trip verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnifiedConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharing: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redteam: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UnifiedConfig {
    /// Test cases as a list; a missing or non-array `tests` value yields none.
    pub fn test_cases(&self) -> Vec<Value> {
        match &self.tests {
            Some(Value::Array(tests)) => tests.clone(),
            _ => Vec::new(),
        }
    }

    pub fn is_redteam(&self) -> bool {
        self.redteam.as_ref().is_some_and(|v| !v.is_null())
    }
}

// ============================================================================
// Tabular view
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableCell {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub pass: bool,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub prompt_idx: usize,
    #[serde(default)]
    pub failure_reason: FailureReason,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub cost: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub outputs: Vec<TableCell>,
    #[serde(default)]
    pub test: Value,
    #[serde(default)]
    pub test_idx: usize,
    #[serde(default)]
    pub vars: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableHead {
    #[serde(default)]
    pub prompts: Vec<CompletedPrompt>,
    #[serde(default)]
    pub vars: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluateTable {
    pub head: TableHead,
    pub body: Vec<TableRow>,
}

// ============================================================================
// Summaries and exports
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EvaluateStats {
    #[serde(deserialize_with = "count")]
    pub successes: u64,
    #[serde(deserialize_with = "count")]
    pub failures: u64,
    #[serde(deserialize_with = "count")]
    pub errors: u64,
    pub token_usage: TokenUsage,
}

impl Default for EvaluateStats {
    fn default() -> Self {
        Self {
            successes: 0,
            failures: 0,
            errors: 0,
            token_usage: TokenUsage::zeroed(),
        }
    }
}

/// The whole-eval blob stored by versions 2 and 3.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LegacySummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub results: Vec<Value>,
    // Always serialized: its presence is what marks a blob as legacy.
    #[serde(default)]
    pub table: Option<EvaluateTable>,
    #[serde(default)]
    pub stats: EvaluateStats,
}

impl LegacySummary {
    /// Whether a stored result blob has the legacy shape.
    pub fn is_legacy_blob(blob: &Value) -> bool {
        blob.as_object().is_some_and(|o| o.contains_key("table"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryV2 {
    pub version: u32,
    pub timestamp: String,
    pub results: Vec<Value>,
    pub table: Option<EvaluateTable>,
    pub stats: EvaluateStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryV3 {
    pub version: u32,
    pub timestamp: String,
    pub prompts: Vec<CompletedPrompt>,
    pub results: Vec<EvaluateResult>,
    pub stats: EvaluateStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EvaluateSummary {
    V2(SummaryV2),
    V3(SummaryV3),
}

impl<'de> Deserialize<'de> for EvaluateSummary {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        if LegacySummary::is_legacy_blob(&value) {
            serde_json::from_value(value)
                .map(EvaluateSummary::V2)
                .map_err(D::Error::custom)
        } else {
            serde_json::from_value(value)
                .map(EvaluateSummary::V3)
                .map_err(D::Error::custom)
        }
    }
}

/// Full export of one eval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsFile {
    pub version: u32,
    pub created_at: String,
    pub results: EvaluateSummary,
    pub config: UnifiedConfig,
    pub author: Option<String>,
    pub prompts: Vec<CompletedPrompt>,
    pub dataset_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalSummary {
    pub eval_id: String,
    pub created_at: i64,
    pub description: Option<String>,
    pub num_tests: u64,
    pub dataset_id: Option<String>,
    pub is_redteam: bool,
    pub pass_rate: f64,
    pub label: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_from_flags() {
        assert_eq!(EvaluateResult::with_outcome(0, 0, Outcome::Pass).outcome(), Outcome::Pass);
        assert_eq!(EvaluateResult::with_outcome(0, 0, Outcome::Fail).outcome(), Outcome::Fail);
        assert_eq!(EvaluateResult::with_outcome(0, 0, Outcome::Error).outcome(), Outcome::Error);
    }

    #[test]
    fn test_token_usage_tolerates_missing_and_null() {
        let usage: TokenUsage =
            serde_json::from_value(json!({"prompt": 5, "completion": null})).unwrap();
        assert_eq!(usage.prompt, 5);
        assert_eq!(usage.completion, 0);
        assert!(usage.completion_details.is_none());
    }

    #[test]
    fn test_prompt_metrics_record() {
        let mut metrics = PromptMetrics::default();
        let mut pass = EvaluateResult::with_outcome(0, 0, Outcome::Pass);
        pass.token_usage.total = 10;
        pass.token_usage.completion_details = Some(CompletionDetails {
            reasoning: 3,
            ..Default::default()
        });
        pass.grading_result = Some(json!({"componentResults": [{"pass": true}, {"pass": false}]}));
        metrics.record(&pass);
        metrics.record(&EvaluateResult::with_outcome(0, 1, Outcome::Error));

        assert_eq!(metrics.test_pass_count, 1);
        assert_eq!(metrics.test_error_count, 1);
        assert_eq!(metrics.test_run_count(), 2);
        assert_eq!(metrics.token_usage.total, 10);
        assert_eq!(metrics.token_usage.num_requests, 2);
        assert_eq!(metrics.token_usage.completion_details.unwrap().reasoning, 3);
        assert_eq!(metrics.assert_pass_count, 1);
        assert_eq!(metrics.assert_fail_count, 1);
    }

    #[test]
    fn test_failure_reason_serializes_as_integer() {
        assert_eq!(serde_json::to_value(FailureReason::Error).unwrap(), json!(2));
        let parsed: FailureReason = serde_json::from_value(json!(1)).unwrap();
        assert_eq!(parsed, FailureReason::Assert);
    }

    #[test]
    fn test_config_preserves_unknown_keys() {
        let config: UnifiedConfig = serde_json::from_value(json!({
            "description": "smoke",
            "providers": ["echo"],
            "redteam": null,
        }))
        .unwrap();
        assert!(!config.is_redteam());
        assert_eq!(config.extra["providers"], json!(["echo"]));
        let back = serde_json::to_value(&config).unwrap();
        assert_eq!(back["providers"], json!(["echo"]));
    }

    #[test]
    fn test_summary_shape_follows_table_presence() {
        let legacy: EvaluateSummary = serde_json::from_value(json!({
            "version": 2,
            "timestamp": "2024-01-01T00:00:00Z",
            "results": [],
            "table": {"head": {"prompts": [], "vars": []}, "body": []},
            "stats": {"successes": 1},
        }))
        .unwrap();
        assert!(matches!(legacy, EvaluateSummary::V2(_)));

        let current: EvaluateSummary = serde_json::from_value(json!({
            "version": 3,
            "timestamp": "2024-01-01T00:00:00Z",
            "prompts": [],
            "results": [],
            "stats": {},
        }))
        .unwrap();
        assert!(matches!(current, EvaluateSummary::V3(_)));
    }
}
