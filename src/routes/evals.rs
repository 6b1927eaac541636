use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Result, StoreError};
use crate::evaluation::{
    queries, stats, CompletedPrompt, Eval, EvalSummary, EvaluateResult, EvaluateTable,
    ResultRecord, ResultsFile,
};
use crate::log_capture::{LogLevel, LogSource};
use crate::state::SharedState;

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    #[serde(rename = "datasetId")]
    pub dataset_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SummariesResponse {
    pub data: Vec<EvalSummary>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalListing {
    pub id: String,
    pub created_at: i64,
    pub description: Option<String>,
    pub author: Option<String>,
    pub version: u32,
    pub results_count: usize,
}

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    #[serde(rename = "testIdx")]
    pub test_idx: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct EvalPatch {
    pub description: Option<String>,
    pub author: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IdResponse {
    pub id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendResponse {
    pub added: usize,
    pub results_count: usize,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub deleted: bool,
}

fn load(state: &SharedState, id: &str) -> Result<Eval> {
    Eval::find_by_id(&state.db, id)?.ok_or_else(|| StoreError::NotFound(format!("eval {}", id)))
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/results?datasetId=
pub async fn list_summaries(
    State(state): State<SharedState>,
    Query(query): Query<SummaryQuery>,
) -> Result<Json<SummariesResponse>> {
    let data = stats::get_eval_summaries(&state.db, query.dataset_id.as_deref())?;
    Ok(Json(SummariesResponse { data }))
}

/// GET /api/evals?limit=
pub async fn list_evals(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<EvalListing>>> {
    let limit = query.limit.unwrap_or(state.config.query_limit);
    let mut listings = Vec::new();
    for mut eval in Eval::get_many(&state.db, limit)? {
        let results_count = if eval.uses_legacy_results() {
            eval.results_count()
        } else {
            eval.count_results(&state.db)?
        };
        listings.push(EvalListing {
            version: eval.version(),
            id: eval.id,
            created_at: eval.created_at,
            description: eval.description,
            author: eval.author,
            results_count,
        });
    }
    Ok(Json(listings))
}

/// GET /api/eval/latest
pub async fn latest_eval(State(state): State<SharedState>) -> Result<Json<ResultsFile>> {
    let mut eval = Eval::latest(&state.db)?.ok_or_else(|| StoreError::NotFound("no evals".to_string()))?;
    Ok(Json(eval.to_results_file(&state.db, &state.policy)?))
}

/// GET /api/eval/{id}
pub async fn get_eval(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<ResultsFile>> {
    let mut eval = load(&state, &id)?;
    Ok(Json(eval.to_results_file(&state.db, &state.policy)?))
}

/// GET /api/eval/{id}/table
pub async fn get_table(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<EvaluateTable>> {
    let mut eval = load(&state, &id)?;
    Ok(Json(eval.get_table(&state.db)?))
}

/// GET /api/eval/{id}/vars
pub async fn get_vars(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<String>>> {
    let eval = load(&state, &id)?;
    Ok(Json(eval.get_vars(&state.db)?))
}

/// GET /api/eval/{id}/prompts
pub async fn get_prompts(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<CompletedPrompt>>> {
    let eval = load(&state, &id)?;
    Ok(Json(eval.get_prompts().to_vec()))
}

/// GET /api/eval/{id}/tags
pub async fn get_tags(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<BTreeMap<String, String>>> {
    let eval = load(&state, &id)?;
    Ok(Json(queries::tags_for_eval(&state.db, &eval.id)?))
}

/// GET /api/eval/{id}/results?testIdx=
pub async fn get_results(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<ResultsQuery>,
) -> Result<Json<Vec<ResultRecord>>> {
    let mut eval = load(&state, &id)?;
    let records = match query.test_idx {
        Some(idx) => eval.fetch_results_by_test_idx(&state.db, idx)?,
        None => {
            eval.load_results(&state.db)?;
            eval.results().to_vec()
        }
    };
    Ok(Json(records))
}

/// GET /api/datasets/{id}/evals
pub async fn dataset_evals(
    State(state): State<SharedState>,
    Path(dataset_id): Path<String>,
) -> Result<Json<Vec<String>>> {
    Ok(Json(queries::evals_for_dataset(&state.db, &dataset_id)?))
}

/// POST /api/eval: import an exported results file as a new eval.
pub async fn import_eval(
    State(state): State<SharedState>,
    Json(file): Json<ResultsFile>,
) -> Result<(StatusCode, Json<IdResponse>)> {
    let eval = Eval::import(&state.db, file)?;
    state
        .logs
        .emit(
            LogSource::Store,
            LogLevel::Info,
            format!("Imported eval {} (version {})", eval.id, eval.version()),
        )
        .await;
    Ok((StatusCode::CREATED, Json(IdResponse { id: eval.id })))
}

/// POST /api/eval/{id}/results: append results and refresh prompt metrics.
pub async fn append_results(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(results): Json<Vec<EvaluateResult>>,
) -> Result<Json<AppendResponse>> {
    let mut eval = load(&state, &id)?;
    let prompt_count = eval.get_prompts().len();
    if let Some(bad) = results.iter().find(|r| r.prompt_idx >= prompt_count) {
        return Err(StoreError::Precondition(format!(
            "result for test {} points at prompt {}; eval {} has {} prompts",
            bad.test_idx, bad.prompt_idx, id, prompt_count
        )));
    }
    let added = eval.add_results(&state.db, results)?;
    eval.rebuild_prompt_metrics(&state.db)?;
    let results_count = eval.count_results(&state.db)?;
    Ok(Json(AppendResponse {
        added,
        results_count,
    }))
}

/// PATCH /api/eval/{id}
pub async fn patch_eval(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(patch): Json<EvalPatch>,
) -> Result<Json<IdResponse>> {
    let mut eval = load(&state, &id)?;
    if let Some(description) = patch.description {
        eval.description = Some(description);
    }
    if let Some(author) = patch.author {
        eval.author = Some(author);
    }
    eval.save(&state.db)?;
    Ok(Json(IdResponse { id: eval.id }))
}

/// DELETE /api/eval/{id}
pub async fn delete_eval(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>> {
    let eval = load(&state, &id)?;
    let deleted = eval.delete(&state.db)?;
    state
        .logs
        .emit(LogSource::Store, LogLevel::Info, format!("Deleted eval {}", id))
        .await;
    Ok(Json(DeleteResponse { deleted }))
}
