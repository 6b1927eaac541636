use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::stream::{self, Stream};
use serde::Serialize;
use std::convert::Infallible;

use crate::error::{ensure, Result, StoreError};
use crate::jobs::engine::{self, RunRequest};
use crate::jobs::JobProgress;
use crate::log_capture::{LogLevel, LogSource};
use crate::state::SharedState;

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

fn unknown_job(id: &str) -> StoreError {
    StoreError::NotFound(format!("job {}", id))
}

/// POST /api/eval/job: start a run and return its handle immediately.
pub async fn submit_job(
    State(state): State<SharedState>,
    Json(request): Json<RunRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>)> {
    ensure(!request.prompts.is_empty(), "a run needs at least one prompt")?;

    let handle = state.jobs.create().await;
    let id = handle.id.clone();
    state
        .logs
        .emit(LogSource::Job, LogLevel::Info, format!("Job {} submitted", id))
        .await;

    let ctx = state.job_context();
    tokio::spawn(async move {
        engine::run_job(ctx, handle, request).await;
    });

    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { id })))
}

/// GET /api/eval/job/{id}
pub async fn job_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<JobProgress>> {
    state.jobs.get(&id).await.map(Json).ok_or_else(|| unknown_job(&id))
}

/// GET /api/eval/job/{id}/events: SSE of status changes. The stream sends
/// the current state first and closes after the terminal one.
pub async fn job_events(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let rx = state.jobs.subscribe(&id).await.ok_or_else(|| unknown_job(&id))?;

    let events = stream::unfold((rx, true, false), |(mut rx, first, done)| async move {
        if done {
            return None;
        }
        if !first && rx.changed().await.is_err() {
            return None;
        }
        let progress = rx.borrow_and_update().clone();
        let terminal = progress.status.is_terminal();
        let event = Event::default()
            .event("progress")
            .json_data(&progress)
            .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()));
        Some((Ok(event), (rx, false, terminal)))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// POST /api/eval/job/{id}/cancel
pub async fn cancel_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>> {
    let cancelled = state.jobs.cancel(&id).await.ok_or_else(|| unknown_job(&id))?;
    if cancelled {
        state
            .logs
            .emit(LogSource::Job, LogLevel::Warn, format!("Job {} cancelled", id))
            .await;
    }
    Ok(Json(CancelResponse { cancelled }))
}
