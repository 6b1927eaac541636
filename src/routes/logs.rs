use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use serde::Deserialize;
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::state::SharedState;

#[derive(Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

/// GET /logs/history: most recent service log entries first.
pub async fn log_history(
    State(state): State<SharedState>,
    Query(query): Query<HistoryQuery>,
) -> Json<serde_json::Value> {
    let entries = state.logs.history().await;
    let total = entries.len();
    let entries: Vec<_> = entries.into_iter().rev().take(query.limit).collect();

    Json(serde_json::json!({
        "entries": entries,
        "total": total,
        "limit": query.limit,
    }))
}

/// GET /logs/stream: SSE of new log entries.
pub async fn log_stream(
    State(state): State<SharedState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.logs.subscribe();
    let stream = BroadcastStream::new(rx);

    let event_stream = stream.filter_map(|result| match result {
        Ok(entry) => {
            let data = serde_json::to_string(&entry).unwrap_or_default();
            Some(Ok(Event::default().event("log").data(data)))
        }
        Err(_) => None, // lagged
    });

    Sse::new(event_stream).keep_alive(KeepAlive::default())
}
