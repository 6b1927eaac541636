use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::SharedState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub started_at: String,
    pub uptime_secs: i64,
    pub jobs: usize,
    pub database: DatabaseHealth,
    pub policy: PolicyInfo,
}

#[derive(Serialize)]
pub struct DatabaseHealth {
    pub path: Option<String>,
    pub latest_eval_id: Option<String>,
}

#[derive(Serialize)]
pub struct PolicyInfo {
    pub telemetry: bool,
    pub update_available: bool,
    pub strip_prompt_text: bool,
}

/// GET /health
pub async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let (status, latest_eval_id) = match state.db.latest_eval_id() {
        Ok(id) => ("ok", id),
        Err(e) => {
            tracing::warn!("Health check could not read the database: {}", e);
            ("degraded", None)
        }
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: state.policy.update_check.latest_version().to_string(),
        started_at: state.started_at.to_rfc3339(),
        uptime_secs: (chrono::Utc::now() - state.started_at).num_seconds(),
        jobs: state.jobs.len().await,
        database: DatabaseHealth {
            path: state.db.path().map(|p| p.display().to_string()),
            latest_eval_id,
        },
        policy: PolicyInfo {
            telemetry: state.policy.telemetry != crate::settings::Telemetry::Disabled,
            update_available: state.policy.update_check.update_available(),
            strip_prompt_text: state.policy.strip_prompt_text,
        },
    })
}
