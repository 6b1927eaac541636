use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::routes::{evals, health, jobs, logs};
use crate::state::SharedState;

pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health
        .route("/health", get(health::health))
        // Jobs
        .route("/api/eval/job", post(jobs::submit_job))
        .route("/api/eval/job/{id}", get(jobs::job_status))
        .route("/api/eval/job/{id}/", get(jobs::job_status))
        .route("/api/eval/job/{id}/events", get(jobs::job_events))
        .route("/api/eval/job/{id}/cancel", post(jobs::cancel_job))
        // Evals
        .route("/api/results", get(evals::list_summaries))
        .route("/api/evals", get(evals::list_evals))
        .route("/api/eval", post(evals::import_eval))
        .route("/api/eval/latest", get(evals::latest_eval))
        .route(
            "/api/eval/{id}",
            get(evals::get_eval)
                .patch(evals::patch_eval)
                .delete(evals::delete_eval),
        )
        .route("/api/eval/{id}/table", get(evals::get_table))
        .route("/api/eval/{id}/vars", get(evals::get_vars))
        .route("/api/eval/{id}/prompts", get(evals::get_prompts))
        .route("/api/eval/{id}/tags", get(evals::get_tags))
        .route(
            "/api/eval/{id}/results",
            get(evals::get_results).post(evals::append_results),
        )
        .route("/api/datasets/{id}/evals", get(evals::dataset_evals))
        // Logs
        .route("/logs/history", get(logs::log_history))
        .route("/logs/stream", get(logs::log_stream))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
