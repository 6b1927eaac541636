use eval_store::config::StoreConfig;
use eval_store::error::StoreError;
use eval_store::evaluation::db::EvalDb;
use eval_store::evaluation::{EvaluateSummary, Prompt, UnifiedConfig};
use eval_store::jobs::client::JobClient;
use eval_store::jobs::engine::RunRequest;
use eval_store::server::build_router;
use eval_store::settings::RuntimePolicy;
use eval_store::state::AppState;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Serves the store on an ephemeral port and returns its base URL.
async fn spawn_server(dir: &TempDir) -> String {
    let config = StoreConfig::with_data_dir(
        dir.path().to_path_buf(),
        "127.0.0.1".to_string(),
        0,
        None,
        50,
    );
    let db = EvalDb::new(&config.db_path).unwrap();
    let state = Arc::new(AppState::new(config, db, RuntimePolicy::default()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });
    format!("http://{}", addr)
}

fn request(prompts: Vec<Prompt>, providers: Vec<&str>) -> RunRequest {
    RunRequest {
        config: UnifiedConfig {
            tests: Some(json!([{"vars": {"x": "1"}}, {"vars": {"x": "2"}}])),
            ..Default::default()
        },
        prompts,
        providers: providers.into_iter().map(str::to_string).collect(),
        author: Some("client-test".to_string()),
    }
}

#[tokio::test]
async fn test_client_runs_job_and_refetches_eval() {
    let dir = TempDir::new().unwrap();
    let base = spawn_server(&dir).await;
    let client = JobClient::new(base).with_interval(Duration::from_millis(20));

    let file = client
        .run(&request(vec![Prompt::new("value {{x}}", "v")], vec![]))
        .await
        .unwrap();
    assert_eq!(file.version, 4);
    assert_eq!(file.author.as_deref(), Some("client-test"));
    match file.results {
        EvaluateSummary::V3(summary) => {
            assert_eq!(summary.results.len(), 2);
            assert_eq!(summary.stats.successes, 2);
        }
        other => panic!("expected v3 summary, got {:?}", other),
    }
}

#[tokio::test]
async fn test_client_reports_progress_until_done() {
    let dir = TempDir::new().unwrap();
    let base = spawn_server(&dir).await;
    let client = JobClient::new(base).with_interval(Duration::from_millis(5));

    let job_id = client
        .submit(&request(vec![Prompt::new("a", "a"), Prompt::new("b", "b")], vec!["echo"]))
        .await
        .unwrap();
    let mut seen = Vec::new();
    let eval_id = client
        .wait_for_completion(&job_id, |percent| seen.push(percent))
        .await
        .unwrap();
    assert!(eval_id.starts_with("eval-"));
    assert!(seen.iter().all(|p| *p <= 100));
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));

    let progress = client.poll_once(&job_id).await.unwrap();
    assert_eq!(progress.eval_id.as_deref(), Some(eval_id.as_str()));
}

#[tokio::test]
async fn test_client_surfaces_transport_and_missing_jobs() {
    let dir = TempDir::new().unwrap();
    let base = spawn_server(&dir).await;
    let client = JobClient::new(base);
    let err = client.poll_once("no-such-job").await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));

    // Nothing listens on port 9 locally.
    let offline = JobClient::new("http://127.0.0.1:9").with_interval(Duration::from_millis(5));
    let err = offline.wait_for_completion("any", |_| {}).await.unwrap_err();
    assert!(matches!(err, StoreError::Transport(_)));
}
