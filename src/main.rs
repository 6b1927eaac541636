use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use eval_store::config::{CliArgs, StoreConfig};
use eval_store::evaluation::db::EvalDb;
use eval_store::log_capture::{LogLevel, LogSource};
use eval_store::settings::{load_settings, RuntimePolicy};
use eval_store::state::{spawn_job_pruner, AppState};
use eval_store::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    // Held for the process lifetime so buffered file logs are flushed on exit.
    let _log_guard = init_tracing(&args);

    info!("Starting eval-store v{}", env!("CARGO_PKG_VERSION"));

    let config = StoreConfig::from_args(args);
    info!("Data dir: {:?}", config.data_dir);

    let settings = load_settings(&config.settings_path);
    let policy = RuntimePolicy::from_settings(&settings);
    let db = EvalDb::new(&config.db_path)
        .with_context(|| format!("opening database at {:?}", config.db_path))?;
    let bind_addr = config.bind_addr();

    let state = Arc::new(AppState::new(config, db, policy));
    state
        .logs
        .emit(
            LogSource::Server,
            LogLevel::Info,
            format!("eval-store starting on {}", bind_addr),
        )
        .await;

    let _pruner = spawn_job_pruner(state.clone());

    let router = server::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {}", bind_addr))?;
    info!("eval-store listening on http://{}", bind_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    info!("eval-store shutting down");
    Ok(())
}

fn init_tracing(args: &CliArgs) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "eval_store=info,tower_http=info".into());
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    match &args.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "eval-store.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false),
                )
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

async fn shutdown_signal(state: Arc<AppState>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
    let _ = state.shutdown_tx.send(());
    state
        .logs
        .emit(LogSource::Server, LogLevel::Info, "Shutdown signal received")
        .await;
}
