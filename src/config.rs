use clap::Parser;
use std::path::PathBuf;

/// Eval store: persists evaluation runs and serves the job-progress API.
#[derive(Parser, Debug, Clone)]
#[command(name = "eval-store")]
pub struct CliArgs {
    /// Directory holding the SQLite database and settings.json
    #[arg(short = 'd', long = "data-dir")]
    pub data_dir: Option<PathBuf>,

    /// HTTP port
    #[arg(short = 'p', long = "port", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Bind address
    #[arg(long = "host", default_value = "127.0.0.1")]
    pub host: String,

    /// Write daily-rolling log files into this directory
    #[arg(short = 'l', long = "log-dir")]
    pub log_dir: Option<PathBuf>,

    /// Default page size for eval listings
    #[arg(long = "query-limit", default_value_t = DEFAULT_QUERY_LIMIT)]
    pub query_limit: usize,
}

pub struct StoreConfig {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub settings_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub log_dir: Option<PathBuf>,
    pub query_limit: usize,
}

// Server constants
pub const DEFAULT_PORT: u16 = 15500;

// Store constants
pub const DATABASE_FILE_NAME: &str = "eval-store.db";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DEFAULT_QUERY_LIMIT: usize = 100;
pub const DEFAULT_BATCH_SIZE: usize = 100;

// Job constants
pub const JOB_POLL_INTERVAL_MS: u64 = 1000;
pub const JOB_LOG_LIMIT: usize = 200;
pub const JOB_RETENTION_SECS: u64 = 3600;

// Log constants
pub const LOG_BUFFER_SIZE: usize = 500;

impl StoreConfig {
    pub fn from_args(args: CliArgs) -> Self {
        let data_dir = args.data_dir.unwrap_or_else(default_data_dir);
        Self::with_data_dir(data_dir, args.host, args.port, args.log_dir, args.query_limit)
    }

    pub fn with_data_dir(
        data_dir: PathBuf,
        host: String,
        port: u16,
        log_dir: Option<PathBuf>,
        query_limit: usize,
    ) -> Self {
        StoreConfig {
            db_path: data_dir.join(DATABASE_FILE_NAME),
            settings_path: data_dir.join(SETTINGS_FILE_NAME),
            data_dir,
            host,
            port,
            log_dir,
            query_limit,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("eval-store")
}
