// Library crate; the binary and the integration tests build on it.

pub mod config;
pub mod error;
pub mod evaluation;
pub mod jobs;
pub mod log_capture;
pub mod routes;
pub mod server;
pub mod settings;
pub mod state;
