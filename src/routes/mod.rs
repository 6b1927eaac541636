pub mod evals;
pub mod health;
pub mod jobs;
pub mod logs;
