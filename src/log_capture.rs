use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::config::LOG_BUFFER_SIZE;

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub source: LogSource,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Store,
    Job,
    Server,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

/// Bounded in-memory service log with live fan-out to SSE subscribers.
pub struct LogState {
    buffer: Arc<RwLock<VecDeque<LogEntry>>>,
    sender: broadcast::Sender<LogEntry>,
    capacity: usize,
}

impl Default for LogState {
    fn default() -> Self {
        Self::new()
    }
}

impl LogState {
    pub fn new() -> Self {
        Self::with_capacity(LOG_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            buffer: Arc::new(RwLock::new(VecDeque::with_capacity(capacity))),
            sender,
            capacity,
        }
    }

    pub async fn push(&self, entry: LogEntry) {
        let mut buf = self.buffer.write().await;
        if buf.len() >= self.capacity {
            buf.pop_front();
        }
        buf.push_back(entry.clone());
        drop(buf);

        let _ = self.sender.send(entry);
    }

    pub async fn history(&self) -> Vec<LogEntry> {
        self.buffer.read().await.iter().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.sender.subscribe()
    }

    pub async fn emit(&self, source: LogSource, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            source,
            level,
            message: message.into(),
        };
        self.push(entry).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_buffer_drops_oldest_entries() {
        let logs = LogState::with_capacity(3);
        for i in 0..5 {
            logs.emit(LogSource::Store, LogLevel::Info, format!("entry {}", i))
                .await;
        }
        let history = logs.history().await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].message, "entry 2");
        assert_eq!(history[2].message, "entry 4");
    }

    #[tokio::test]
    async fn test_subscribers_receive_entries() {
        let logs = LogState::new();
        let mut rx = logs.subscribe();
        logs.emit(LogSource::Job, LogLevel::Error, "boom").await;
        let entry = rx.try_recv().unwrap();
        assert_eq!(entry.source, LogSource::Job);
        assert_eq!(entry.level, LogLevel::Error);
        assert_eq!(entry.message, "boom");
    }
}
