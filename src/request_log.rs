use crate::error::RelayError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// One structured record per proxied request, handed to the sink after the
/// response has been written. The dispatcher keeps no copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLogRecord {
    pub timestamp: DateTime<Utc>,
    pub source_ip: String,
    pub method: String,
    pub target_host: String,
    pub target_port: u16,
    pub path: String,
    pub status_code: u16,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Storage collaborator for request records. Implementations must tolerate
/// concurrent callers; recording is best-effort and a failure here never
/// changes a response already sent.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn record(&self, entry: RequestLogRecord) -> Result<(), RelayError>;
}

/// Bounded in-memory sink retaining the most recent records, newest first on
/// read. Backs the logs API.
pub struct MemoryLogSink {
    capacity: usize,
    entries: Mutex<VecDeque<RequestLogRecord>>,
}

impl MemoryLogSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Most recent records, newest first, skipping `offset` and returning at
    /// most `limit`.
    pub fn recent(&self, limit: usize, offset: usize) -> Vec<RequestLogRecord> {
        let entries = self.entries.lock().expect("log sink poisoned");
        entries
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("log sink poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().expect("log sink poisoned").clear();
    }
}

#[async_trait]
impl LogSink for MemoryLogSink {
    async fn record(&self, entry: RequestLogRecord) -> Result<(), RelayError> {
        let mut entries = self.entries.lock().expect("log sink poisoned");
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
        Ok(())
    }
}

/// Appends one JSON line per record to a file. Stands in for the original
/// system's database-backed store.
pub struct JsonlLogSink {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl JsonlLogSink {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RelayError> {
        let path = path.into();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl LogSink for JsonlLogSink {
    async fn record(&self, entry: RequestLogRecord) -> Result<(), RelayError> {
        let line = serde_json::to_string(&entry)
            .map_err(|e| RelayError::Config(format!("Failed to serialize log record: {}", e)))?;
        let mut file = self.file.lock().expect("log file poisoned");
        writeln!(file, "{}", line)?;
        Ok(())
    }
}

/// Fans a record out to every underlying sink; the first failure is returned
/// but all sinks are attempted.
pub struct FanoutLogSink {
    sinks: Vec<std::sync::Arc<dyn LogSink>>,
}

impl FanoutLogSink {
    pub fn new(sinks: Vec<std::sync::Arc<dyn LogSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl LogSink for FanoutLogSink {
    async fn record(&self, entry: RequestLogRecord) -> Result<(), RelayError> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.record(entry.clone()).await {
                log::warn!("Log sink write failed: {}", e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
