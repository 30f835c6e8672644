//! Persistence sinks — fire-and-forget storage of turns and tool outcomes.
//!
//! The orchestrator never waits on storage. A [`PersistenceQueue`] hands
//! records to a single writer task per sink, so they arrive in the order they
//! were queued, and failures end up in the log instead of the caller.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::PersistenceError;
use crate::turn::{ToolCallRecord, Turn};

/// A single item handed to a sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PersistedRecord {
    Turn {
        session_id: String,
        turn: Turn,
    },
    ToolCall {
        session_id: String,
        participant_id: String,
        record: ToolCallRecord,
    },
}

impl PersistedRecord {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Turn { session_id, .. } | Self::ToolCall { session_id, .. } => session_id,
        }
    }
}

/// Append-only storage for session records.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    fn name(&self) -> &str;

    async fn record(&self, record: PersistedRecord) -> Result<(), PersistenceError>;
}

enum QueueCommand {
    Record(PersistedRecord),
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget front of a sink.
///
/// Cloning shares the same writer task, so records queued from any clone
/// reach the sink in FIFO order.
#[derive(Clone)]
pub struct PersistenceQueue {
    name: Arc<str>,
    tx: Option<mpsc::UnboundedSender<QueueCommand>>,
}

impl std::fmt::Debug for PersistenceQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceQueue")
            .field("sink", &self.name)
            .field("running", &self.tx.is_some())
            .finish()
    }
}

impl PersistenceQueue {
    /// Start the writer task for `sink`. Outside a tokio runtime the queue
    /// drops every record.
    pub fn start(sink: Arc<dyn PersistenceSink>) -> Self {
        let name: Arc<str> = sink.name().into();
        let tx = match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let (tx, rx) = mpsc::unbounded_channel();
                handle.spawn(write_loop(sink, rx));
                Some(tx)
            }
            Err(_) => {
                warn!(sink = %name, "No async runtime; persistence disabled");
                None
            }
        };
        Self { name, tx }
    }

    /// A queue that discards everything without a writer task.
    pub fn disabled() -> Self {
        Self {
            name: "noop".into(),
            tx: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `record` without waiting.
    pub fn persist(&self, record: PersistedRecord) {
        let Some(tx) = &self.tx else { return };
        if tx.send(QueueCommand::Record(record)).is_err() {
            warn!(sink = %self.name, "Persistence writer stopped; dropping record");
        }
    }

    /// Wait until every record queued before this call has been handed to
    /// the sink.
    pub async fn flush(&self) {
        let Some(tx) = &self.tx else { return };
        let (done, wait) = oneshot::channel();
        if tx.send(QueueCommand::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

impl Default for PersistenceQueue {
    fn default() -> Self {
        Self::disabled()
    }
}

async fn write_loop(sink: Arc<dyn PersistenceSink>, mut rx: mpsc::UnboundedReceiver<QueueCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            QueueCommand::Record(record) => {
                if let Err(e) = sink.record(record).await {
                    warn!(sink = sink.name(), error = %e, "Failed to persist record");
                }
            }
            QueueCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!(sink = sink.name(), "Persistence writer finished");
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NoopSink;

#[async_trait]
impl PersistenceSink for NoopSink {
    fn name(&self) -> &str {
        "noop"
    }

    async fn record(&self, _record: PersistedRecord) -> Result<(), PersistenceError> {
        Ok(())
    }
}

/// Keeps records in memory. Handy for tests and short-lived sessions.
#[derive(Debug, Default)]
pub struct InMemorySink {
    records: Mutex<Vec<PersistedRecord>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<PersistedRecord> {
        self.records.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}

#[async_trait]
impl PersistenceSink for InMemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn record(&self, record: PersistedRecord) -> Result<(), PersistenceError> {
        self.records.lock().await.push(record);
        Ok(())
    }
}

/// Appends one JSON object per line to a transcript file.
pub struct JsonlSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record back from a transcript. Corrupted lines are skipped.
    pub async fn read_all(path: &Path) -> Result<Vec<PersistedRecord>, PersistenceError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PersistenceError::Storage(e.to_string())),
        };

        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, "Skipping corrupted transcript line");
                    None
                }
            })
            .collect())
    }
}

#[async_trait]
impl PersistenceSink for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn record(&self, record: PersistedRecord) -> Result<(), PersistenceError> {
        let mut line = serde_json::to_string(&record)
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| PersistenceError::Storage(e.to_string()))?;
            }
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| PersistenceError::Storage(e.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| PersistenceError::Storage(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| PersistenceError::Storage(e.to_string()))?;

        debug!(path = %self.path.display(), session_id = record.session_id(), "Record persisted");
        Ok(())
    }
}
