//! Append-only audit trail for every phase of the decision pipeline.
//!
//! Records are forwarded to an [`AuditSink`] (the external audit store's
//! seam).  Emission is best-effort: a sink failure is logged locally and
//! never fails or blocks the operation that triggered it.  No update or
//! delete is ever issued.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// AuditRecord
// ---------------------------------------------------------------------------

/// The decision-loop phase a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditPhase {
    Observe,
    Orient,
    Decide,
    Act,
    Outcome,
}

/// A single append-only audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// ISO 8601 timestamp of the record.
    pub timestamp: String,
    /// Event / incident / plan / action identifier the record is about.
    pub subject: String,
    pub phase: AuditPhase,
    /// Snapshot of whatever the phase produced.
    pub payload: serde_json::Value,
}

impl AuditRecord {
    pub fn new(phase: AuditPhase, subject: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            subject: subject.into(),
            phase,
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// AuditSink
// ---------------------------------------------------------------------------

/// Destination for audit records; implemented by the external audit store
/// adapter.  Append-only by contract.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: &AuditRecord) -> Result<()>;
}

/// Append-only audit log backed by a JSON-lines file.
///
/// Writes are serialized through a `tokio::sync::Mutex` so the log is safe
/// to share across async tasks.
pub struct JsonlAuditSink {
    path: PathBuf,
    writer: Mutex<tokio::fs::File>,
}

impl JsonlAuditSink {
    /// Open (or create) the audit log file at `path` in append mode.
    pub async fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("failed to create audit log directory: {}", parent.display())
            })?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open audit log: {}", path.display()))?;

        debug!(path = %path.display(), "audit log opened");
        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn append(&self, record: &AuditRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("failed to serialize audit record")?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .context("failed to append audit record")?;
        writer.flush().await.context("failed to flush audit log")?;
        Ok(())
    }
}

/// In-memory sink for tests and for embedding without a log file.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, record: &AuditRecord) -> Result<()> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AuditEmitter
// ---------------------------------------------------------------------------

/// Best-effort front door to the audit sink.
///
/// A failed append is logged and swallowed; the decision pipeline never
/// rolls back because auditing struggled.
pub struct AuditEmitter {
    sink: Arc<dyn AuditSink>,
}

impl AuditEmitter {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    pub async fn emit(&self, record: AuditRecord) {
        if let Err(e) = self.sink.append(&record).await {
            warn!(
                subject = %record.subject,
                phase = ?record.phase,
                error = %e,
                "audit sink append failed; record dropped"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
