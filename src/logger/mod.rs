// Exchange logger - one record per logical request/response exchange
//
// The proxy core hands every completed exchange here exactly once: forwarded
// calls (regular and streaming), reassembled tunnel exchanges, and synthesized
// error responses. The two documented exclusions are requests that never
// parse (malformed beyond framing) and tunnels whose payload never resolves
// into a complete HTTP message.
//
// Records land in two places:
// - an in-memory ring buffer (bounded, writer-exclusive / reader-shared)
// - a JSON Lines file per session, written by a background task
//
// JSONL keeps the on-disk log greppable and jq-able:
//   jq '.usage.total_tokens' logs/gatespy-20250828-101500-a7b3.jsonl

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

use crate::usage::UsageRecord;

/// Maximum number of records kept in the in-memory ring
const MAX_RING_ENTRIES: usize = 1000;

/// One logical exchange as seen by the proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeRecord {
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub request_headers: Vec<(String, String)>,
    /// Possibly truncated; None when the request had no body
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    /// None when no response was produced (e.g. failed tunnel dial)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub response_headers: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageRecord>,
}

/// Handle shared by every connection task
#[derive(Clone)]
pub struct Logger {
    ring: Arc<RwLock<VecDeque<ExchangeRecord>>>,
    sink: Option<mpsc::Sender<ExchangeRecord>>,
}

impl Logger {
    /// Logger with a JSONL sink channel; pair with [`ExchangeWriter`]
    pub fn new(sink: mpsc::Sender<ExchangeRecord>) -> Self {
        Self {
            ring: Arc::new(RwLock::new(VecDeque::with_capacity(MAX_RING_ENTRIES))),
            sink: Some(sink),
        }
    }

    /// In-memory only; used when file storage is disabled and in tests
    pub fn in_memory() -> Self {
        Self {
            ring: Arc::new(RwLock::new(VecDeque::with_capacity(MAX_RING_ENTRIES))),
            sink: None,
        }
    }

    /// Hand off one exchange. Appends to the ring (trimming the oldest when
    /// full) and forwards to the storage task without blocking the proxy.
    pub fn record(&self, record: ExchangeRecord) {
        {
            let mut ring = self.ring.write().unwrap();
            if ring.len() >= MAX_RING_ENTRIES {
                ring.pop_front();
            }
            ring.push_back(record.clone());
        }

        if let Some(sink) = &self.sink {
            // try_send: a slow disk must never stall a relay loop
            if sink.try_send(record).is_err() {
                tracing::warn!("exchange log channel full, dropping record from file log");
            }
        }
    }

    /// Snapshot of the most recent records, oldest first
    pub fn recent(&self, limit: usize) -> Vec<ExchangeRecord> {
        let ring = self.ring.read().unwrap();
        ring.iter().rev().take(limit).rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.read().unwrap().is_empty()
    }
}

/// Replace credential-bearing header values with a short SHA-256 fingerprint.
/// The fingerprint still lets a log reader correlate requests by key without
/// the log ever containing a usable secret.
pub fn sanitize_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let lower = name.to_lowercase();
            if lower == "authorization" || lower == "x-api-key" || lower == "proxy-authorization" {
                (name.clone(), format!("sha256:{}", fingerprint(value)))
            } else {
                (name.clone(), value.clone())
            }
        })
        .collect()
}

/// First 16 hex chars of SHA-256, enough to correlate, useless to replay
pub fn fingerprint(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    let hash = hasher.finalize();
    format!("{:x}", hash)[..16].to_string()
}

/// Background task draining exchange records to a per-session JSONL file
pub struct ExchangeWriter {
    log_dir: PathBuf,
    session_id: String,
    rx: mpsc::Receiver<ExchangeRecord>,
}

impl ExchangeWriter {
    pub fn new(
        log_dir: PathBuf,
        session_id: String,
        rx: mpsc::Receiver<ExchangeRecord>,
    ) -> Result<Self> {
        fs::create_dir_all(&log_dir).context("Failed to create log directory")?;
        Ok(Self {
            log_dir,
            session_id,
            rx,
        })
    }

    fn log_file_path(&self) -> PathBuf {
        self.log_dir
            .join(format!("gatespy-{}.jsonl", self.session_id))
    }

    /// Run until the channel closes, appending one JSON object per line
    pub async fn run(mut self) -> Result<()> {
        tracing::info!("Exchange log: {:?}", self.log_file_path());

        while let Some(record) = self.rx.recv().await {
            if let Err(e) = self.write_record(&record) {
                tracing::error!("Failed to write exchange record: {:?}", e);
            }
        }

        tracing::info!("Exchange writer stopped (channel closed)");
        Ok(())
    }

    fn write_record(&self, record: &ExchangeRecord) -> Result<()> {
        let json = serde_json::to_string(record).context("Failed to serialize record")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_file_path())
            .context("Failed to open log file")?;
        writeln!(file, "{}", json).context("Failed to write to log file")?;
        Ok(())
    }
}
