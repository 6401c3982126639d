//! Alert audit trail - appends every dispatched AlertEvent as one JSON line
//!
//! Producers never block: events go through a bounded channel with
//! `try_send` and a full channel drops the event (counted in metrics).
//! A single writer task owns the file and keeps it open between events.
//! On shutdown the writer stops accepting new events and drains whatever
//! is already queued before it returns.

use crate::domain::types::AlertEvent;
use crate::infra::metrics::Metrics;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// JSONL file writer for alert events
pub struct AuditLog {
    file_path: PathBuf,
    /// Opened on first write, reopened after a write error
    file: Option<File>,
}

impl AuditLog {
    pub fn new(file_path: &str) -> Self {
        info!(file_path = %file_path, "audit_log_initialized");
        Self { file_path: PathBuf::from(file_path), file: None }
    }

    /// Append one event; returns true if it reached the file
    pub async fn write_event(&mut self, event: &AlertEvent) -> bool {
        let mut line = match serde_json::to_vec(event) {
            Ok(line) => line,
            Err(e) => {
                error!(alert_id = %event.alert_id, error = %e, "audit_serialize_failed");
                return false;
            }
        };
        line.push(b'\n');

        match self.append(&line).await {
            Ok(()) => {
                debug!(alert_id = %event.alert_id, kind = %event.kind.as_str(), "audit_written");
                true
            }
            Err(e) => {
                self.file = None;
                error!(alert_id = %event.alert_id, error = %e, "audit_write_failed");
                false
            }
        }
    }

    async fn append(&mut self, line: &[u8]) -> std::io::Result<()> {
        let file = match self.file.take() {
            Some(file) => file,
            None => self.open().await?,
        };
        let file = self.file.insert(file);
        file.write_all(line).await?;
        file.flush().await
    }

    async fn open(&self) -> std::io::Result<File> {
        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        OpenOptions::new().create(true).append(true).open(&self.file_path).await
    }
}

/// Cloneable, non-blocking handle for producers
#[derive(Clone)]
pub struct AuditSender {
    tx: mpsc::Sender<AlertEvent>,
    metrics: Arc<Metrics>,
}

impl AuditSender {
    pub fn record(&self, event: &AlertEvent) {
        match self.tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                self.metrics.record_audit_dropped();
                warn!(alert_id = %dropped.alert_id, "audit_dropped: channel full");
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.record_audit_dropped();
            }
        }
    }
}

/// Create the audit channel pair
pub fn create_audit_channel(
    buffer_size: usize,
    metrics: Arc<Metrics>,
) -> (AuditSender, mpsc::Receiver<AlertEvent>) {
    let (tx, rx) = mpsc::channel(buffer_size.max(1));
    (AuditSender { tx, metrics }, rx)
}

/// Drain the channel into the audit file
///
/// Returns once every sender is gone, or after shutdown once the events
/// queued before it have been written.
pub async fn run_audit_writer(
    mut log: AuditLog,
    mut rx: mpsc::Receiver<AlertEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut written = 0u64;
    let mut closing = false;
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => {
                    if log.write_event(&event).await {
                        written += 1;
                    }
                }
                None => break,
            },
            changed = shutdown.changed(), if !closing => {
                if changed.is_err() || *shutdown.borrow() {
                    // recv keeps yielding what is already buffered, then None
                    rx.close();
                    closing = true;
                }
            }
        }
    }
    info!(written = %written, "audit_writer_stopped");
}
