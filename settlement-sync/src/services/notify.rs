//! Failure alerting.
//!
//! Posting failures are summarized into an [`AlertPayload`] and handed to a
//! [`Notifier`]. The default sink writes structured log events and appends
//! the payload to a JSONL file so an operator can review failures after the
//! run without scraping logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use sync_core::error::SyncError;
use tracing::error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertPayload {
    pub timestamp: DateTime<Utc>,
    pub subject: String,
    pub settlement_id: String,
    pub stage: String,
    pub identifier: String,
    pub message: String,
    /// Files an operator should look at alongside the alert, e.g. the
    /// transaction log or a reconciliation report.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<PathBuf>,
}

impl AlertPayload {
    pub fn new(settlement_id: &str, stage: &str, identifier: &str, message: String) -> Self {
        Self {
            timestamp: Utc::now(),
            subject: format!("Settlement {} {} failed for {}", settlement_id, stage, identifier),
            settlement_id: settlement_id.to_string(),
            stage: stage.to_string(),
            identifier: identifier.to_string(),
            message,
            attachments: Vec::new(),
        }
    }

    pub fn with_attachment(mut self, path: impl Into<PathBuf>) -> Self {
        self.attachments.push(path.into());
        self
    }
}

pub trait Notifier: Send + Sync {
    fn alert(&self, payload: &AlertPayload);
}

/// Default sink: a structured log event plus an append to a JSONL file.
pub struct FileNotifier {
    path: PathBuf,
}

impl FileNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn append(&self, payload: &AlertPayload) -> Result<(), SyncError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let line = serde_json::to_string(payload)
            .map_err(|e| SyncError::Internal(anyhow::anyhow!("alert serialization: {}", e)))?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}

impl Notifier for FileNotifier {
    fn alert(&self, payload: &AlertPayload) {
        error!(
            subject = %payload.subject,
            settlement_id = %payload.settlement_id,
            stage = %payload.stage,
            identifier = %payload.identifier,
            message = %payload.message,
            "Posting failure"
        );
        // Alerting must never fail the run it is reporting on.
        if let Err(err) = self.append(payload) {
            error!(error = %err, "Could not persist alert");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn alerts_append_as_jsonl() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alerts.jsonl");
        let notifier = FileNotifier::new(&path);

        notifier.alert(&AlertPayload::new("111", "invoice", "AMZN1234567", "rejected".into()));
        notifier.alert(
            &AlertPayload::new("111", "payment", "AMZN1234567", "no invoice".into())
                .with_attachment("output/zoho_transactions.log"),
        );

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<AlertPayload> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].stage, "invoice");
        assert_eq!(lines[0].subject, "Settlement 111 invoice failed for AMZN1234567");
        assert!(lines[0].attachments.is_empty());
        assert_eq!(lines[1].identifier, "AMZN1234567");
        assert_eq!(
            lines[1].attachments,
            vec![PathBuf::from("output/zoho_transactions.log")]
        );
    }
}
