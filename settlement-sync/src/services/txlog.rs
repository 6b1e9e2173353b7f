//! Append-only transaction log.
//!
//! One line per remote call attempt, appended after the outcome is known
//! and never rewritten. This is the forensic record remediation relies on
//! to reconstruct what was actually created.

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use sync_core::error::SyncError;
use tracing::warn;

const HEADER: &str = "timestamp|method|type|endpoint|reference|amount|status|http_code|transaction_id";

/// One remote call attempt.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub record_type: String,
    pub endpoint: String,
    pub reference: String,
    pub amount: Option<String>,
    pub success: bool,
    pub http_code: u16,
    pub remote_id: Option<String>,
}

impl LogEntry {
    fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.timestamp.to_rfc3339(),
            self.method,
            self.record_type,
            self.endpoint,
            self.reference,
            self.amount.as_deref().unwrap_or("N/A"),
            if self.success { "SUCCESS" } else { "FAILED" },
            self.http_code,
            self.remote_id.as_deref().unwrap_or("N/A"),
        )
    }

    fn parse(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() < 9 {
            return None;
        }
        Some(Self {
            timestamp: DateTime::parse_from_rfc3339(parts[0]).ok()?.with_timezone(&Utc),
            method: parts[1].to_string(),
            record_type: parts[2].to_string(),
            endpoint: parts[3].to_string(),
            reference: parts[4].to_string(),
            amount: (parts[5] != "N/A").then(|| parts[5].to_string()),
            success: parts[6] == "SUCCESS",
            http_code: parts[7].parse().ok()?,
            remote_id: (parts[8] != "N/A").then(|| parts[8].to_string()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct TransactionLog {
    path: PathBuf,
}

impl TransactionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry. The file gets its header on first write and is
    /// otherwise only ever opened in append mode.
    pub fn append(&self, entry: &LogEntry) -> Result<(), SyncError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let is_new = !self.path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        if is_new {
            writeln!(file, "{}", HEADER)?;
        }
        writeln!(file, "{}", entry.to_line())?;
        Ok(())
    }

    /// Read the log back as structured entries, oldest first. Unparseable
    /// lines are skipped with a warning rather than failing the read.
    pub fn read_all(&self) -> Result<Vec<LogEntry>, SyncError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        let mut entries = Vec::new();
        for line in content.lines().skip(1) {
            if line.trim().is_empty() {
                continue;
            }
            match LogEntry::parse(line) {
                Some(entry) => entries.push(entry),
                None => warn!(line, "skipping malformed transaction log line"),
            }
        }
        Ok(entries)
    }

    /// Remote ids successfully created for a given reference and type.
    pub fn created_ids(&self, record_type: &str, reference: &str) -> Result<Vec<String>, SyncError> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|e| {
                e.success
                    && e.method == "POST"
                    && e.record_type == record_type
                    && e.reference == reference
            })
            .filter_map(|e| e.remote_id)
            .collect())
    }

    pub fn ensure_writable(&self) -> Result<(), SyncError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| SyncError::Store(anyhow!("cannot create log dir: {}", e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(method: &str, record_type: &str, reference: &str, success: bool) -> LogEntry {
        LogEntry {
            timestamp: Utc::now(),
            method: method.to_string(),
            record_type: record_type.to_string(),
            endpoint: "journals".to_string(),
            reference: reference.to_string(),
            amount: Some("$100.00".to_string()),
            success,
            http_code: if success { 200 } else { 429 },
            remote_id: success.then(|| "900000123".to_string()),
        }
    }

    #[test]
    fn append_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let log = TransactionLog::new(dir.path().join("tx.log"));

        log.append(&entry("POST", "JOURNAL", "12345678901", true)).unwrap();
        log.append(&entry("POST", "JOURNAL", "12345678901", false)).unwrap();

        let entries = log.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].success);
        assert_eq!(entries[0].remote_id.as_deref(), Some("900000123"));
        assert!(!entries[1].success);
        assert_eq!(entries[1].http_code, 429);
    }

    #[test]
    fn header_written_once() {
        let dir = tempdir().unwrap();
        let log = TransactionLog::new(dir.path().join("tx.log"));
        log.append(&entry("POST", "INVOICE", "1", true)).unwrap();
        log.append(&entry("POST", "INVOICE", "1", true)).unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(content.matches("timestamp|").count(), 1);
        assert_eq!(content.lines().count(), 3);
    }

    #[test]
    fn created_ids_filters_failures_and_other_references() {
        let dir = tempdir().unwrap();
        let log = TransactionLog::new(dir.path().join("tx.log"));
        log.append(&entry("POST", "INVOICE", "111", true)).unwrap();
        log.append(&entry("POST", "INVOICE", "111", false)).unwrap();
        log.append(&entry("POST", "INVOICE", "222", true)).unwrap();
        log.append(&entry("DELETE", "INVOICE", "111", true)).unwrap();

        let ids = log.created_ids("INVOICE", "111").unwrap();
        assert_eq!(ids, vec!["900000123".to_string()]);
    }
}
