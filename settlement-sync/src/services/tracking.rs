//! Durable tracking store.
//!
//! The single source of truth for "has this been posted." Flat CSV, no
//! uniqueness constraint of its own, so `upsert` scans for the identifying
//! triple before appending. All mutations rewrite the whole file through a
//! temp file and atomic rename; a reader never observes a half-written
//! store.

use crate::models::{RecordType, SettlementHistoryEntry, TrackedRecord};
use anyhow::anyhow;
use chrono::{NaiveDate, Utc};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use sync_core::error::SyncError;
use tracing::{info, instrument};

pub struct TrackingStore {
    path: PathBuf,
    records: Vec<TrackedRecord>,
}

impl TrackingStore {
    /// Load the store from disk, or start empty if the file does not exist.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let path = path.into();
        let records = if path.exists() {
            let mut reader = csv::Reader::from_path(&path)
                .map_err(|e| SyncError::Store(anyhow!("cannot open tracking store: {}", e)))?;
            reader
                .deserialize()
                .collect::<Result<Vec<TrackedRecord>, _>>()
                .map_err(|e| SyncError::Store(anyhow!("corrupt tracking store: {}", e)))?
        } else {
            Vec::new()
        };
        Ok(Self { path, records })
    }

    pub fn lookup(
        &self,
        settlement_id: &str,
        record_type: RecordType,
        local_identifier: &str,
    ) -> Option<&TrackedRecord> {
        self.records
            .iter()
            .find(|r| r.key() == (settlement_id, record_type, local_identifier))
    }

    pub fn bulk_load(&self) -> &[TrackedRecord] {
        &self.records
    }

    pub fn for_settlement(&self, settlement_id: &str) -> Vec<&TrackedRecord> {
        self.records
            .iter()
            .filter(|r| r.settlement_id == settlement_id)
            .collect()
    }

    /// Posted invoice number to remote id map for one settlement, used to
    /// resolve payment targets.
    pub fn posted_invoice_map(&self, settlement_id: &str) -> HashMap<String, String> {
        self.records
            .iter()
            .filter(|r| {
                r.settlement_id == settlement_id
                    && r.record_type == RecordType::Invoice
                    && r.is_posted()
            })
            .filter_map(|r| Some((r.local_identifier.clone(), r.zoho_id.clone()?)))
            .collect()
    }

    /// Insert or update by the identifying triple. A matching row is
    /// updated in place; the store never grows a duplicate triple.
    #[instrument(skip(self, record), fields(settlement_id = %record.settlement_id, record_type = %record.record_type, local_identifier = %record.local_identifier))]
    pub fn upsert(&mut self, record: TrackedRecord) -> Result<(), SyncError> {
        let key = (
            record.settlement_id.clone(),
            record.record_type,
            record.local_identifier.clone(),
        );
        match self
            .records
            .iter_mut()
            .find(|r| r.key() == (key.0.as_str(), key.1, key.2.as_str()))
        {
            Some(existing) => {
                existing.zoho_id = record.zoho_id;
                existing.zoho_number = record.zoho_number;
                existing.reference_number = record.reference_number;
                existing.status = record.status;
                info!("Tracking row updated");
            }
            None => {
                self.records.push(record);
                info!("Tracking row added");
            }
        }
        self.persist()
    }

    /// Remove rows for records that were explicitly deleted remotely.
    /// Only remediation calls this, synchronized with an actual remote
    /// delete.
    pub fn remove(
        &mut self,
        settlement_id: &str,
        record_type: RecordType,
        local_identifier: &str,
    ) -> Result<(), SyncError> {
        self.records
            .retain(|r| r.key() != (settlement_id, record_type, local_identifier));
        self.persist()
    }

    fn persist(&self) -> Result<(), SyncError> {
        write_csv_atomic(&self.path, &self.records)
    }
}

/// Denormalized per-settlement sync status. Must never contradict the
/// tracking store for the same settlement; the reconciliation reporter
/// flags drift between the two.
pub struct SettlementHistoryStore {
    path: PathBuf,
    entries: Vec<SettlementHistoryEntry>,
}

impl SettlementHistoryStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let path = path.into();
        let entries = if path.exists() {
            let mut reader = csv::Reader::from_path(&path)
                .map_err(|e| SyncError::Store(anyhow!("cannot open history: {}", e)))?;
            reader
                .deserialize()
                .collect::<Result<Vec<SettlementHistoryEntry>, _>>()
                .map_err(|e| SyncError::Store(anyhow!("corrupt history file: {}", e)))?
        } else {
            Vec::new()
        };
        Ok(Self { path, entries })
    }

    pub fn find(&self, settlement_id: &str) -> Option<&SettlementHistoryEntry> {
        self.entries.iter().find(|e| e.settlement_id == settlement_id)
    }

    pub fn entries(&self) -> &[SettlementHistoryEntry] {
        &self.entries
    }

    /// Record a successful journal post for a settlement.
    pub fn record_synced(
        &mut self,
        settlement_id: &str,
        journal_id: &str,
        deposit_date: Option<NaiveDate>,
    ) -> Result<(), SyncError> {
        match self.entries.iter_mut().find(|e| e.settlement_id == settlement_id) {
            Some(entry) => {
                entry.zoho_synced = true;
                entry.zoho_journal_id = Some(journal_id.to_string());
                entry.zoho_sync_date = Some(Utc::now());
                entry.zoho_sync_status = "success".to_string();
                if deposit_date.is_some() {
                    entry.deposit_date = deposit_date;
                }
            }
            None => self.entries.push(SettlementHistoryEntry {
                settlement_id: settlement_id.to_string(),
                deposit_date,
                zoho_synced: true,
                zoho_journal_id: Some(journal_id.to_string()),
                zoho_sync_date: Some(Utc::now()),
                zoho_sync_status: "success".to_string(),
            }),
        }
        write_csv_atomic(&self.path, &self.entries)
    }

    /// Mark a settlement as no longer synced after its remote records were
    /// deleted.
    pub fn record_reset(&mut self, settlement_id: &str) -> Result<(), SyncError> {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.settlement_id == settlement_id) {
            entry.zoho_synced = false;
            entry.zoho_journal_id = None;
            entry.zoho_sync_date = None;
            entry.zoho_sync_status = "reset".to_string();
        }
        write_csv_atomic(&self.path, &self.entries)
    }

    pub fn record_failed(&mut self, settlement_id: &str) -> Result<(), SyncError> {
        match self.entries.iter_mut().find(|e| e.settlement_id == settlement_id) {
            Some(entry) => {
                entry.zoho_sync_status = "failed".to_string();
            }
            None => self.entries.push(SettlementHistoryEntry {
                settlement_id: settlement_id.to_string(),
                deposit_date: None,
                zoho_synced: false,
                zoho_journal_id: None,
                zoho_sync_date: None,
                zoho_sync_status: "failed".to_string(),
            }),
        }
        write_csv_atomic(&self.path, &self.entries)
    }
}

/// Serialize rows to a temp file in the target directory, then rename over
/// the original. Rename within one filesystem is atomic, so a concurrent
/// reader sees either the old file or the new one, never a torn write.
fn write_csv_atomic<T: serde::Serialize>(path: &Path, rows: &[T]) -> Result<(), SyncError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| SyncError::Store(anyhow!("cannot create temp store file: {}", e)))?;
    {
        let mut writer = csv::Writer::from_writer(&tmp);
        for row in rows {
            writer
                .serialize(row)
                .map_err(|e| SyncError::Store(anyhow!("cannot write store row: {}", e)))?;
        }
        writer
            .flush()
            .map_err(|e| SyncError::Store(anyhow!("cannot flush store: {}", e)))?;
    }
    tmp.persist(path)
        .map_err(|e| SyncError::Store(anyhow!("cannot replace store file: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordStatus;
    use tempfile::tempdir;

    fn record(settlement: &str, rt: RecordType, local: &str, status: RecordStatus) -> TrackedRecord {
        TrackedRecord {
            settlement_id: settlement.to_string(),
            record_type: rt,
            local_identifier: local.to_string(),
            zoho_id: matches!(status, RecordStatus::Posted).then(|| "900000001".to_string()),
            zoho_number: None,
            reference_number: settlement.to_string(),
            status,
            created_date: Utc::now(),
        }
    }

    #[test]
    fn upsert_never_duplicates_the_triple() {
        let dir = tempdir().unwrap();
        let mut store = TrackingStore::load(dir.path().join("tracking.csv")).unwrap();

        store
            .upsert(record("111", RecordType::Invoice, "AMZN1234567", RecordStatus::Pending))
            .unwrap();
        store
            .upsert(record("111", RecordType::Invoice, "AMZN1234567", RecordStatus::Posted))
            .unwrap();

        assert_eq!(store.bulk_load().len(), 1);
        let row = store.lookup("111", RecordType::Invoice, "AMZN1234567").unwrap();
        assert_eq!(row.status, RecordStatus::Posted);
        assert!(row.is_posted());
    }

    #[test]
    fn store_survives_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tracking.csv");

        {
            let mut store = TrackingStore::load(&path).unwrap();
            store
                .upsert(record("111", RecordType::Journal, "111", RecordStatus::Posted))
                .unwrap();
            store
                .upsert(record("111", RecordType::Invoice, "AMZN1234567", RecordStatus::Pending))
                .unwrap();
        }

        let store = TrackingStore::load(&path).unwrap();
        assert_eq!(store.bulk_load().len(), 2);
        assert!(store
            .lookup("111", RecordType::Journal, "111")
            .unwrap()
            .is_posted());
        assert!(!store
            .lookup("111", RecordType::Invoice, "AMZN1234567")
            .unwrap()
            .is_posted());
    }

    #[test]
    fn posted_invoice_map_skips_unposted_rows() {
        let dir = tempdir().unwrap();
        let mut store = TrackingStore::load(dir.path().join("tracking.csv")).unwrap();
        store
            .upsert(record("111", RecordType::Invoice, "AMZN1234567", RecordStatus::Posted))
            .unwrap();
        store
            .upsert(record("111", RecordType::Invoice, "AMZN7654321", RecordStatus::Pending))
            .unwrap();
        store
            .upsert(record("222", RecordType::Invoice, "AMZN0000001", RecordStatus::Posted))
            .unwrap();

        let map = store.posted_invoice_map("111");
        assert_eq!(map.len(), 1);
        assert_eq!(map["AMZN1234567"], "900000001");
    }

    #[test]
    fn remove_deletes_only_the_matching_triple() {
        let dir = tempdir().unwrap();
        let mut store = TrackingStore::load(dir.path().join("tracking.csv")).unwrap();
        store
            .upsert(record("111", RecordType::Invoice, "AMZN1234567", RecordStatus::Posted))
            .unwrap();
        store
            .upsert(record("111", RecordType::Journal, "111", RecordStatus::Posted))
            .unwrap();

        store.remove("111", RecordType::Invoice, "AMZN1234567").unwrap();
        assert_eq!(store.bulk_load().len(), 1);
        assert!(store.lookup("111", RecordType::Journal, "111").is_some());
    }

    #[test]
    fn history_record_synced_updates_in_place() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.csv");
        let mut history = SettlementHistoryStore::load(&path).unwrap();

        history.record_failed("111").unwrap();
        history.record_synced("111", "900000050", None).unwrap();

        let history = SettlementHistoryStore::load(&path).unwrap();
        assert_eq!(history.entries().len(), 1);
        let entry = history.find("111").unwrap();
        assert!(entry.zoho_synced);
        assert_eq!(entry.zoho_journal_id.as_deref(), Some("900000050"));
        assert_eq!(entry.zoho_sync_status, "success");
    }
}
