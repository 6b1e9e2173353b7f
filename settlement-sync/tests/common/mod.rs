//! Shared fixtures: a scripted in-memory remote ledger and a canonical
//! local settlement.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use settlement_sync::models::{
    InvoiceLine, JournalLine, LocalSettlement, PaymentRecord, RecordType,
};
use settlement_sync::services::ledger::{
    ListQuery, PostOptions, RemoteId, RemoteLedger, RemoteRecord,
};
use settlement_sync::services::notify::FileNotifier;
use settlement_sync::services::payloads::GlMapping;
use settlement_sync::services::repository::SettlementRepository;
use settlement_sync::services::tracking::{SettlementHistoryStore, TrackingStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use sync_core::error::SyncError;
use tempfile::TempDir;

pub const SETTLEMENT: &str = "12345678901";

pub struct ScriptedLedger {
    records: Mutex<HashMap<RecordType, Vec<RemoteRecord>>>,
    post_count: AtomicUsize,
    pub deletes: Mutex<Vec<(RecordType, String)>>,
    next_id: AtomicUsize,
}

impl ScriptedLedger {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            post_count: AtomicUsize::new(0),
            deletes: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
        }
    }

    pub fn seed(&self, record_type: RecordType, record: RemoteRecord) {
        self.records
            .lock()
            .unwrap()
            .entry(record_type)
            .or_default()
            .push(record);
    }

    pub fn posts(&self) -> usize {
        self.post_count.load(Ordering::SeqCst)
    }

    pub fn remaining(&self, record_type: RecordType) -> usize {
        self.records
            .lock()
            .unwrap()
            .get(&record_type)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

fn payload_total(record_type: RecordType, payload: &serde_json::Value) -> Decimal {
    match record_type {
        RecordType::Journal => payload["line_items"]
            .as_array()
            .map(|lines| {
                lines
                    .iter()
                    .filter(|l| l["debit_or_credit"] == "debit")
                    .filter_map(|l| l["amount"].as_f64())
                    .filter_map(Decimal::from_f64)
                    .sum()
            })
            .unwrap_or_default(),
        RecordType::Invoice => payload["line_items"]
            .as_array()
            .map(|lines| {
                lines
                    .iter()
                    .filter_map(|l| {
                        let rate = Decimal::from_f64(l["rate"].as_f64()?)?;
                        let qty = Decimal::from_f64(l["quantity"].as_f64()?)?;
                        Some(rate * qty)
                    })
                    .sum()
            })
            .unwrap_or_default(),
        RecordType::Payment => payload["amount"]
            .as_f64()
            .and_then(Decimal::from_f64)
            .unwrap_or_default(),
    }
}

#[async_trait]
impl RemoteLedger for ScriptedLedger {
    async fn post(
        &self,
        record_type: RecordType,
        payload: &serde_json::Value,
        _options: &PostOptions,
    ) -> Result<RemoteId, SyncError> {
        self.post_count.fetch_add(1, Ordering::SeqCst);
        let id = format!("90000{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let number = payload["invoice_number"].as_str().map(str::to_string);
        let total = payload_total(record_type, payload);

        self.seed(
            record_type,
            RemoteRecord {
                record_type,
                remote_id: id.clone(),
                number: number.clone(),
                reference_number: payload["reference_number"].as_str().map(str::to_string),
                date: None,
                total: Some(total),
                balance: Some(total),
                customer_id: Some("cust-1".to_string()),
            },
        );

        // A posted payment settles its invoice balance.
        if record_type == RecordType::Payment {
            if let Some(invoice_id) = payload["invoices"][0]["invoice_id"].as_str() {
                let mut records = self.records.lock().unwrap();
                if let Some(invoices) = records.get_mut(&RecordType::Invoice) {
                    for inv in invoices.iter_mut() {
                        if inv.remote_id == invoice_id {
                            inv.balance = Some(Decimal::ZERO);
                        }
                    }
                }
            }
        }

        Ok(RemoteId { id, number })
    }

    async fn list(
        &self,
        record_type: RecordType,
        query: &ListQuery,
    ) -> Result<Vec<RemoteRecord>, SyncError> {
        let records = self.records.lock().unwrap();
        Ok(records
            .get(&record_type)
            .map(|rs| {
                rs.iter()
                    .filter(|r| match &query.reference_number {
                        Some(reference) => r.reference_number.as_deref() == Some(reference),
                        None => true,
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get(
        &self,
        record_type: RecordType,
        remote_id: &str,
    ) -> Result<Option<RemoteRecord>, SyncError> {
        let records = self.records.lock().unwrap();
        Ok(records
            .get(&record_type)
            .and_then(|rs| rs.iter().find(|r| r.remote_id == remote_id))
            .cloned())
    }

    async fn delete(&self, record_type: RecordType, remote_id: &str) -> Result<(), SyncError> {
        self.deletes
            .lock()
            .unwrap()
            .push((record_type, remote_id.to_string()));
        let mut records = self.records.lock().unwrap();
        if let Some(rs) = records.get_mut(&record_type) {
            rs.retain(|r| r.remote_id != remote_id);
        }
        Ok(())
    }

    async fn find_customer(&self, _name: &str) -> Result<Option<String>, SyncError> {
        Ok(Some("cust-1".to_string()))
    }

    async fn find_item(&self, sku: &str) -> Result<Option<String>, SyncError> {
        Ok(Some(format!("item-{}", sku)))
    }
}

pub struct MemRepo(pub HashMap<String, LocalSettlement>);

impl SettlementRepository for MemRepo {
    fn list_settlements(&self) -> Result<Vec<String>, SyncError> {
        let mut ids: Vec<String> = self.0.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn load(&self, settlement_id: &str) -> Result<LocalSettlement, SyncError> {
        self.0
            .get(settlement_id)
            .cloned()
            .ok_or_else(|| SyncError::Store(anyhow::anyhow!("unknown settlement {}", settlement_id)))
    }
}

pub fn settlement() -> LocalSettlement {
    let date = NaiveDate::from_ymd_opt(2025, 10, 1).unwrap();
    LocalSettlement {
        settlement_id: SETTLEMENT.to_string(),
        journal: vec![
            JournalLine {
                date,
                gl_account: "Amazon Sales".to_string(),
                debit: dec!(0),
                credit: dec!(100.00),
                description: "Product sales".to_string(),
            },
            JournalLine {
                date,
                gl_account: "Amazon Clearing".to_string(),
                debit: dec!(100.00),
                credit: dec!(0),
                description: "Net deposit".to_string(),
            },
        ],
        invoices: vec![InvoiceLine {
            invoice_number: "AMZN1234567".to_string(),
            invoice_date: date,
            customer_name: "Amazon Marketplace".to_string(),
            reference_number: SETTLEMENT.to_string(),
            sku: "SKU-A".to_string(),
            quantity: dec!(1),
            rate: dec!(59.99),
            amount: dec!(59.99),
            merchant_order_id: None,
            notes: None,
        }],
        payments: vec![PaymentRecord {
            reference_number: SETTLEMENT.to_string(),
            invoice_number: "AMZN1234567".to_string(),
            payment_date: date,
            payment_mode: "banktransfer".to_string(),
            customer_name: "Amazon Marketplace".to_string(),
            amount: dec!(59.99),
            description: None,
        }],
    }
}

pub fn gl_mapping() -> GlMapping {
    GlMapping::from_map(HashMap::from([
        ("Amazon Sales".to_string(), "101".to_string()),
        ("Amazon Clearing".to_string(), "102".to_string()),
    ]))
}

pub struct Harness {
    pub _dir: TempDir,
    pub tracking: TrackingStore,
    pub history: SettlementHistoryStore,
    pub notifier: FileNotifier,
    pub repo: MemRepo,
}

pub fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let tracking = TrackingStore::load(dir.path().join("tracking.csv")).unwrap();
    let history = SettlementHistoryStore::load(dir.path().join("history.csv")).unwrap();
    let notifier = FileNotifier::new(dir.path().join("alerts.jsonl"));
    let repo = MemRepo(HashMap::from([(SETTLEMENT.to_string(), settlement())]));
    Harness {
        _dir: dir,
        tracking,
        history,
        notifier,
        repo,
    }
}
