//! End-to-end orchestrator behavior against a scripted in-memory ledger.

mod common;

use async_trait::async_trait;
use common::{gl_mapping, harness, settlement, MemRepo, ScriptedLedger, SETTLEMENT};
use rust_decimal_macros::dec;
use settlement_sync::config::PolicyConfig;
use settlement_sync::models::RecordType;
use settlement_sync::services::ledger::{
    ListQuery, PostOptions, RemoteId, RemoteLedger, RemoteRecord,
};
use settlement_sync::services::orchestrator::{Orchestrator, RunOptions};
use settlement_sync::services::tracking::{SettlementHistoryStore, TrackingStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use sync_core::error::SyncError;
use tempfile::TempDir;

#[tokio::test]
async fn first_run_posts_all_three_stages() {
    let ledger = ScriptedLedger::new();
    let mut h = harness();
    let orchestrator = Orchestrator::new(&ledger, PolicyConfig::default(), gl_mapping(), &h.notifier);

    let summary = orchestrator
        .run(
            &h.repo,
            &mut h.tracking,
            &mut h.history,
            &[SETTLEMENT.to_string()],
            &RunOptions::default(),
        )
        .await
        .unwrap();

    assert!(summary.is_clean(), "errors: {:?}", summary.errors);
    assert_eq!(summary.journals_posted, 1);
    assert_eq!(summary.invoices_posted, 1);
    assert_eq!(summary.payments_posted, 1);
    assert_eq!(ledger.posts(), 3);

    let journal = h
        .tracking
        .lookup(SETTLEMENT, RecordType::Journal, SETTLEMENT)
        .unwrap();
    assert!(journal.is_posted());
    assert!(h.history.find(SETTLEMENT).unwrap().zoho_synced);
}

#[tokio::test]
async fn second_run_posts_nothing() {
    let ledger = ScriptedLedger::new();
    let mut h = harness();
    let orchestrator = Orchestrator::new(&ledger, PolicyConfig::default(), gl_mapping(), &h.notifier);
    let ids = [SETTLEMENT.to_string()];

    orchestrator
        .run(&h.repo, &mut h.tracking, &mut h.history, &ids, &RunOptions::default())
        .await
        .unwrap();
    let posts_after_first = ledger.posts();

    let summary = orchestrator
        .run(&h.repo, &mut h.tracking, &mut h.history, &ids, &RunOptions::default())
        .await
        .unwrap();

    assert_eq!(ledger.posts(), posts_after_first, "second run must not post");
    assert!(summary.is_clean());
    assert_eq!(summary.journals_skipped, 1);
    assert_eq!(summary.invoices_skipped, 1);
    assert_eq!(summary.payments_skipped, 1);
}

#[tokio::test]
async fn lost_tracking_adopts_remote_copies_instead_of_reposting() {
    let ledger = ScriptedLedger::new();
    let mut h = harness();
    let orchestrator = Orchestrator::new(&ledger, PolicyConfig::default(), gl_mapping(), &h.notifier);
    let ids = [SETTLEMENT.to_string()];

    // A prior run posted everything, then the tracking store was lost.
    orchestrator
        .run(&h.repo, &mut h.tracking, &mut h.history, &ids, &RunOptions::default())
        .await
        .unwrap();
    let posts_after_first = ledger.posts();
    let dir = TempDir::new().unwrap();
    let mut fresh_tracking = TrackingStore::load(dir.path().join("tracking.csv")).unwrap();
    let mut fresh_history = SettlementHistoryStore::load(dir.path().join("history.csv")).unwrap();

    let summary = orchestrator
        .run(&h.repo, &mut fresh_tracking, &mut fresh_history, &ids, &RunOptions::default())
        .await
        .unwrap();

    assert_eq!(ledger.posts(), posts_after_first, "no duplicates created");
    assert_eq!(summary.adopted, 2, "journal and invoice adopted");
    // Payment is covered by the zero invoice balance.
    assert_eq!(summary.payments_skipped, 1);
    assert!(fresh_tracking
        .lookup(SETTLEMENT, RecordType::Journal, SETTLEMENT)
        .unwrap()
        .is_posted());
    assert!(fresh_tracking
        .lookup(SETTLEMENT, RecordType::Invoice, "AMZN1234567")
        .unwrap()
        .is_posted());
}

#[tokio::test]
async fn dry_run_touches_nothing() {
    let ledger = ScriptedLedger::new();
    let mut h = harness();
    let orchestrator = Orchestrator::new(&ledger, PolicyConfig::default(), gl_mapping(), &h.notifier);

    let opts = RunOptions {
        dry_run: true,
        ..Default::default()
    };
    let summary = orchestrator
        .run(
            &h.repo,
            &mut h.tracking,
            &mut h.history,
            &[SETTLEMENT.to_string()],
            &opts,
        )
        .await
        .unwrap();

    assert_eq!(ledger.posts(), 0);
    assert!(h.tracking.bulk_load().is_empty());
    assert!(h.history.entries().is_empty());
    // The dry run still reports what it would have done.
    assert_eq!(summary.journals_posted, 1);
    assert_eq!(summary.invoices_posted, 1);
    assert_eq!(summary.payments_posted, 1);
}

#[tokio::test]
async fn remote_amount_conflict_blocks_the_invoice() {
    let ledger = ScriptedLedger::new();
    // Same invoice number under the settlement reference, wrong amount.
    ledger.seed(
        RecordType::Invoice,
        RemoteRecord {
            record_type: RecordType::Invoice,
            remote_id: "alien-1".to_string(),
            number: Some("AMZN1234567".to_string()),
            reference_number: Some(SETTLEMENT.to_string()),
            date: None,
            total: Some(dec!(75.00)),
            balance: Some(dec!(75.00)),
            customer_id: Some("cust-1".to_string()),
        },
    );
    let mut h = harness();
    let orchestrator = Orchestrator::new(&ledger, PolicyConfig::default(), gl_mapping(), &h.notifier);

    let summary = orchestrator
        .run(
            &h.repo,
            &mut h.tracking,
            &mut h.history,
            &[SETTLEMENT.to_string()],
            &RunOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(summary.conflicts, 1);
    assert_eq!(summary.invoices_posted, 0);
    assert!(!summary.is_clean());
    // Journal still went through; the conflict is scoped to the invoice.
    assert_eq!(summary.journals_posted, 1);
}

#[tokio::test]
async fn invoice_with_bad_number_format_is_rejected_locally() {
    let ledger = ScriptedLedger::new();
    let mut h = harness();
    let mut bad = settlement();
    bad.invoices[0].invoice_number = "INV-000045".to_string();
    bad.payments.clear();
    h.repo = MemRepo(HashMap::from([(SETTLEMENT.to_string(), bad)]));
    let orchestrator = Orchestrator::new(&ledger, PolicyConfig::default(), gl_mapping(), &h.notifier);

    let summary = orchestrator
        .run(
            &h.repo,
            &mut h.tracking,
            &mut h.history,
            &[SETTLEMENT.to_string()],
            &RunOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(summary.invoices_posted, 0);
    assert_eq!(summary.errors.len(), 1);
    // Only the journal reached the remote ledger.
    assert_eq!(ledger.posts(), 1);
}

#[tokio::test]
async fn payment_clamps_to_open_balance() {
    let ledger = ScriptedLedger::new();
    let mut h = harness();
    let mut overpay = settlement();
    overpay.payments[0].amount = dec!(80.00);
    h.repo = MemRepo(HashMap::from([(SETTLEMENT.to_string(), overpay)]));
    let orchestrator = Orchestrator::new(&ledger, PolicyConfig::default(), gl_mapping(), &h.notifier);

    let summary = orchestrator
        .run(
            &h.repo,
            &mut h.tracking,
            &mut h.history,
            &[SETTLEMENT.to_string()],
            &RunOptions::default(),
        )
        .await
        .unwrap();

    assert!(summary.is_clean(), "errors: {:?}", summary.errors);
    assert_eq!(summary.payments_posted, 1);
    // The invoice ended up settled exactly, not overpaid.
    let records = ledger
        .list(RecordType::Payment, &ListQuery::by_reference(SETTLEMENT))
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].total, Some(dec!(59.99)));
}

/// Delegates to a scripted ledger but throttles the first customer lookup.
struct FlakyLedger {
    inner: ScriptedLedger,
    failed_once: AtomicBool,
}

impl FlakyLedger {
    fn new() -> Self {
        Self {
            inner: ScriptedLedger::new(),
            failed_once: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl RemoteLedger for FlakyLedger {
    async fn post(
        &self,
        record_type: RecordType,
        payload: &serde_json::Value,
        options: &PostOptions,
    ) -> Result<RemoteId, SyncError> {
        self.inner.post(record_type, payload, options).await
    }

    async fn list(
        &self,
        record_type: RecordType,
        query: &ListQuery,
    ) -> Result<Vec<RemoteRecord>, SyncError> {
        self.inner.list(record_type, query).await
    }

    async fn get(
        &self,
        record_type: RecordType,
        remote_id: &str,
    ) -> Result<Option<RemoteRecord>, SyncError> {
        self.inner.get(record_type, remote_id).await
    }

    async fn delete(&self, record_type: RecordType, remote_id: &str) -> Result<(), SyncError> {
        self.inner.delete(record_type, remote_id).await
    }

    async fn find_customer(&self, name: &str) -> Result<Option<String>, SyncError> {
        if !self.failed_once.swap(true, Ordering::SeqCst) {
            return Err(SyncError::RateLimited {
                attempts: 4,
                message: "too many requests".to_string(),
            });
        }
        self.inner.find_customer(name).await
    }

    async fn find_item(&self, sku: &str) -> Result<Option<String>, SyncError> {
        self.inner.find_item(sku).await
    }
}

#[tokio::test]
async fn transient_failure_in_one_settlement_does_not_abort_the_batch() {
    let ledger = FlakyLedger::new();
    let mut h = harness();
    let second_id = "98765432109".to_string();
    let mut second = settlement();
    second.settlement_id = second_id.clone();
    second.invoices[0].reference_number = second_id.clone();
    second.invoices[0].invoice_number = "AMZN7654321".to_string();
    second.payments[0].reference_number = second_id.clone();
    second.payments[0].invoice_number = "AMZN7654321".to_string();
    h.repo = MemRepo(HashMap::from([
        (SETTLEMENT.to_string(), settlement()),
        (second_id.clone(), second),
    ]));
    let policy = PolicyConfig {
        settlement_pacing: Duration::from_millis(1),
        ..Default::default()
    };
    let orchestrator = Orchestrator::new(&ledger, policy, gl_mapping(), &h.notifier);

    let summary = orchestrator
        .run(
            &h.repo,
            &mut h.tracking,
            &mut h.history,
            &[SETTLEMENT.to_string(), second_id.clone()],
            &RunOptions::default(),
        )
        .await
        .unwrap();

    // The first settlement's invoice stage hit the rate limit; the second
    // still went through all three stages.
    assert_eq!(summary.settlements_processed, 2);
    assert_eq!(summary.errors.len(), 1);
    assert!(summary.errors[0].message.contains("Rate limited"));
    assert!(h
        .tracking
        .lookup(&second_id, RecordType::Invoice, "AMZN7654321")
        .unwrap()
        .is_posted());
    assert!(h
        .tracking
        .lookup(&second_id, RecordType::Payment, "AMZN7654321")
        .unwrap()
        .is_posted());
    assert_eq!(h.history.find(SETTLEMENT).unwrap().zoho_sync_status, "failed");
    assert!(h.history.find(&second_id).unwrap().zoho_synced);
}

#[tokio::test]
async fn journal_failure_gates_invoices_and_payments() {
    let ledger = ScriptedLedger::new();
    let mut h = harness();
    // Break the journal: remove the balancing line.
    let mut broken = settlement();
    broken.journal.pop();
    h.repo = MemRepo(HashMap::from([(SETTLEMENT.to_string(), broken)]));
    let orchestrator = Orchestrator::new(&ledger, PolicyConfig::default(), gl_mapping(), &h.notifier);

    let summary = orchestrator
        .run(
            &h.repo,
            &mut h.tracking,
            &mut h.history,
            &[SETTLEMENT.to_string()],
            &RunOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(ledger.posts(), 0, "nothing may reach the remote ledger");
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(h.history.find(SETTLEMENT).unwrap().zoho_sync_status, "failed");
}
