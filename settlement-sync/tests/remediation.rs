//! Remediation flows: reset and reverse-and-repost against the scripted
//! ledger.

mod common;

use common::{gl_mapping, harness, ScriptedLedger, SETTLEMENT};
use settlement_sync::config::PolicyConfig;
use settlement_sync::models::RecordType;
use settlement_sync::services::ledger::{ListQuery, RemoteLedger};
use settlement_sync::services::orchestrator::{Orchestrator, RunOptions};
use settlement_sync::services::remediation::Remediation;

async fn post_everything(ledger: &ScriptedLedger, h: &mut common::Harness) {
    let orchestrator = Orchestrator::new(ledger, PolicyConfig::default(), gl_mapping(), &h.notifier);
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
    assert!(summary.is_clean(), "fixture run failed: {:?}", summary.errors);
}

#[tokio::test]
async fn reset_deletes_payments_then_invoices_then_journals() {
    let ledger = ScriptedLedger::new();
    let mut h = harness();
    post_everything(&ledger, &mut h).await;

    let remediation = Remediation::new(&ledger, PolicyConfig::default(), gl_mapping());
    let summary = remediation
        .reset(&mut h.tracking, &mut h.history, SETTLEMENT, false)
        .await
        .unwrap();

    assert!(summary.failures.is_empty());
    assert_eq!(summary.deleted_payments, 1);
    assert_eq!(summary.deleted_invoices, 1);
    assert_eq!(summary.deleted_journals, 1);

    let order: Vec<RecordType> = ledger
        .deletes
        .lock()
        .unwrap()
        .iter()
        .map(|(rt, _)| *rt)
        .collect();
    assert_eq!(
        order,
        vec![RecordType::Payment, RecordType::Invoice, RecordType::Journal]
    );

    assert_eq!(ledger.remaining(RecordType::Journal), 0);
    assert_eq!(ledger.remaining(RecordType::Invoice), 0);
    assert!(h.tracking.for_settlement(SETTLEMENT).is_empty());
    let entry = h.history.find(SETTLEMENT).unwrap();
    assert!(!entry.zoho_synced);
    assert_eq!(entry.zoho_sync_status, "reset");
}

#[tokio::test]
async fn reset_dry_run_plans_but_deletes_nothing() {
    let ledger = ScriptedLedger::new();
    let mut h = harness();
    post_everything(&ledger, &mut h).await;

    let remediation = Remediation::new(&ledger, PolicyConfig::default(), gl_mapping());
    let summary = remediation
        .reset(&mut h.tracking, &mut h.history, SETTLEMENT, true)
        .await
        .unwrap();

    assert!(summary.dry_run);
    assert_eq!(summary.planned.len(), 3);
    assert!(ledger.deletes.lock().unwrap().is_empty());
    assert_eq!(ledger.remaining(RecordType::Invoice), 1);
    assert_eq!(h.tracking.for_settlement(SETTLEMENT).len(), 3);
    assert!(h.history.find(SETTLEMENT).unwrap().zoho_synced);
}

#[tokio::test]
async fn reset_also_removes_records_tracking_never_knew_about() {
    let ledger = ScriptedLedger::new();
    let mut h = harness();
    post_everything(&ledger, &mut h).await;
    // Simulate an out-of-band invoice under the same reference.
    ledger.seed(
        RecordType::Invoice,
        settlement_sync::services::ledger::RemoteRecord {
            record_type: RecordType::Invoice,
            remote_id: "alien-7".to_string(),
            number: Some("AMZN9999999".to_string()),
            reference_number: Some(SETTLEMENT.to_string()),
            date: None,
            total: None,
            balance: None,
            customer_id: None,
        },
    );

    let remediation = Remediation::new(&ledger, PolicyConfig::default(), gl_mapping());
    let summary = remediation
        .reset(&mut h.tracking, &mut h.history, SETTLEMENT, false)
        .await
        .unwrap();

    assert_eq!(summary.deleted_invoices, 2);
    assert_eq!(ledger.remaining(RecordType::Invoice), 0);
}

#[tokio::test]
async fn reverse_and_repost_leaves_three_journals_visible() {
    let ledger = ScriptedLedger::new();
    let mut h = harness();
    post_everything(&ledger, &mut h).await;
    let original_id = h
        .tracking
        .lookup(SETTLEMENT, RecordType::Journal, SETTLEMENT)
        .unwrap()
        .zoho_id
        .clone()
        .unwrap();

    let remediation = Remediation::new(&ledger, PolicyConfig::default(), gl_mapping());
    let local = settlement_sync::services::repository::SettlementRepository::load(
        &h.repo, SETTLEMENT,
    )
    .unwrap();
    let outcome = remediation
        .reverse_and_repost(&local, &mut h.tracking, &mut h.history, false)
        .await
        .unwrap();

    let reversal_id = outcome.reversal_id.unwrap();
    let new_id = outcome.new_journal_id.unwrap();
    assert_ne!(new_id, original_id);

    // Original and corrected journals under the settlement reference.
    let journals = ledger
        .list(RecordType::Journal, &ListQuery::by_reference(SETTLEMENT))
        .await
        .unwrap();
    assert_eq!(journals.len(), 2);
    // The reversal sits under its own suffixed reference.
    let reversals = ledger
        .list(
            RecordType::Journal,
            &ListQuery::by_reference(&format!("{}-REV1", SETTLEMENT)),
        )
        .await
        .unwrap();
    assert_eq!(reversals.len(), 1);
    assert_eq!(reversals[0].remote_id, reversal_id);

    // Tracking now points at the corrected journal.
    let row = h
        .tracking
        .lookup(SETTLEMENT, RecordType::Journal, SETTLEMENT)
        .unwrap();
    assert_eq!(row.zoho_id.as_deref(), Some(new_id.as_str()));
}

#[tokio::test]
async fn reverse_without_a_remote_journal_is_refused() {
    let ledger = ScriptedLedger::new();
    let mut h = harness();
    let remediation = Remediation::new(&ledger, PolicyConfig::default(), gl_mapping());

    let local = common::settlement();
    let err = remediation
        .reverse_and_repost(&local, &mut h.tracking, &mut h.history, false)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("no remote journal"));
    assert_eq!(ledger.posts(), 0);
}
