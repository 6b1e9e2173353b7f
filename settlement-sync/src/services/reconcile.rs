//! Reconciliation reporter.
//!
//! Read-only comparison of three views of the same settlement: the local
//! derived records, the tracking store, and what the remote ledger actually
//! holds. Produces findings, never fixes anything.

use crate::config::PolicyConfig;
use crate::models::{LocalSettlement, RecordType, TrackedRecord};
use crate::services::ledger::{ListQuery, RemoteLedger, RemoteRecord};
use crate::services::tracking::{SettlementHistoryStore, TrackingStore};
use anyhow::anyhow;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use sync_core::error::SyncError;
use tracing::{info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FindingKind {
    #[serde(rename = "MATCH")]
    Match,
    #[serde(rename = "AMOUNT_MISMATCH")]
    AmountMismatch,
    #[serde(rename = "MISSING_IN_REMOTE")]
    MissingInRemote,
    #[serde(rename = "ORPHAN_IN_REMOTE")]
    OrphanInRemote,
    #[serde(rename = "UNBALANCED_JOURNAL")]
    UnbalancedJournal,
    #[serde(rename = "TRACKING_DRIFT")]
    TrackingDrift,
}

/// One reconciliation observation, written as a report row.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub settlement_id: String,
    pub record_type: RecordType,
    pub identifier: String,
    pub kind: FindingKind,
    pub expected: Option<Decimal>,
    pub actual: Option<Decimal>,
    pub remote_id: Option<String>,
    pub detail: String,
}

/// Remote invoice numbers split by whether they carry the locally assigned
/// format. Native-format numbers under a settlement reference are a sign
/// auto-numbering was not suppressed.
#[derive(Debug, Default, Clone, Serialize)]
pub struct InvoiceFormatBreakdown {
    pub local_format: usize,
    pub native_format: usize,
    pub native_numbers: Vec<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct PortfolioSummary {
    pub settlements: usize,
    pub fully_matched: usize,
    pub with_mismatches: usize,
    pub with_missing: usize,
    pub with_orphans: usize,
    pub drift_findings: usize,
}

/// Compare one settlement's local records against the remote view.
/// Pure: everything it needs is passed in.
pub fn reconcile_settlement(
    local: &LocalSettlement,
    remote_journals: &[RemoteRecord],
    remote_invoices: &[RemoteRecord],
    remote_payments: &[RemoteRecord],
    policy: &PolicyConfig,
) -> Vec<Finding> {
    let mut findings = Vec::new();
    let id = &local.settlement_id;
    let tolerance = policy.amount_tolerance;

    let finding = |record_type, identifier: &str, kind, expected, actual, remote_id, detail: String| Finding {
        settlement_id: id.clone(),
        record_type,
        identifier: identifier.to_string(),
        kind,
        expected,
        actual,
        remote_id,
        detail,
    };

    // Journal balance is a local property; check it before anything remote.
    // Balanced means strictly within tolerance.
    let debits = local.journal_debits();
    let credits = local.journal_credits();
    if (debits - credits).abs() >= tolerance {
        findings.push(finding(
            RecordType::Journal,
            id,
            FindingKind::UnbalancedJournal,
            Some(debits),
            Some(credits),
            None,
            format!("debits {} vs credits {}", debits, credits),
        ));
    }

    match remote_journals.first() {
        Some(journal) => {
            let actual = journal.total.unwrap_or_default();
            let kind = if (debits - actual).abs() > tolerance {
                FindingKind::AmountMismatch
            } else {
                FindingKind::Match
            };
            findings.push(finding(
                RecordType::Journal,
                id,
                kind,
                Some(debits),
                Some(actual),
                Some(journal.remote_id.clone()),
                String::new(),
            ));
        }
        None if !local.journal.is_empty() => {
            findings.push(finding(
                RecordType::Journal,
                id,
                FindingKind::MissingInRemote,
                Some(debits),
                None,
                None,
                String::new(),
            ));
        }
        None => {}
    }
    // More than one remote journal under one reference is a duplicate post.
    for extra in remote_journals.iter().skip(1) {
        findings.push(finding(
            RecordType::Journal,
            id,
            FindingKind::OrphanInRemote,
            None,
            extra.total,
            Some(extra.remote_id.clone()),
            "duplicate journal under the same reference".to_string(),
        ));
    }

    let local_totals = local.invoice_totals();
    for (number, expected) in &local_totals {
        match remote_invoices
            .iter()
            .find(|r| r.number.as_deref() == Some(number.as_str()))
        {
            Some(remote) => {
                let actual = remote.total.unwrap_or_default();
                let kind = if (*expected - actual).abs() > tolerance {
                    FindingKind::AmountMismatch
                } else {
                    FindingKind::Match
                };
                findings.push(finding(
                    RecordType::Invoice,
                    number,
                    kind,
                    Some(*expected),
                    Some(actual),
                    Some(remote.remote_id.clone()),
                    String::new(),
                ));
            }
            None => findings.push(finding(
                RecordType::Invoice,
                number,
                FindingKind::MissingInRemote,
                Some(*expected),
                None,
                None,
                String::new(),
            )),
        }
    }
    let local_numbers: BTreeSet<&str> = local_totals.keys().map(String::as_str).collect();
    for remote in remote_invoices {
        let number = remote.number.as_deref().unwrap_or("");
        if !local_numbers.contains(number) {
            findings.push(finding(
                RecordType::Invoice,
                number,
                FindingKind::OrphanInRemote,
                None,
                remote.total,
                Some(remote.remote_id.clone()),
                "remote invoice with no local counterpart".to_string(),
            ));
        }
    }

    // Payments reconcile on totals; individual payments share the same
    // reference and are not individually addressable.
    let local_payment_total: Decimal = local.payments.iter().map(|p| p.amount).sum();
    let remote_payment_total: Decimal = remote_payments
        .iter()
        .filter_map(|p| p.total)
        .sum();
    if !local.payments.is_empty() || !remote_payments.is_empty() {
        let kind = if (local_payment_total - remote_payment_total).abs() > tolerance {
            FindingKind::AmountMismatch
        } else {
            FindingKind::Match
        };
        findings.push(finding(
            RecordType::Payment,
            id,
            kind,
            Some(local_payment_total),
            Some(remote_payment_total),
            None,
            format!(
                "{} local payments vs {} remote",
                local.payments.len(),
                remote_payments.len()
            ),
        ));
    }

    findings.sort_by(|a, b| {
        (a.record_type.as_str(), a.identifier.as_str())
            .cmp(&(b.record_type.as_str(), b.identifier.as_str()))
    });
    findings
}

/// Classify remote invoice numbers against the local numbering format.
pub fn classify_invoice_numbers(
    remote_invoices: &[RemoteRecord],
    policy: &PolicyConfig,
) -> InvoiceFormatBreakdown {
    let mut breakdown = InvoiceFormatBreakdown::default();
    for remote in remote_invoices {
        let Some(number) = remote.number.as_deref() else {
            continue;
        };
        if policy.invoice_number_pattern.is_match(number) {
            breakdown.local_format += 1;
        } else {
            breakdown.native_format += 1;
            breakdown.native_numbers.push(number.to_string());
        }
    }
    breakdown.native_numbers.sort();
    breakdown
}

/// Cross-check the history file against the tracking store: a settlement
/// marked synced must have a posted journal row, and vice versa.
pub fn history_drift(
    tracking: &TrackingStore,
    history: &SettlementHistoryStore,
) -> Vec<Finding> {
    let mut findings = Vec::new();

    for entry in history.entries() {
        if !entry.zoho_synced {
            continue;
        }
        let posted = tracking
            .lookup(&entry.settlement_id, RecordType::Journal, &entry.settlement_id)
            .is_some_and(TrackedRecord::is_posted);
        if !posted {
            findings.push(Finding {
                settlement_id: entry.settlement_id.clone(),
                record_type: RecordType::Journal,
                identifier: entry.settlement_id.clone(),
                kind: FindingKind::TrackingDrift,
                expected: None,
                actual: None,
                remote_id: entry.zoho_journal_id.clone(),
                detail: "history says synced but tracking has no posted journal".to_string(),
            });
        }
    }
    for row in tracking.bulk_load() {
        if row.record_type != RecordType::Journal || !row.is_posted() {
            continue;
        }
        let synced = history
            .find(&row.settlement_id)
            .map(|e| e.zoho_synced)
            .unwrap_or(false);
        if !synced {
            findings.push(Finding {
                settlement_id: row.settlement_id.clone(),
                record_type: RecordType::Journal,
                identifier: row.settlement_id.clone(),
                kind: FindingKind::TrackingDrift,
                expected: None,
                actual: None,
                remote_id: row.zoho_id.clone(),
                detail: "tracking has a posted journal but history disagrees".to_string(),
            });
        }
    }

    findings.sort_by(|a, b| a.settlement_id.cmp(&b.settlement_id));
    findings
}

pub fn summarize(findings_per_settlement: &[(String, Vec<Finding>)]) -> PortfolioSummary {
    let mut summary = PortfolioSummary {
        settlements: findings_per_settlement.len(),
        ..Default::default()
    };
    for (_, findings) in findings_per_settlement {
        let mismatches = findings.iter().any(|f| f.kind == FindingKind::AmountMismatch);
        let missing = findings.iter().any(|f| f.kind == FindingKind::MissingInRemote);
        let orphans = findings.iter().any(|f| f.kind == FindingKind::OrphanInRemote);
        let drift = findings.iter().filter(|f| f.kind == FindingKind::TrackingDrift).count();
        summary.drift_findings += drift;
        if mismatches {
            summary.with_mismatches += 1;
        }
        if missing {
            summary.with_missing += 1;
        }
        if orphans {
            summary.with_orphans += 1;
        }
        if !mismatches && !missing && !orphans && drift == 0 {
            summary.fully_matched += 1;
        }
    }
    summary
}

/// Fetches remote state and runs the pure comparison per settlement.
pub struct Reconciler<'a> {
    ledger: &'a dyn RemoteLedger,
    policy: PolicyConfig,
    reports_dir: PathBuf,
}

impl<'a> Reconciler<'a> {
    pub fn new(ledger: &'a dyn RemoteLedger, policy: PolicyConfig, reports_dir: PathBuf) -> Self {
        Self {
            ledger,
            policy,
            reports_dir,
        }
    }

    #[instrument(skip(self, local), fields(settlement_id = %local.settlement_id))]
    pub async fn reconcile(&self, local: &LocalSettlement) -> Result<Vec<Finding>, SyncError> {
        let query = ListQuery::by_reference(&local.settlement_id);
        let journals = self.ledger.list(RecordType::Journal, &query).await?;
        let invoices = self.ledger.list(RecordType::Invoice, &query).await?;
        let payments = self.ledger.list(RecordType::Payment, &query).await?;

        let findings =
            reconcile_settlement(local, &journals, &invoices, &payments, &self.policy);
        let breakdown = classify_invoice_numbers(&invoices, &self.policy);
        info!(
            findings = findings.len(),
            local_format = breakdown.local_format,
            native_format = breakdown.native_format,
            "Settlement reconciled"
        );
        Ok(findings)
    }

    /// Write findings as a CSV report, one deterministic row order per run.
    pub fn write_report(&self, findings: &[Finding]) -> Result<PathBuf, SyncError> {
        std::fs::create_dir_all(&self.reports_dir)?;
        let path = self
            .reports_dir
            .join(format!("reconciliation_{}.csv", Utc::now().format("%Y%m%d_%H%M%S")));
        write_findings_csv(&path, findings)?;
        info!(path = %path.display(), rows = findings.len(), "Reconciliation report written");
        Ok(path)
    }

    /// Write the cross-settlement summary next to the findings report.
    pub fn write_summary(&self, summary: &PortfolioSummary) -> Result<PathBuf, SyncError> {
        std::fs::create_dir_all(&self.reports_dir)?;
        let path = self
            .reports_dir
            .join(format!("reconciliation_summary_{}.csv", Utc::now().format("%Y%m%d_%H%M%S")));
        let mut writer = csv::Writer::from_path(&path)
            .map_err(|e| SyncError::Store(anyhow!("cannot write summary {}: {}", path.display(), e)))?;
        writer
            .serialize(summary)
            .and_then(|_| writer.flush().map_err(Into::into))
            .map_err(|e| SyncError::Store(anyhow!("cannot write summary row: {}", e)))?;
        Ok(path)
    }
}

fn write_findings_csv(path: &Path, findings: &[Finding]) -> Result<(), SyncError> {
    let mut writer = csv::Writer::from_path(path)
        .map_err(|e| SyncError::Store(anyhow!("cannot write report {}: {}", path.display(), e)))?;
    for finding in findings {
        writer
            .serialize(finding)
            .map_err(|e| SyncError::Store(anyhow!("cannot write report row: {}", e)))?;
    }
    writer
        .flush()
        .map_err(|e| SyncError::Store(anyhow!("cannot flush report: {}", e)))?;
    Ok(())
}
