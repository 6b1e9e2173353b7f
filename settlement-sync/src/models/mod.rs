//! Domain models for the settlement sync engine.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Record Identity
// ============================================================================

/// The three record kinds a settlement produces in the remote ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    #[serde(rename = "JOURNAL")]
    Journal,
    #[serde(rename = "INVOICE")]
    Invoice,
    #[serde(rename = "PAYMENT")]
    Payment,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Journal => "JOURNAL",
            Self::Invoice => "INVOICE",
            Self::Payment => "PAYMENT",
        }
    }

    /// Zoho Books endpoint segment for this record kind.
    pub fn endpoint(&self) -> &'static str {
        match self {
            Self::Journal => "journals",
            Self::Invoice => "invoices",
            Self::Payment => "customerpayments",
        }
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Posting status of a tracked record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "POSTED")]
    Posted,
    #[serde(rename = "ERROR")]
    Error,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Posted => "POSTED",
            Self::Error => "ERROR",
        }
    }
}

// ============================================================================
// Tracking
// ============================================================================

/// Durable record of whether a local financial record has been posted
/// remotely, and under what remote id.
///
/// The (`settlement_id`, `record_type`, `local_identifier`) triple is the
/// idempotency key: at most one row per triple may be `Posted`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedRecord {
    pub settlement_id: String,
    pub record_type: RecordType,
    pub local_identifier: String,
    pub zoho_id: Option<String>,
    pub zoho_number: Option<String>,
    pub reference_number: String,
    pub status: RecordStatus,
    pub created_date: DateTime<Utc>,
}

impl TrackedRecord {
    pub fn is_posted(&self) -> bool {
        self.status == RecordStatus::Posted && self.zoho_id.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// Identity triple used for upsert matching.
    pub fn key(&self) -> (&str, RecordType, &str) {
        (
            self.settlement_id.as_str(),
            self.record_type,
            self.local_identifier.as_str(),
        )
    }
}

/// One row per settlement with aggregate sync status. Denormalized view over
/// the tracking store for journal rows; disagreement between the two is a
/// drift defect the reconciliation reporter detects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementHistoryEntry {
    pub settlement_id: String,
    pub deposit_date: Option<NaiveDate>,
    pub zoho_synced: bool,
    pub zoho_journal_id: Option<String>,
    pub zoho_sync_date: Option<DateTime<Utc>>,
    pub zoho_sync_status: String,
}

// ============================================================================
// Local Records (derivation stage output)
// ============================================================================

/// One journal line as derived from the settlement report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalLine {
    pub date: NaiveDate,
    pub gl_account: String,
    pub debit: Decimal,
    pub credit: Decimal,
    pub description: String,
}

impl JournalLine {
    /// Net amount: positive means debit, negative means credit.
    pub fn net(&self) -> Decimal {
        self.debit - self.credit
    }
}

/// One invoice line row. Several rows may share an invoice number; together
/// they form one invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub invoice_number: String,
    pub invoice_date: NaiveDate,
    pub customer_name: String,
    pub reference_number: String,
    pub sku: String,
    pub quantity: Decimal,
    pub rate: Decimal,
    pub amount: Decimal,
    pub merchant_order_id: Option<String>,
    pub notes: Option<String>,
}

/// One payment to apply against a posted invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub reference_number: String,
    pub invoice_number: String,
    pub payment_date: NaiveDate,
    pub payment_mode: String,
    pub customer_name: String,
    pub amount: Decimal,
    pub description: Option<String>,
}

/// All local records for one settlement, keyed by the external settlement id.
/// Immutable once derived.
#[derive(Debug, Clone)]
pub struct LocalSettlement {
    pub settlement_id: String,
    pub journal: Vec<JournalLine>,
    pub invoices: Vec<InvoiceLine>,
    pub payments: Vec<PaymentRecord>,
}

impl LocalSettlement {
    pub fn journal_debits(&self) -> Decimal {
        self.journal.iter().map(|l| l.debit).sum()
    }

    pub fn journal_credits(&self) -> Decimal {
        self.journal.iter().map(|l| l.credit).sum()
    }

    /// Net journal amount per GL account, in deterministic account order.
    pub fn gl_net_totals(&self) -> BTreeMap<String, Decimal> {
        let mut totals: BTreeMap<String, Decimal> = BTreeMap::new();
        for line in &self.journal {
            *totals.entry(line.gl_account.clone()).or_default() += line.net();
        }
        totals
    }

    /// Total expected amount per invoice number, summing split line rows.
    pub fn invoice_totals(&self) -> BTreeMap<String, Decimal> {
        let mut totals: BTreeMap<String, Decimal> = BTreeMap::new();
        for line in &self.invoices {
            *totals.entry(line.invoice_number.clone()).or_default() += line.amount;
        }
        totals
    }

    pub fn deposit_date(&self) -> Option<NaiveDate> {
        self.journal.first().map(|l| l.date)
    }
}
