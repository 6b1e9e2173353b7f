//! Local settlement repository.
//!
//! Derived settlement files live under one directory per settlement id:
//! `Journal_<id>.csv`, `Invoice_<id>.csv`, `Payment_<id>.csv`. The journal
//! file is required; invoice and payment files are optional and an absent
//! file simply means no records of that kind.

use crate::models::{InvoiceLine, JournalLine, LocalSettlement, PaymentRecord};
use anyhow::anyhow;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use sync_core::error::SyncError;
use tracing::{debug, instrument};

pub trait SettlementRepository: Send + Sync {
    /// Settlement ids available locally, sorted ascending.
    fn list_settlements(&self) -> Result<Vec<String>, SyncError>;

    fn load(&self, settlement_id: &str) -> Result<LocalSettlement, SyncError>;
}

/// CSV-directory implementation over the derivation stage's output tree.
pub struct CsvSettlementRepository {
    data_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct JournalRow {
    #[serde(rename = "Date")]
    date: String,
    #[serde(rename = "GL_Account")]
    gl_account: String,
    #[serde(rename = "Debit", default)]
    debit: Option<Decimal>,
    #[serde(rename = "Credit", default)]
    credit: Option<Decimal>,
    #[serde(rename = "Description", default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InvoiceRow {
    #[serde(rename = "Invoice Number")]
    invoice_number: String,
    #[serde(rename = "Invoice Date")]
    invoice_date: String,
    #[serde(rename = "Customer Name")]
    customer_name: String,
    #[serde(rename = "Reference Number")]
    reference_number: String,
    #[serde(rename = "SKU")]
    sku: String,
    #[serde(rename = "Quantity")]
    quantity: Decimal,
    #[serde(rename = "Item Price")]
    rate: Decimal,
    #[serde(rename = "Invoice Line Amount")]
    amount: Decimal,
    #[serde(rename = "merchant_order_id", default)]
    merchant_order_id: Option<String>,
    #[serde(rename = "Notes", default)]
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PaymentRow {
    #[serde(rename = "Reference Number")]
    reference_number: String,
    #[serde(rename = "Invoice Number")]
    invoice_number: String,
    #[serde(rename = "Payment Date")]
    payment_date: String,
    #[serde(rename = "Payment Mode", default)]
    payment_mode: Option<String>,
    #[serde(rename = "Customer Name")]
    customer_name: String,
    #[serde(rename = "Payment Amount")]
    amount: Decimal,
    #[serde(rename = "Description", default)]
    description: Option<String>,
}

fn parse_date(s: &str, context: &str) -> Result<NaiveDate, SyncError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|e| SyncError::Validation {
        entity: context.to_string(),
        message: format!("bad date '{}': {}", s, e),
    })
}

impl CsvSettlementRepository {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn settlement_dir(&self, settlement_id: &str) -> PathBuf {
        self.data_dir.join(settlement_id)
    }

    fn read_rows<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>, SyncError> {
        let mut reader = csv::Reader::from_path(path)
            .map_err(|e| SyncError::Store(anyhow!("cannot open {}: {}", path.display(), e)))?;
        reader
            .deserialize()
            .collect::<Result<Vec<T>, _>>()
            .map_err(|e| SyncError::Store(anyhow!("bad row in {}: {}", path.display(), e)))
    }
}

impl SettlementRepository for CsvSettlementRepository {
    fn list_settlements(&self) -> Result<Vec<String>, SyncError> {
        if !self.data_dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            // A settlement directory must contain its journal file.
            if entry.path().join(format!("Journal_{}.csv", name)).exists() {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }

    #[instrument(skip(self))]
    fn load(&self, settlement_id: &str) -> Result<LocalSettlement, SyncError> {
        let dir = self.settlement_dir(settlement_id);
        let journal_file = dir.join(format!("Journal_{}.csv", settlement_id));
        if !journal_file.exists() {
            return Err(SyncError::Store(anyhow!(
                "journal file not found: {}",
                journal_file.display()
            )));
        }

        let journal = Self::read_rows::<JournalRow>(&journal_file)?
            .into_iter()
            .map(|row| {
                Ok(JournalLine {
                    date: parse_date(&row.date, &format!("journal {}", settlement_id))?,
                    gl_account: row.gl_account,
                    debit: row.debit.unwrap_or_default(),
                    credit: row.credit.unwrap_or_default(),
                    description: row.description.unwrap_or_default(),
                })
            })
            .collect::<Result<Vec<_>, SyncError>>()?;

        let invoice_file = dir.join(format!("Invoice_{}.csv", settlement_id));
        let invoices = if invoice_file.exists() {
            Self::read_rows::<InvoiceRow>(&invoice_file)?
                .into_iter()
                .map(|row| {
                    Ok(InvoiceLine {
                        invoice_date: parse_date(
                            &row.invoice_date,
                            &format!("invoice {}", row.invoice_number),
                        )?,
                        invoice_number: row.invoice_number,
                        customer_name: row.customer_name,
                        reference_number: row.reference_number,
                        sku: row.sku,
                        quantity: row.quantity,
                        rate: row.rate,
                        amount: row.amount,
                        merchant_order_id: row.merchant_order_id.filter(|s| !s.is_empty()),
                        notes: row.notes.filter(|s| !s.is_empty()),
                    })
                })
                .collect::<Result<Vec<_>, SyncError>>()?
        } else {
            debug!("No invoice file, settlement has no invoices");
            Vec::new()
        };

        let payment_file = dir.join(format!("Payment_{}.csv", settlement_id));
        let payments = if payment_file.exists() {
            Self::read_rows::<PaymentRow>(&payment_file)?
                .into_iter()
                .map(|row| {
                    Ok(PaymentRecord {
                        payment_date: parse_date(
                            &row.payment_date,
                            &format!("payment for {}", row.invoice_number),
                        )?,
                        reference_number: row.reference_number,
                        invoice_number: row.invoice_number,
                        payment_mode: row
                            .payment_mode
                            .filter(|s| !s.is_empty())
                            .unwrap_or_else(|| "Direct Deposit".to_string()),
                        customer_name: row.customer_name,
                        amount: row.amount,
                        description: row.description.filter(|s| !s.is_empty()),
                    })
                })
                .collect::<Result<Vec<_>, SyncError>>()?
        } else {
            Vec::new()
        };

        Ok(LocalSettlement {
            settlement_id: settlement_id.to_string(),
            journal,
            invoices,
            payments,
        })
    }
}
