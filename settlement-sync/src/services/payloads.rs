//! Remote payload builders.
//!
//! Pure functions from local records to the JSON bodies the remote ledger
//! accepts. Amounts cross into JSON as plain numbers rounded to two
//! places; all arithmetic stays in `Decimal` until the last step.

use crate::models::{InvoiceLine, JournalLine, LocalSettlement, PaymentRecord};
use anyhow::{anyhow, Context};
use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use sync_core::error::SyncError;

/// GL account name to remote chart-of-accounts id.
#[derive(Debug, Clone, Default)]
pub struct GlMapping {
    accounts: HashMap<String, String>,
}

impl GlMapping {
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("cannot read GL mapping {}", path.display()))
            .map_err(SyncError::Config)?;
        let accounts: HashMap<String, String> = serde_json::from_str(&content)
            .with_context(|| format!("invalid GL mapping {}", path.display()))
            .map_err(SyncError::Config)?;
        Ok(Self { accounts })
    }

    pub fn from_map(accounts: HashMap<String, String>) -> Self {
        Self { accounts }
    }

    /// Unmapped accounts fail the build; the remote rejects unknown account
    /// ids with a far less useful message.
    pub fn resolve(&self, gl_account: &str) -> Result<&str, SyncError> {
        self.accounts
            .get(gl_account)
            .map(String::as_str)
            .ok_or_else(|| SyncError::Validation {
                entity: format!("GL account '{}'", gl_account),
                message: "no remote account id mapped".to_string(),
            })
    }
}

/// How journal line items are shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalMode {
    /// One line per GL account, netted. Compact; always used for reversals.
    Aggregated,
    /// One line per source row, keeping per-row descriptions. The default.
    LineByLine,
}

fn money(amount: Decimal) -> Value {
    let rounded = amount.round_dp(2);
    json!(rounded.to_f64().unwrap_or(0.0))
}

fn date_str(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Build a journal payload for one settlement.
///
/// Fails if the journal does not balance to within `tolerance`; an
/// unbalanced journal must never reach the remote ledger. Passing `None`
/// skips the check, for operator-confirmed overrides only.
pub fn journal_payload(
    settlement: &LocalSettlement,
    mapping: &GlMapping,
    mode: JournalMode,
    tolerance: Option<Decimal>,
) -> Result<Value, SyncError> {
    let debits = settlement.journal_debits();
    let credits = settlement.journal_credits();
    // Balanced means strictly within tolerance; off by exactly one cent
    // is out of balance.
    if let Some(tolerance) = tolerance {
        if (debits - credits).abs() >= tolerance {
            return Err(SyncError::Validation {
                entity: format!("journal {}", settlement.settlement_id),
                message: format!("unbalanced: debits {} vs credits {}", debits, credits),
            });
        }
    }

    let date = settlement
        .deposit_date()
        .ok_or_else(|| SyncError::Validation {
            entity: format!("journal {}", settlement.settlement_id),
            message: "no journal lines".to_string(),
        })?;

    let line_items = match mode {
        JournalMode::Aggregated => aggregated_lines(settlement, mapping)?,
        JournalMode::LineByLine => per_row_lines(&settlement.journal, mapping)?,
    };
    if line_items.len() < 2 {
        return Err(SyncError::Validation {
            entity: format!("journal {}", settlement.settlement_id),
            message: "fewer than two non-zero lines".to_string(),
        });
    }

    Ok(json!({
        "journal_date": date_str(date),
        "reference_number": settlement.settlement_id,
        "notes": format!("Amazon settlement {}", settlement.settlement_id),
        "line_items": line_items,
    }))
}

fn aggregated_lines(
    settlement: &LocalSettlement,
    mapping: &GlMapping,
) -> Result<Vec<Value>, SyncError> {
    let mut lines = Vec::new();
    for (account, net) in settlement.gl_net_totals() {
        if net.round_dp(2).is_zero() {
            continue;
        }
        let account_id = mapping.resolve(&account)?;
        lines.push(json!({
            "account_id": account_id,
            "description": account,
            "amount": money(net.abs()),
            "debit_or_credit": if net > Decimal::ZERO { "debit" } else { "credit" },
        }));
    }
    Ok(lines)
}

fn per_row_lines(journal: &[JournalLine], mapping: &GlMapping) -> Result<Vec<Value>, SyncError> {
    let mut lines = Vec::new();
    for line in journal {
        let net = line.net();
        if net.round_dp(2).is_zero() {
            continue;
        }
        let account_id = mapping.resolve(&line.gl_account)?;
        lines.push(json!({
            "account_id": account_id,
            "description": line.description,
            "amount": money(net.abs()),
            "debit_or_credit": if net > Decimal::ZERO { "debit" } else { "credit" },
        }));
    }
    Ok(lines)
}

/// Build a reversal for an already-posted journal: same lines with debit
/// and credit swapped, dated and referenced so the original stays visible.
pub fn reversal_payload(
    settlement: &LocalSettlement,
    mapping: &GlMapping,
    tolerance: Decimal,
) -> Result<Value, SyncError> {
    let mut payload =
        journal_payload(settlement, mapping, JournalMode::Aggregated, Some(tolerance))?;

    payload["reference_number"] = json!(format!("{}-REV1", settlement.settlement_id));
    payload["notes"] = json!(format!(
        "Reversal of Amazon settlement {}",
        settlement.settlement_id
    ));
    if let Some(lines) = payload["line_items"].as_array_mut() {
        for line in lines {
            let flipped = match line["debit_or_credit"].as_str() {
                Some("debit") => "credit",
                _ => "debit",
            };
            line["debit_or_credit"] = json!(flipped);
        }
    }
    Ok(payload)
}

/// Build an invoice payload from its line rows. All rows must share the
/// same invoice number; the caller groups them.
pub fn invoice_payload(
    lines: &[InvoiceLine],
    customer_id: &str,
    item_ids: &HashMap<String, String>,
) -> Result<Value, SyncError> {
    let first = lines.first().ok_or_else(|| {
        SyncError::Internal(anyhow!("invoice payload requested with no lines"))
    })?;

    let line_items: Vec<Value> = lines
        .iter()
        .map(|line| {
            let mut item = json!({
                "name": line.sku,
                "description": line.merchant_order_id.clone().unwrap_or_default(),
                "rate": money(line.rate),
                "quantity": line.quantity.to_f64().unwrap_or(0.0),
            });
            if let Some(item_id) = item_ids.get(&line.sku) {
                item["item_id"] = json!(item_id);
            }
            item
        })
        .collect();

    Ok(json!({
        "customer_id": customer_id,
        "invoice_number": first.invoice_number,
        "reference_number": first.reference_number,
        "date": date_str(first.invoice_date),
        "line_items": line_items,
        "notes": first.notes.clone().unwrap_or_default(),
    }))
}

/// Build a payment payload applied against one posted invoice.
///
/// `amount` is the amount to apply, already clamped by the caller to the
/// invoice's open balance.
pub fn payment_payload(
    payment: &PaymentRecord,
    customer_id: &str,
    invoice_id: &str,
    amount: Decimal,
) -> Value {
    json!({
        "customer_id": customer_id,
        "payment_mode": payment.payment_mode,
        "amount": money(amount),
        "date": date_str(payment.payment_date),
        "reference_number": payment.reference_number,
        "description": payment.description.clone().unwrap_or_default(),
        "invoices": [{
            "invoice_id": invoice_id,
            "amount_applied": money(amount),
        }],
    })
}
