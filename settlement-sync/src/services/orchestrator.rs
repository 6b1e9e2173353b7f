//! Posting orchestrator.
//!
//! Drives one settlement at a time through three stages in dependency
//! order: journal, then invoices, then payments. Every stage consults the
//! decision layer before writing, repairs the tracking store when a remote
//! copy is adopted, and records failures without aborting the batch.
//! A dry run walks the same path but performs no remote writes and no
//! store writes.

use crate::config::PolicyConfig;
use crate::models::{
    InvoiceLine, LocalSettlement, RecordStatus, RecordType, TrackedRecord,
};
use crate::services::decision::{Candidate, Decision, DecisionEngine};
use crate::services::ledger::{ListQuery, PostOptions, RemoteLedger};
use crate::services::notify::{AlertPayload, Notifier};
use crate::services::payloads::{self, GlMapping, JournalMode};
use crate::services::repository::SettlementRepository;
use crate::services::tracking::{SettlementHistoryStore, TrackingStore};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use sync_core::error::SyncError;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub dry_run: bool,
    pub post_journal: bool,
    pub post_invoices: bool,
    pub post_payments: bool,
    pub journal_mode: JournalMode,
    /// Skip the journal balance pre-flight. Operator-confirmed only.
    pub override_balance: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            post_journal: true,
            post_invoices: true,
            post_payments: true,
            journal_mode: JournalMode::LineByLine,
            override_balance: false,
        }
    }
}

/// Counters for one batch run. `errors` holds every failure alert raised;
/// the run itself only fails on store or configuration errors.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub settlements_processed: usize,
    pub journals_posted: usize,
    pub journals_skipped: usize,
    pub invoices_posted: usize,
    pub invoices_skipped: usize,
    pub payments_posted: usize,
    pub payments_skipped: usize,
    pub adopted: usize,
    pub conflicts: usize,
    pub errors: Vec<AlertPayload>,
}

impl RunSummary {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.conflicts == 0
    }
}

pub struct Orchestrator<'a> {
    ledger: &'a dyn RemoteLedger,
    decision: DecisionEngine,
    policy: PolicyConfig,
    gl_mapping: GlMapping,
    notifier: &'a dyn Notifier,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        ledger: &'a dyn RemoteLedger,
        policy: PolicyConfig,
        gl_mapping: GlMapping,
        notifier: &'a dyn Notifier,
    ) -> Self {
        Self {
            ledger,
            decision: DecisionEngine::new(policy.clone()),
            policy,
            gl_mapping,
            notifier,
        }
    }

    /// Run the batch over the given settlement ids, pacing between
    /// settlements to stay under the remote rate limit.
    pub async fn run(
        &self,
        repo: &dyn SettlementRepository,
        tracking: &mut TrackingStore,
        history: &mut SettlementHistoryStore,
        settlement_ids: &[String],
        opts: &RunOptions,
    ) -> Result<RunSummary, SyncError> {
        let mut summary = RunSummary::default();

        for (i, settlement_id) in settlement_ids.iter().enumerate() {
            if i > 0 && !opts.dry_run {
                tokio::time::sleep(self.policy.settlement_pacing).await;
            }

            let settlement = match repo.load(settlement_id) {
                Ok(s) => s,
                Err(err) => {
                    self.fail(&mut summary, settlement_id, "load", settlement_id, &err);
                    continue;
                }
            };
            // Errors local to one settlement never abort the batch.
            if let Err(err) = self
                .sync_settlement(&settlement, tracking, history, opts, &mut summary)
                .await
            {
                self.fail(&mut summary, settlement_id, "settlement", settlement_id, &err);
                if !opts.dry_run {
                    history.record_failed(settlement_id)?;
                }
            }
            summary.settlements_processed += 1;
        }

        info!(
            settlements = summary.settlements_processed,
            journals = summary.journals_posted,
            invoices = summary.invoices_posted,
            payments = summary.payments_posted,
            adopted = summary.adopted,
            conflicts = summary.conflicts,
            errors = summary.errors.len(),
            dry_run = opts.dry_run,
            "Batch run complete"
        );
        Ok(summary)
    }

    #[instrument(skip_all, fields(settlement_id = %settlement.settlement_id, dry_run = opts.dry_run))]
    async fn sync_settlement(
        &self,
        settlement: &LocalSettlement,
        tracking: &mut TrackingStore,
        history: &mut SettlementHistoryStore,
        opts: &RunOptions,
        summary: &mut RunSummary,
    ) -> Result<(), SyncError> {
        let mut journal_known = !opts.post_journal;
        if opts.post_journal {
            journal_known = self
                .sync_journal(settlement, tracking, history, opts, summary)
                .await?;
        }

        // Invoices depend on the journal being in place; payments depend on
        // invoices being resolvable.
        if opts.post_invoices && journal_known {
            self.sync_invoices(settlement, tracking, opts, summary).await?;
        } else if opts.post_invoices {
            warn!("Journal not posted, skipping invoices and payments");
            return Ok(());
        }

        if opts.post_payments {
            self.sync_payments(settlement, tracking, opts, summary).await?;
        }
        Ok(())
    }

    /// Returns whether the journal is known to exist remotely after this
    /// stage (posted now, already posted, or adopted).
    async fn sync_journal(
        &self,
        settlement: &LocalSettlement,
        tracking: &mut TrackingStore,
        history: &mut SettlementHistoryStore,
        opts: &RunOptions,
        summary: &mut RunSummary,
    ) -> Result<bool, SyncError> {
        let id = &settlement.settlement_id;
        let candidate = Candidate {
            settlement_id: id.clone(),
            record_type: RecordType::Journal,
            local_identifier: id.clone(),
            reference_number: id.clone(),
            expected_amount: Some(settlement.journal_debits()),
        };

        let tolerance = (!opts.override_balance).then_some(self.policy.amount_tolerance);
        let payload = match payloads::journal_payload(
            settlement,
            &self.gl_mapping,
            opts.journal_mode,
            tolerance,
        ) {
            Ok(p) => p,
            Err(err) => {
                self.fail(summary, id, "journal", id, &err);
                if !opts.dry_run {
                    history.record_failed(id)?;
                }
                return Ok(false);
            }
        };

        let tracked = tracking.lookup(id, RecordType::Journal, id).cloned();
        match self.decision.decide(self.ledger, &candidate, tracked.as_ref()).await {
            Ok(Decision::Skip { .. }) => {
                summary.journals_skipped += 1;
                Ok(true)
            }
            Ok(Decision::PostNew) => {
                if opts.dry_run {
                    info!(settlement_id = %id, "[DRY RUN] Would post journal");
                    summary.journals_posted += 1;
                    return Ok(true);
                }
                tracking.upsert(pending_row(&candidate))?;
                match self
                    .ledger
                    .post(RecordType::Journal, &payload, &PostOptions::default())
                    .await
                {
                    Ok(remote) => {
                        tracking.upsert(posted_row(&candidate, &remote.id, remote.number))?;
                        history.record_synced(id, &remote.id, settlement.deposit_date())?;
                        summary.journals_posted += 1;
                        Ok(true)
                    }
                    Err(err) => {
                        tracking.upsert(error_row(&candidate))?;
                        history.record_failed(id)?;
                        self.fail(summary, id, "journal", id, &err);
                        Ok(false)
                    }
                }
            }
            Ok(Decision::AdoptRemote { remote }) => {
                summary.adopted += 1;
                if !opts.dry_run {
                    tracking.upsert(posted_row(&candidate, &remote.remote_id, remote.number))?;
                    history.record_synced(id, &remote.remote_id, settlement.deposit_date())?;
                }
                Ok(true)
            }
            Ok(Decision::Conflict {
                remote_id,
                expected,
                actual,
            }) => {
                summary.conflicts += 1;
                self.fail(
                    summary,
                    id,
                    "journal",
                    id,
                    &SyncError::IdentityConflict {
                        identifier: format!("journal {} (remote {})", id, remote_id),
                        expected: expected.to_string(),
                        actual: actual.to_string(),
                    },
                );
                Ok(false)
            }
            Err(err) => {
                self.fail(summary, id, "journal", id, &err);
                Ok(false)
            }
        }
    }

    async fn sync_invoices(
        &self,
        settlement: &LocalSettlement,
        tracking: &mut TrackingStore,
        opts: &RunOptions,
        summary: &mut RunSummary,
    ) -> Result<(), SyncError> {
        if settlement.invoices.is_empty() {
            return Ok(());
        }
        let id = &settlement.settlement_id;

        // One customer per settlement; resolve it once.
        let customer_name = &settlement.invoices[0].customer_name;
        let customer_id = match self.ledger.find_customer(customer_name).await? {
            Some(cid) => cid,
            None => {
                self.fail(
                    summary,
                    id,
                    "invoices",
                    customer_name,
                    &SyncError::Validation {
                        entity: format!("customer '{}'", customer_name),
                        message: "not found in remote ledger".to_string(),
                    },
                );
                return Ok(());
            }
        };

        let item_ids = self.resolve_items(settlement).await?;
        let groups = group_by_invoice(&settlement.invoices);

        for (invoice_number, lines) in groups {
            if !self.policy.invoice_number_pattern.is_match(&invoice_number) {
                self.fail(
                    summary,
                    id,
                    "invoices",
                    &invoice_number,
                    &SyncError::Validation {
                        entity: format!("invoice {}", invoice_number),
                        message: "invoice number does not match the expected format".to_string(),
                    },
                );
                continue;
            }
            if let Some(missing) = lines.iter().find(|l| !item_ids.contains_key(&l.sku)) {
                warn!(invoice_number, sku = %missing.sku, "SKU unresolved, skipping invoice");
                summary.invoices_skipped += 1;
                continue;
            }

            let total: Decimal = lines.iter().map(|l| l.amount).sum();
            let candidate = Candidate {
                settlement_id: id.clone(),
                record_type: RecordType::Invoice,
                local_identifier: invoice_number.clone(),
                reference_number: id.clone(),
                expected_amount: Some(total),
            };
            let tracked = tracking.lookup(id, RecordType::Invoice, &invoice_number).cloned();

            match self.decision.decide(self.ledger, &candidate, tracked.as_ref()).await {
                Ok(Decision::Skip { .. }) => summary.invoices_skipped += 1,
                Ok(Decision::PostNew) => {
                    if opts.dry_run {
                        info!(invoice_number, "[DRY RUN] Would post invoice");
                        summary.invoices_posted += 1;
                        continue;
                    }
                    let payload = match payloads::invoice_payload(&lines, &customer_id, &item_ids) {
                        Ok(p) => p,
                        Err(err) => {
                            self.fail(summary, id, "invoices", &invoice_number, &err);
                            continue;
                        }
                    };
                    tracking.upsert(pending_row(&candidate))?;
                    // The local number must survive; the remote would
                    // otherwise assign its own.
                    let options = PostOptions {
                        ignore_auto_number: true,
                    };
                    match self.ledger.post(RecordType::Invoice, &payload, &options).await {
                        Ok(remote) => {
                            tracking.upsert(posted_row(&candidate, &remote.id, remote.number))?;
                            summary.invoices_posted += 1;
                        }
                        Err(err) => {
                            tracking.upsert(error_row(&candidate))?;
                            self.fail(summary, id, "invoices", &invoice_number, &err);
                        }
                    }
                }
                Ok(Decision::AdoptRemote { remote }) => {
                    summary.adopted += 1;
                    if !opts.dry_run {
                        tracking.upsert(posted_row(&candidate, &remote.remote_id, remote.number))?;
                    }
                }
                Ok(Decision::Conflict {
                    remote_id,
                    expected,
                    actual,
                }) => {
                    summary.conflicts += 1;
                    if !opts.dry_run {
                        tracking.upsert(error_row(&candidate))?;
                    }
                    self.fail(
                        summary,
                        id,
                        "invoices",
                        &invoice_number,
                        &SyncError::IdentityConflict {
                            identifier: format!("{} (remote {})", invoice_number, remote_id),
                            expected: expected.to_string(),
                            actual: actual.to_string(),
                        },
                    );
                }
                Err(err) => self.fail(summary, id, "invoices", &invoice_number, &err),
            }
        }
        Ok(())
    }

    /// Payments are idempotent through the invoice balance rather than the
    /// decision layer: a zero-balance invoice has already absorbed its
    /// payment, whoever posted it.
    async fn sync_payments(
        &self,
        settlement: &LocalSettlement,
        tracking: &mut TrackingStore,
        opts: &RunOptions,
        summary: &mut RunSummary,
    ) -> Result<(), SyncError> {
        if settlement.payments.is_empty() {
            return Ok(());
        }
        let id = &settlement.settlement_id;

        let mut invoice_map = tracking.posted_invoice_map(id);
        let mut customer_id: Option<String> = None;

        // Tracking may be stale after a reset; refresh from the remote
        // ledger when any payment target is unresolved.
        let unresolved = settlement
            .payments
            .iter()
            .any(|p| !invoice_map.contains_key(&p.invoice_number));
        if unresolved {
            let remote = self
                .ledger
                .list(RecordType::Invoice, &ListQuery::by_reference(id))
                .await?;
            for inv in remote {
                if customer_id.is_none() {
                    customer_id = inv.customer_id.clone();
                }
                if let Some(number) = inv.number {
                    invoice_map.entry(number).or_insert(inv.remote_id);
                }
            }
        }

        for payment in &settlement.payments {
            let Some(invoice_id) = invoice_map.get(&payment.invoice_number).cloned() else {
                // In a dry run the invoice this payment targets was itself
                // never created; treat it as resolvable.
                if opts.dry_run {
                    info!(invoice_number = %payment.invoice_number, "[DRY RUN] Would post payment");
                    summary.payments_posted += 1;
                    continue;
                }
                self.fail(
                    summary,
                    id,
                    "payments",
                    &payment.invoice_number,
                    &SyncError::UnresolvedInvoice {
                        invoice_number: payment.invoice_number.clone(),
                    },
                );
                continue;
            };

            let candidate = Candidate {
                settlement_id: id.clone(),
                record_type: RecordType::Payment,
                local_identifier: payment.invoice_number.clone(),
                reference_number: id.clone(),
                expected_amount: Some(payment.amount),
            };
            if tracking
                .lookup(id, RecordType::Payment, &payment.invoice_number)
                .is_some_and(TrackedRecord::is_posted)
            {
                summary.payments_skipped += 1;
                continue;
            }

            let balance = match self.ledger.get(RecordType::Invoice, &invoice_id).await? {
                Some(inv) => inv.balance.unwrap_or_default(),
                None => {
                    warn!(invoice_number = %payment.invoice_number, "Invoice vanished remotely, skipping payment");
                    summary.payments_skipped += 1;
                    continue;
                }
            };
            if balance.abs() < self.policy.amount_tolerance {
                info!(invoice_number = %payment.invoice_number, "Invoice already paid, skipping payment");
                summary.payments_skipped += 1;
                continue;
            }

            // Clamp to the open balance rather than over- or under-paying.
            let mut amount = payment.amount;
            if (amount - balance).abs() > self.policy.amount_tolerance {
                warn!(
                    invoice_number = %payment.invoice_number,
                    %amount,
                    %balance,
                    "Payment amount differs from open balance, applying balance"
                );
                amount = balance;
            }

            if opts.dry_run {
                info!(invoice_number = %payment.invoice_number, "[DRY RUN] Would post payment");
                summary.payments_posted += 1;
                continue;
            }

            let cid = match &customer_id {
                Some(c) => c.clone(),
                None => match self.ledger.find_customer(&payment.customer_name).await? {
                    Some(c) => {
                        customer_id = Some(c.clone());
                        c
                    }
                    None => {
                        self.fail(
                            summary,
                            id,
                            "payments",
                            &payment.invoice_number,
                            &SyncError::Validation {
                                entity: format!("customer '{}'", payment.customer_name),
                                message: "not found in remote ledger".to_string(),
                            },
                        );
                        continue;
                    }
                },
            };

            let payload = payloads::payment_payload(payment, &cid, &invoice_id, amount);
            tracking.upsert(pending_row(&candidate))?;
            match self
                .ledger
                .post(RecordType::Payment, &payload, &PostOptions::default())
                .await
            {
                Ok(remote) => {
                    tracking.upsert(posted_row(&candidate, &remote.id, None))?;
                    summary.payments_posted += 1;
                }
                Err(err) => {
                    tracking.upsert(error_row(&candidate))?;
                    self.fail(summary, id, "payments", &payment.invoice_number, &err);
                }
            }
        }
        Ok(())
    }

    async fn resolve_items(
        &self,
        settlement: &LocalSettlement,
    ) -> Result<HashMap<String, String>, SyncError> {
        let mut item_ids = HashMap::new();
        for line in &settlement.invoices {
            if item_ids.contains_key(&line.sku) {
                continue;
            }
            if let Some(item_id) = self.ledger.find_item(&line.sku).await? {
                item_ids.insert(line.sku.clone(), item_id);
            } else {
                warn!(sku = %line.sku, "SKU not found in remote ledger");
            }
        }
        Ok(item_ids)
    }

    fn fail(
        &self,
        summary: &mut RunSummary,
        settlement_id: &str,
        stage: &str,
        identifier: &str,
        err: &SyncError,
    ) {
        let alert = AlertPayload::new(settlement_id, stage, identifier, err.to_string());
        self.notifier.alert(&alert);
        summary.errors.push(alert);
    }
}

fn group_by_invoice(lines: &[InvoiceLine]) -> BTreeMap<String, Vec<InvoiceLine>> {
    let mut groups: BTreeMap<String, Vec<InvoiceLine>> = BTreeMap::new();
    for line in lines {
        groups
            .entry(line.invoice_number.clone())
            .or_default()
            .push(line.clone());
    }
    groups
}

fn pending_row(candidate: &Candidate) -> TrackedRecord {
    TrackedRecord {
        settlement_id: candidate.settlement_id.clone(),
        record_type: candidate.record_type,
        local_identifier: candidate.local_identifier.clone(),
        zoho_id: None,
        zoho_number: None,
        reference_number: candidate.reference_number.clone(),
        status: RecordStatus::Pending,
        created_date: Utc::now(),
    }
}

fn posted_row(candidate: &Candidate, remote_id: &str, number: Option<String>) -> TrackedRecord {
    TrackedRecord {
        zoho_id: Some(remote_id.to_string()),
        zoho_number: number,
        status: RecordStatus::Posted,
        ..pending_row(candidate)
    }
}

fn error_row(candidate: &Candidate) -> TrackedRecord {
    TrackedRecord {
        status: RecordStatus::Error,
        ..pending_row(candidate)
    }
}
