//! Remediation tools.
//!
//! Two operator-facing repairs: a reset that deletes everything a
//! settlement put in the remote ledger, and a reverse-and-repost that
//! corrects a wrong journal without destroying the audit trail. Both
//! support a dry run that renders the plan and touches nothing.
//!
//! Deletion order is fixed at payments, then invoices, then journals:
//! payments reference invoices and the remote rejects deleting a record
//! something still points at.

use crate::config::PolicyConfig;
use crate::models::{LocalSettlement, RecordStatus, RecordType, TrackedRecord};
use crate::services::ledger::{ListQuery, PostOptions, RemoteLedger};
use crate::services::payloads::{self, GlMapping, JournalMode};
use crate::services::tracking::{SettlementHistoryStore, TrackingStore};
use chrono::Utc;
use sync_core::error::SyncError;
use tracing::{info, instrument, warn};

/// One action a remediation run intends to take.
#[derive(Debug, Clone)]
pub struct PlannedAction {
    pub record_type: RecordType,
    pub remote_id: String,
    pub identifier: String,
}

#[derive(Debug, Default)]
pub struct ResetSummary {
    pub planned: Vec<PlannedAction>,
    pub deleted_payments: usize,
    pub deleted_invoices: usize,
    pub deleted_journals: usize,
    pub failures: Vec<String>,
    pub dry_run: bool,
}

#[derive(Debug)]
pub struct RepostOutcome {
    pub reversal_id: Option<String>,
    pub new_journal_id: Option<String>,
    pub dry_run: bool,
}

pub struct Remediation<'a> {
    ledger: &'a dyn RemoteLedger,
    policy: PolicyConfig,
    gl_mapping: GlMapping,
}

impl<'a> Remediation<'a> {
    pub fn new(ledger: &'a dyn RemoteLedger, policy: PolicyConfig, gl_mapping: GlMapping) -> Self {
        Self {
            ledger,
            policy,
            gl_mapping,
        }
    }

    /// Delete every remote record belonging to a settlement, removing
    /// tracking rows only as each remote delete succeeds. A record the
    /// remote no longer has counts as deleted.
    #[instrument(skip(self, tracking, history))]
    pub async fn reset(
        &self,
        tracking: &mut TrackingStore,
        history: &mut SettlementHistoryStore,
        settlement_id: &str,
        dry_run: bool,
    ) -> Result<ResetSummary, SyncError> {
        let mut summary = ResetSummary {
            dry_run,
            ..Default::default()
        };

        for record_type in [RecordType::Payment, RecordType::Invoice, RecordType::Journal] {
            let targets = self.collect_targets(tracking, settlement_id, record_type).await?;

            for action in targets {
                if dry_run {
                    info!(
                        record_type = %action.record_type,
                        remote_id = %action.remote_id,
                        identifier = %action.identifier,
                        "[DRY RUN] Would delete"
                    );
                    summary.planned.push(action);
                    continue;
                }

                match self.ledger.delete(record_type, &action.remote_id).await {
                    Ok(()) => {}
                    // Already gone remotely; still clear our row.
                    Err(SyncError::Validation { .. }) => {
                        warn!(remote_id = %action.remote_id, "Record already absent remotely");
                    }
                    Err(err) => {
                        summary
                            .failures
                            .push(format!("{} {}: {}", record_type, action.remote_id, err));
                        continue;
                    }
                }
                tracking.remove(settlement_id, record_type, &action.identifier)?;
                match record_type {
                    RecordType::Payment => summary.deleted_payments += 1,
                    RecordType::Invoice => summary.deleted_invoices += 1,
                    RecordType::Journal => summary.deleted_journals += 1,
                }
            }
        }

        if !dry_run && summary.failures.is_empty() {
            history.record_reset(settlement_id)?;
        }

        info!(
            payments = summary.deleted_payments,
            invoices = summary.deleted_invoices,
            journals = summary.deleted_journals,
            failures = summary.failures.len(),
            dry_run,
            "Reset complete"
        );
        Ok(summary)
    }

    /// Targets are the union of tracked rows and whatever the remote lists
    /// under the settlement reference, so a reset also clears records the
    /// tracking store lost.
    async fn collect_targets(
        &self,
        tracking: &TrackingStore,
        settlement_id: &str,
        record_type: RecordType,
    ) -> Result<Vec<PlannedAction>, SyncError> {
        let mut actions: Vec<PlannedAction> = tracking
            .for_settlement(settlement_id)
            .into_iter()
            .filter(|r| r.record_type == record_type)
            .filter_map(|r| {
                Some(PlannedAction {
                    record_type,
                    remote_id: r.zoho_id.clone()?,
                    identifier: r.local_identifier.clone(),
                })
            })
            .collect();

        let remote = self
            .ledger
            .list(record_type, &ListQuery::by_reference(settlement_id))
            .await?;
        for record in remote {
            if actions.iter().any(|a| a.remote_id == record.remote_id) {
                continue;
            }
            actions.push(PlannedAction {
                record_type,
                identifier: record
                    .number
                    .clone()
                    .unwrap_or_else(|| record.remote_id.clone()),
                remote_id: record.remote_id,
            });
        }
        Ok(actions)
    }

    /// Reverse a posted journal and post a corrected one.
    ///
    /// The reversal carries the `-REV1` reference so the original, the
    /// reversal, and the correction all stay visible in the remote ledger.
    /// The corrected journal is posted line by line under the original
    /// reference, bypassing the idempotency check on purpose: the point is
    /// to post again.
    #[instrument(skip(self, settlement, tracking, history), fields(settlement_id = %settlement.settlement_id))]
    pub async fn reverse_and_repost(
        &self,
        settlement: &LocalSettlement,
        tracking: &mut TrackingStore,
        history: &mut SettlementHistoryStore,
        dry_run: bool,
    ) -> Result<RepostOutcome, SyncError> {
        let id = &settlement.settlement_id;

        // The original journal must exist, otherwise there is nothing to
        // reverse and a plain sync is the right tool.
        let originals = self
            .ledger
            .list(RecordType::Journal, &ListQuery::by_reference(id))
            .await?;
        if originals.is_empty() {
            return Err(SyncError::TrackingDrift {
                identifier: id.clone(),
                message: "no remote journal to reverse".to_string(),
            });
        }

        let reversal = payloads::reversal_payload(
            settlement,
            &self.gl_mapping,
            self.policy.amount_tolerance,
        )?;
        let corrected = payloads::journal_payload(
            settlement,
            &self.gl_mapping,
            JournalMode::LineByLine,
            Some(self.policy.amount_tolerance),
        )?;

        if dry_run {
            info!("[DRY RUN] Would post reversal and corrected journal");
            return Ok(RepostOutcome {
                reversal_id: None,
                new_journal_id: None,
                dry_run: true,
            });
        }

        let reversal_id = self
            .ledger
            .post(RecordType::Journal, &reversal, &PostOptions::default())
            .await?
            .id;
        info!(reversal_id, "Reversal posted");

        let remote = self
            .ledger
            .post(RecordType::Journal, &corrected, &PostOptions::default())
            .await?;
        info!(journal_id = %remote.id, "Corrected journal posted");

        tracking.upsert(TrackedRecord {
            settlement_id: id.clone(),
            record_type: RecordType::Journal,
            local_identifier: id.clone(),
            zoho_id: Some(remote.id.clone()),
            zoho_number: remote.number,
            reference_number: id.clone(),
            status: RecordStatus::Posted,
            created_date: Utc::now(),
        })?;
        history.record_synced(id, &remote.id, settlement.deposit_date())?;

        Ok(RepostOutcome {
            reversal_id: Some(reversal_id),
            new_journal_id: Some(remote.id),
            dry_run: false,
        })
    }
}
