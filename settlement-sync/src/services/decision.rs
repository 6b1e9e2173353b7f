//! Idempotency decision layer.
//!
//! Answers one question per candidate record: post it, skip it, adopt an
//! existing remote copy, or stop and report a conflict. The tracking store
//! is consulted first; the remote ledger is only queried when the store
//! cannot answer on its own (no row, stale PENDING, or ERROR).

use crate::config::PolicyConfig;
use crate::models::{RecordStatus, RecordType, TrackedRecord};
use crate::services::ledger::{ListQuery, RemoteLedger, RemoteRecord};
use chrono::Utc;
use rust_decimal::Decimal;
use sync_core::error::SyncError;
use tracing::{debug, info, instrument, warn};

/// A local record the orchestrator wants posted.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub settlement_id: String,
    pub record_type: RecordType,
    pub local_identifier: String,
    pub reference_number: String,
    /// Expected total, when the record kind carries one worth checking.
    pub expected_amount: Option<Decimal>,
}

/// Outcome of the idempotency check for one candidate.
#[derive(Debug, Clone)]
pub enum Decision {
    /// Already posted and tracked; do nothing.
    Skip { remote_id: String },
    /// No posted copy exists anywhere; safe to create.
    PostNew,
    /// A matching remote copy exists that the tracking store had lost.
    /// The caller must repair the store before moving on.
    AdoptRemote { remote: RemoteRecord },
    /// A remote copy exists under the same identity but with a different
    /// amount. Never auto-resolved.
    Conflict {
        remote_id: String,
        expected: Decimal,
        actual: Decimal,
    },
}

pub struct DecisionEngine {
    policy: PolicyConfig,
}

impl DecisionEngine {
    pub fn new(policy: PolicyConfig) -> Self {
        Self { policy }
    }

    /// Decide what to do with `candidate` given its tracking row (if any).
    ///
    /// A POSTED row is trusted without a remote round trip. A PENDING row
    /// younger than the staleness window means a previous attempt already
    /// failed visibly, so posting again is safe. Everything else falls
    /// through to a remote lookup by reference number.
    #[instrument(skip(self, ledger, tracked), fields(settlement_id = %candidate.settlement_id, record_type = %candidate.record_type, local_identifier = %candidate.local_identifier))]
    pub async fn decide(
        &self,
        ledger: &dyn RemoteLedger,
        candidate: &Candidate,
        tracked: Option<&TrackedRecord>,
    ) -> Result<Decision, SyncError> {
        match tracked {
            Some(row) if row.is_posted() => {
                debug!(zoho_id = ?row.zoho_id, "Already posted, skipping");
                return Ok(Decision::Skip {
                    remote_id: row.zoho_id.clone().unwrap_or_default(),
                });
            }
            Some(row) if row.status == RecordStatus::Pending && !self.is_stale(row) => {
                debug!("Fresh PENDING row, posting");
                return Ok(Decision::PostNew);
            }
            Some(row) => {
                warn!(
                    status = row.status.as_str(),
                    "Tracking row cannot be trusted, verifying against remote"
                );
            }
            None => {
                debug!("No tracking row, verifying against remote");
            }
        }

        self.verify_remote(ledger, candidate).await
    }

    fn is_stale(&self, row: &TrackedRecord) -> bool {
        let age = Utc::now().signed_duration_since(row.created_date);
        age.to_std()
            .map(|age| age > self.policy.pending_stale_after)
            .unwrap_or(false)
    }

    /// Remote fallback: list by reference number and look for a copy of
    /// this exact record.
    async fn verify_remote(
        &self,
        ledger: &dyn RemoteLedger,
        candidate: &Candidate,
    ) -> Result<Decision, SyncError> {
        let query = ListQuery::by_reference(&candidate.reference_number);
        let remote = ledger.list(candidate.record_type, &query).await?;

        let found = remote.into_iter().find(|r| match candidate.record_type {
            // Invoices are identified by their number within the reference.
            RecordType::Invoice => r.number.as_deref() == Some(candidate.local_identifier.as_str()),
            RecordType::Journal | RecordType::Payment => true,
        });

        let Some(remote) = found else {
            return Ok(Decision::PostNew);
        };

        if let (Some(expected), Some(actual)) = (candidate.expected_amount, remote.total) {
            if (expected - actual).abs() > self.policy.amount_tolerance {
                warn!(%expected, %actual, remote_id = %remote.remote_id, "Amount conflict with remote copy");
                return Ok(Decision::Conflict {
                    remote_id: remote.remote_id,
                    expected,
                    actual,
                });
            }
        }

        info!(remote_id = %remote.remote_id, "Found untracked remote copy, adopting");
        Ok(Decision::AdoptRemote { remote })
    }
}
