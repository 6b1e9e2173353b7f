//! Remote ledger seam.
//!
//! The orchestrator, decision layer, and remediation tools talk to the
//! remote system only through [`RemoteLedger`], so tests can substitute a
//! stub and assert on call counts.

use crate::models::RecordType;
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use sync_core::error::SyncError;

/// Conflict-avoidance options for a remote write.
///
/// Suppressing auto-numbering is explicit because the remote default
/// silently invents its own identifiers, which breaks the local-to-remote
/// mapping.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostOptions {
    pub ignore_auto_number: bool,
}

/// Query parameters for a paginated read. The client follows pagination to
/// exhaustion; callers always receive the full result set.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub reference_number: Option<String>,
    pub date_start: Option<NaiveDate>,
    pub date_end: Option<NaiveDate>,
    pub customer_id: Option<String>,
}

impl ListQuery {
    pub fn by_reference(reference_number: &str) -> Self {
        Self {
            reference_number: Some(reference_number.to_string()),
            ..Default::default()
        }
    }
}

/// Identifier assigned by the remote system on a successful write.
#[derive(Debug, Clone)]
pub struct RemoteId {
    pub id: String,
    /// Human-readable number (e.g. invoice number), when the record kind
    /// carries one.
    pub number: Option<String>,
}

/// A record as the remote ledger reports it.
#[derive(Debug, Clone)]
pub struct RemoteRecord {
    pub record_type: RecordType,
    pub remote_id: String,
    pub number: Option<String>,
    pub reference_number: Option<String>,
    pub date: Option<NaiveDate>,
    pub total: Option<Decimal>,
    pub balance: Option<Decimal>,
    pub customer_id: Option<String>,
}

/// Authenticated, rate-limit-aware transport to the external ledger.
#[async_trait]
pub trait RemoteLedger: Send + Sync {
    /// Create a record; returns the remote-assigned identifier.
    async fn post(
        &self,
        record_type: RecordType,
        payload: &serde_json::Value,
        options: &PostOptions,
    ) -> Result<RemoteId, SyncError>;

    /// List records matching the query, fully materialized across pages.
    async fn list(
        &self,
        record_type: RecordType,
        query: &ListQuery,
    ) -> Result<Vec<RemoteRecord>, SyncError>;

    /// Fetch a single record by remote id.
    async fn get(
        &self,
        record_type: RecordType,
        remote_id: &str,
    ) -> Result<Option<RemoteRecord>, SyncError>;

    /// Delete a record by remote id.
    async fn delete(&self, record_type: RecordType, remote_id: &str) -> Result<(), SyncError>;

    /// Resolve a customer id by display name.
    async fn find_customer(&self, name: &str) -> Result<Option<String>, SyncError>;

    /// Resolve an item id by SKU.
    async fn find_item(&self, sku: &str) -> Result<Option<String>, SyncError>;
}
