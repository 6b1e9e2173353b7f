use thiserror::Error;

/// Engine-wide error taxonomy.
///
/// The split matters for control flow: `RateLimited` is only surfaced once
/// the client's own retries are exhausted, `Validation` is never retried,
/// and `IdentityConflict` always requires an operator decision.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Rate limited after {attempts} attempts: {message}")]
    RateLimited { attempts: u32, message: String },

    #[error("Transient remote failure: {0}")]
    Transient(String),

    #[error("Remote rejected {entity}: {message}")]
    Validation { entity: String, message: String },

    #[error("Amount conflict for {identifier}: expected {expected}, remote has {actual}")]
    IdentityConflict {
        identifier: String,
        expected: String,
        actual: String,
    },

    #[error("Tracking drift for {identifier}: {message}")]
    TrackingDrift {
        identifier: String,
        message: String,
    },

    #[error("Payment references invoice {invoice_number} with no resolvable remote id")]
    UnresolvedInvoice { invoice_number: String },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Tracking store error: {0}")]
    Store(anyhow::Error),

    #[error("Configuration error: {0}")]
    Config(anyhow::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Store(anyhow::Error::new(err))
    }
}

impl SyncError {
    /// Whether the remote ledger client may retry the call that produced
    /// this error. Validation and conflict errors are structural and must
    /// never be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::RateLimited { .. } | SyncError::Transient(_) | SyncError::Http(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_is_retryable() {
        let err = SyncError::RateLimited {
            attempts: 3,
            message: "throttled".to_string(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn validation_is_not_retryable() {
        let err = SyncError::Validation {
            entity: "invoice AMZN1234567".to_string(),
            message: "unknown account id".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn conflict_message_preserves_amounts() {
        let err = SyncError::IdentityConflict {
            identifier: "AMZN1234567".to_string(),
            expected: "100.00".to_string(),
            actual: "100.02".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("100.00"));
        assert!(msg.contains("100.02"));
    }
}
