//! Configuration for the settlement sync engine.

use anyhow::anyhow;
use regex::Regex;
use rust_decimal::Decimal;
use secrecy::Secret;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use sync_core::error::SyncError;
use sync_core::retry::RetryConfig;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub log_level: String,
    pub zoho: ZohoConfig,
    pub policy: PolicyConfig,
    pub storage: StorageConfig,
    pub retry: RetryConfig,
}

/// Zoho Books API access.
#[derive(Debug, Clone)]
pub struct ZohoConfig {
    pub api_endpoint: String,
    pub accounts_server: String,
    pub organization_id: String,
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub refresh_token: Secret<String>,
}

/// Tunable correctness policy. The tolerance and invoice-number format are
/// inferred from observed remote behavior, so they are configuration rather
/// than constants.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Amounts within this of each other are considered equal.
    pub amount_tolerance: Decimal,
    /// Pattern a locally assigned invoice number must match remotely.
    pub invoice_number_pattern: Regex,
    /// A PENDING tracking row older than this is treated as stale and
    /// re-verified against the remote ledger.
    pub pending_stale_after: Duration,
    /// Minimum spacing between remote requests.
    pub min_request_interval: Duration,
    /// Cooldown applied after a rate-limit response.
    pub rate_limit_cooldown: Duration,
    /// Pacing delay between settlements in a batch run.
    pub settlement_pacing: Duration,
}

/// Where the engine keeps its durable files.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory of derived settlement files (one subdirectory per id).
    pub data_dir: PathBuf,
    pub tracking_file: PathBuf,
    pub history_file: PathBuf,
    pub transaction_log: PathBuf,
    pub reports_dir: PathBuf,
    /// JSON map of GL account name to Zoho account id.
    pub gl_mapping_file: PathBuf,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_required(key: &str) -> Result<String, SyncError> {
    env::var(key).map_err(|_| SyncError::Config(anyhow!("{} is required", key)))
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, SyncError> {
        Ok(Self {
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            zoho: ZohoConfig::from_env()?,
            policy: PolicyConfig::from_env()?,
            storage: StorageConfig::from_env(),
            retry: RetryConfig::with_max_retries(env_or("ZOHO_MAX_RETRIES", 3)),
        })
    }
}

impl ZohoConfig {
    pub fn from_env() -> Result<Self, SyncError> {
        Ok(Self {
            api_endpoint: env::var("ZOHO_API_ENDPOINT")
                .unwrap_or_else(|_| "https://www.zohoapis.com/books/v3".to_string()),
            accounts_server: env::var("ZOHO_ACCOUNTS_SERVER")
                .unwrap_or_else(|_| "https://accounts.zoho.com".to_string()),
            organization_id: env_required("ZOHO_ORGANIZATION_ID")?,
            client_id: env_required("ZOHO_CLIENT_ID")?,
            client_secret: Secret::new(env_required("ZOHO_CLIENT_SECRET")?),
            refresh_token: Secret::new(env_required("ZOHO_REFRESH_TOKEN")?),
        })
    }
}

impl PolicyConfig {
    pub fn from_env() -> Result<Self, SyncError> {
        let tolerance = env::var("AMOUNT_TOLERANCE").unwrap_or_else(|_| "0.01".to_string());
        let pattern =
            env::var("INVOICE_NUMBER_PATTERN").unwrap_or_else(|_| r"^AMZN\d{7}$".to_string());

        Ok(Self {
            amount_tolerance: Decimal::from_str(&tolerance)
                .map_err(|e| SyncError::Config(anyhow!("Invalid AMOUNT_TOLERANCE: {}", e)))?,
            invoice_number_pattern: Regex::new(&pattern)
                .map_err(|e| SyncError::Config(anyhow!("Invalid INVOICE_NUMBER_PATTERN: {}", e)))?,
            pending_stale_after: Duration::from_secs(
                env_or::<u64>("PENDING_STALE_AFTER_HOURS", 24) * 3600,
            ),
            min_request_interval: Duration::from_millis(env_or("MIN_REQUEST_INTERVAL_MS", 500)),
            rate_limit_cooldown: Duration::from_secs(env_or("RATE_LIMIT_COOLDOWN_SECS", 30)),
            settlement_pacing: Duration::from_millis(env_or("SETTLEMENT_PACING_MS", 2000)),
        })
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            amount_tolerance: Decimal::from_str("0.01").unwrap_or_default(),
            invoice_number_pattern: Regex::new(r"^AMZN\d{7}$").expect("valid default pattern"),
            pending_stale_after: Duration::from_secs(24 * 3600),
            min_request_interval: Duration::from_millis(500),
            rate_limit_cooldown: Duration::from_secs(30),
            settlement_pacing: Duration::from_millis(2000),
        }
    }
}

impl StorageConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: env::var("SETTLEMENT_DATA_DIR")
                .unwrap_or_else(|_| "outputs".to_string())
                .into(),
            tracking_file: env::var("TRACKING_FILE")
                .unwrap_or_else(|_| "data/zoho_tracking.csv".to_string())
                .into(),
            history_file: env::var("HISTORY_FILE")
                .unwrap_or_else(|_| "data/settlement_history.csv".to_string())
                .into(),
            transaction_log: env::var("TRANSACTION_LOG")
                .unwrap_or_else(|_| "logs/zoho_api_transactions.log".to_string())
                .into(),
            reports_dir: env::var("REPORTS_DIR")
                .unwrap_or_else(|_| "reports".to_string())
                .into(),
            gl_mapping_file: env::var("GL_MAPPING_FILE")
                .unwrap_or_else(|_| "config/gl_mapping.json".to_string())
                .into(),
        }
    }
}
