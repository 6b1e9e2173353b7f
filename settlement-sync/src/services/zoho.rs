//! Zoho Books API client.
//!
//! Implements the [`RemoteLedger`] seam over Zoho's REST API: OAuth
//! refresh-token auth, minimum inter-request spacing, cooldown plus capped
//! retries on throttling, transparent pagination, and an append to the
//! transaction log for every call attempt.

use crate::config::{PolicyConfig, ZohoConfig};
use crate::models::RecordType;
use crate::services::ledger::{ListQuery, PostOptions, RemoteId, RemoteLedger, RemoteRecord};
use crate::services::txlog::{LogEntry, TransactionLog};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use reqwest::StatusCode;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde_json::Value;
use sync_core::error::SyncError;
use sync_core::retry::{retry_call, RetryConfig};
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

struct ClientState {
    access_token: Option<String>,
    token_expires_at: Option<Instant>,
    /// Earliest moment the next request may be issued. Pushed forward by
    /// the minimum spacing after every request and by the cooldown after a
    /// rate-limit response.
    next_request_at: Option<Instant>,
}

pub struct ZohoClient {
    http: reqwest::Client,
    config: ZohoConfig,
    policy: PolicyConfig,
    retry: RetryConfig,
    txlog: TransactionLog,
    state: Mutex<ClientState>,
}

impl ZohoClient {
    pub fn new(
        config: ZohoConfig,
        policy: PolicyConfig,
        retry: RetryConfig,
        txlog: TransactionLog,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            policy,
            retry,
            txlog,
            state: Mutex::new(ClientState {
                access_token: None,
                token_expires_at: None,
                next_request_at: None,
            }),
        }
    }

    /// Wait out the pacing window, then reserve the next slot.
    async fn pace(&self) {
        let wait_until = {
            let mut state = self.state.lock().await;
            let at = state.next_request_at.unwrap_or_else(Instant::now);
            state.next_request_at = Some(at.max(Instant::now()) + self.policy.min_request_interval);
            at
        };
        if wait_until > Instant::now() {
            sleep_until(wait_until).await;
        }
    }

    async fn apply_cooldown(&self) {
        let mut state = self.state.lock().await;
        let resume = Instant::now() + self.policy.rate_limit_cooldown;
        state.next_request_at = Some(state.next_request_at.map_or(resume, |at| at.max(resume)));
    }

    /// Get a usable access token, refreshing through the accounts server
    /// when missing or expired.
    async fn access_token(&self) -> Result<String, SyncError> {
        {
            let state = self.state.lock().await;
            if let (Some(token), Some(expires_at)) = (&state.access_token, state.token_expires_at) {
                if Instant::now() < expires_at {
                    return Ok(token.clone());
                }
            }
        }

        let token_url = format!("{}/oauth/v2/token", self.config.accounts_server);
        let params = [
            ("refresh_token", self.config.refresh_token.expose_secret().as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.expose_secret().as_str()),
            ("grant_type", "refresh_token"),
        ];

        let response = self.http.post(&token_url).form(&params).send().await?;
        let body: Value = response.json().await?;

        let token = body["access_token"]
            .as_str()
            .ok_or_else(|| SyncError::Auth(format!("Token refresh failed: {}", body)))?
            .to_string();
        // Refresh one minute early to avoid racing expiry mid-batch.
        let expires_in = body["expires_in"].as_u64().unwrap_or(3600).saturating_sub(60);

        let mut state = self.state.lock().await;
        state.access_token = Some(token.clone());
        state.token_expires_at = Some(Instant::now() + std::time::Duration::from_secs(expires_in));
        debug!("Zoho access token refreshed");

        Ok(token)
    }

    /// One request attempt. Appends the outcome to the transaction log
    /// before returning, so the log stays complete across retries.
    async fn attempt(
        &self,
        method: &str,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
        type_label: &str,
        reference: &str,
    ) -> Result<Value, SyncError> {
        self.pace().await;
        let token = self.access_token().await?;

        let url = format!("{}/{}", self.config.api_endpoint, path.trim_start_matches('/'));
        let mut request = match method {
            "GET" => self.http.get(&url),
            "POST" => self.http.post(&url),
            "DELETE" => self.http.delete(&url),
            other => {
                return Err(SyncError::Internal(anyhow::anyhow!(
                    "unsupported method: {}",
                    other
                )))
            }
        };
        request = request
            .header("Authorization", format!("Zoho-oauthtoken {}", token))
            .query(&[("organization_id", self.config.organization_id.as_str())])
            .query(query);
        if let Some(body) = body {
            request = request.json(body);
        }

        let (status, result) = match request.send().await {
            Ok(response) => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                let result: Value = serde_json::from_str(&text).unwrap_or_else(|_| {
                    let preview: String = text.chars().take(200).collect();
                    serde_json::json!({
                        "code": status.as_u16(),
                        "message": format!("HTTP {}: {}", status.as_u16(), preview),
                    })
                });
                (status, result)
            }
            Err(err) => {
                self.log_attempt(method, path, body, type_label, reference, false, 0, None);
                return Err(SyncError::Http(err));
            }
        };

        let api_code = result["code"].as_i64().unwrap_or(-1);
        let success = status.is_success() && api_code == 0;
        self.log_attempt(
            method,
            path,
            body,
            type_label,
            reference,
            success,
            status.as_u16(),
            extract_remote_id(&result),
        );

        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!(path, "Zoho rate limit hit, entering cooldown");
            self.apply_cooldown().await;
            return Err(SyncError::RateLimited {
                attempts: 1,
                message: result["message"].as_str().unwrap_or("too many requests").to_string(),
            });
        }
        if status.is_server_error() {
            return Err(SyncError::Transient(format!(
                "HTTP {} from {}",
                status.as_u16(),
                path
            )));
        }
        if !success {
            // Raw remote message preserved verbatim for diagnosis.
            return Err(SyncError::Validation {
                entity: format!("{} {}", method, path),
                message: result["message"].as_str().unwrap_or(&result.to_string()).to_string(),
            });
        }

        Ok(result)
    }

    fn log_attempt(
        &self,
        method: &str,
        path: &str,
        body: Option<&Value>,
        type_label: &str,
        reference: &str,
        success: bool,
        http_code: u16,
        remote_id: Option<String>,
    ) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            method: method.to_string(),
            record_type: type_label.to_string(),
            endpoint: path.to_string(),
            reference: reference.to_string(),
            amount: body.and_then(payload_amount),
            success,
            http_code,
            remote_id,
        };
        // A failed log append must not fail the business call.
        if let Err(err) = self.txlog.append(&entry) {
            warn!(error = %err, "failed to append transaction log entry");
        }
    }

    async fn request(
        &self,
        method: &str,
        path: &str,
        query: Vec<(String, String)>,
        body: Option<Value>,
        type_label: &str,
        reference: &str,
    ) -> Result<Value, SyncError> {
        let operation = format!("{} {}", method, path);
        let result = retry_call(&self.retry, &operation, SyncError::is_retryable, || {
            self.attempt(method, path, &query, body.as_ref(), type_label, reference)
        })
        .await;

        match result {
            Err(SyncError::RateLimited { message, .. }) => Err(SyncError::RateLimited {
                attempts: self.retry.max_retries + 1,
                message,
            }),
            other => other,
        }
    }
}

#[async_trait]
impl RemoteLedger for ZohoClient {
    async fn post(
        &self,
        record_type: RecordType,
        payload: &Value,
        options: &PostOptions,
    ) -> Result<RemoteId, SyncError> {
        let mut query = Vec::new();
        if options.ignore_auto_number {
            query.push(("ignore_auto_number_generation".to_string(), "true".to_string()));
        }
        let reference = payload_reference(payload);

        let result = self
            .request(
                "POST",
                record_type.endpoint(),
                query,
                Some(payload.clone()),
                record_type.as_str(),
                &reference,
            )
            .await?;

        let record = &result[singular_key(record_type)];
        let id = record[id_key(record_type)]
            .as_str()
            .ok_or_else(|| SyncError::Validation {
                entity: record_type.to_string(),
                message: format!("missing id in response: {}", result),
            })?
            .to_string();
        let number = record[number_key(record_type)].as_str().map(str::to_string);

        info!(record_type = %record_type, remote_id = %id, reference = %reference, "Record created in Zoho");
        Ok(RemoteId { id, number })
    }

    async fn list(
        &self,
        record_type: RecordType,
        query: &ListQuery,
    ) -> Result<Vec<RemoteRecord>, SyncError> {
        let mut all = Vec::new();
        let mut page: u32 = 1;

        loop {
            let mut params = vec![
                ("page".to_string(), page.to_string()),
                ("per_page".to_string(), "200".to_string()),
            ];
            if let Some(reference) = &query.reference_number {
                params.push(("reference_number".to_string(), reference.clone()));
            }
            if let Some(start) = query.date_start {
                params.push(("date_start".to_string(), start.to_string()));
            }
            if let Some(end) = query.date_end {
                params.push(("date_end".to_string(), end.to_string()));
            }
            if let Some(customer) = &query.customer_id {
                params.push(("customer_id".to_string(), customer.clone()));
            }

            let reference = query.reference_number.as_deref().unwrap_or("N/A");
            let result = self
                .request(
                    "GET",
                    record_type.endpoint(),
                    params,
                    None,
                    record_type.as_str(),
                    reference,
                )
                .await?;

            if let Some(items) = result[list_key(record_type)].as_array() {
                all.extend(items.iter().map(|v| parse_record(record_type, v)));
            }

            if !result["page_context"]["has_more_page"].as_bool().unwrap_or(false) {
                break;
            }
            page += 1;
        }

        Ok(all)
    }

    async fn get(
        &self,
        record_type: RecordType,
        remote_id: &str,
    ) -> Result<Option<RemoteRecord>, SyncError> {
        let path = format!("{}/{}", record_type.endpoint(), remote_id);
        match self
            .request("GET", &path, Vec::new(), None, record_type.as_str(), remote_id)
            .await
        {
            Ok(result) => Ok(result
                .get(singular_key(record_type))
                .map(|v| parse_record(record_type, v))),
            Err(SyncError::Validation { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn delete(&self, record_type: RecordType, remote_id: &str) -> Result<(), SyncError> {
        let path = format!("{}/{}", record_type.endpoint(), remote_id);
        self.request("DELETE", &path, Vec::new(), None, record_type.as_str(), remote_id)
            .await?;
        info!(record_type = %record_type, remote_id, "Record deleted in Zoho");
        Ok(())
    }

    async fn find_customer(&self, name: &str) -> Result<Option<String>, SyncError> {
        let params = vec![("contact_name".to_string(), name.to_string())];
        let result = self
            .request("GET", "contacts", params, None, "CONTACT", name)
            .await?;
        Ok(result["contacts"]
            .as_array()
            .and_then(|contacts| contacts.first())
            .and_then(|c| c["contact_id"].as_str())
            .map(str::to_string))
    }

    async fn find_item(&self, sku: &str) -> Result<Option<String>, SyncError> {
        let params = vec![("sku".to_string(), sku.to_string())];
        let result = self.request("GET", "items", params, None, "ITEM", sku).await?;
        if let Some(id) = result["items"]
            .as_array()
            .and_then(|items| items.first())
            .and_then(|i| i["item_id"].as_str())
        {
            return Ok(Some(id.to_string()));
        }

        // Fallback in case the SKU filter is unsupported; prefer an exact
        // SKU match among search hits.
        let params = vec![("search_text".to_string(), sku.to_string())];
        let result = self.request("GET", "items", params, None, "ITEM", sku).await?;
        let items = match result["items"].as_array() {
            Some(items) => items,
            None => return Ok(None),
        };
        for item in items {
            if item["sku"].as_str().map(str::trim) == Some(sku.trim()) {
                return Ok(item["item_id"].as_str().map(str::to_string));
            }
        }
        Ok(items.first().and_then(|i| i["item_id"].as_str()).map(str::to_string))
    }
}

fn singular_key(record_type: RecordType) -> &'static str {
    match record_type {
        RecordType::Journal => "journal",
        RecordType::Invoice => "invoice",
        RecordType::Payment => "payment",
    }
}

fn list_key(record_type: RecordType) -> &'static str {
    match record_type {
        RecordType::Journal => "journals",
        RecordType::Invoice => "invoices",
        RecordType::Payment => "customerpayments",
    }
}

fn id_key(record_type: RecordType) -> &'static str {
    match record_type {
        RecordType::Journal => "journal_id",
        RecordType::Invoice => "invoice_id",
        RecordType::Payment => "payment_id",
    }
}

fn number_key(record_type: RecordType) -> &'static str {
    match record_type {
        RecordType::Journal => "entry_number",
        RecordType::Invoice => "invoice_number",
        RecordType::Payment => "payment_number",
    }
}

/// Remote id of a created record, whichever singular envelope the
/// response nests it under.
fn extract_remote_id(result: &Value) -> Option<String> {
    for record_type in [RecordType::Journal, RecordType::Invoice, RecordType::Payment] {
        if let Some(id) = result[singular_key(record_type)][id_key(record_type)].as_str() {
            return Some(id.to_string());
        }
    }
    None
}

fn parse_record(record_type: RecordType, v: &Value) -> RemoteRecord {
    let date = v["date"]
        .as_str()
        .or_else(|| v["journal_date"].as_str())
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());

    let total = json_decimal(&v["total"]);
    // Some list payloads omit the balance; derive it from recorded
    // payments when possible.
    let balance = json_decimal(&v["balance"])
        .or_else(|| json_decimal(&v["balance_amount"]))
        .or_else(|| {
            let payments = json_decimal(&v["payments"])?;
            Some(total? - payments)
        });

    RemoteRecord {
        record_type,
        remote_id: v[id_key(record_type)].as_str().unwrap_or_default().to_string(),
        number: v[number_key(record_type)].as_str().map(str::to_string),
        reference_number: v["reference_number"].as_str().map(str::to_string),
        date,
        total,
        balance,
        customer_id: v["customer_id"].as_str().map(str::to_string),
    }
}

fn json_decimal(v: &Value) -> Option<Decimal> {
    match v {
        Value::Number(n) => n.as_f64().and_then(Decimal::from_f64),
        Value::String(s) if !s.is_empty() => s.parse().ok(),
        _ => None,
    }
}

fn payload_reference(payload: &Value) -> String {
    for key in ["reference_number", "invoice_number", "payment_number"] {
        if let Some(s) = payload[key].as_str() {
            return s.to_string();
        }
    }
    "N/A".to_string()
}

/// Best-effort amount for the transaction log: net of journal line items,
/// or the payload's total/amount field.
fn payload_amount(payload: &Value) -> Option<String> {
    if let Some(lines) = payload["line_items"].as_array() {
        let mut total = 0.0f64;
        let mut saw_directional = false;
        for item in lines {
            let amount = item["amount"].as_f64().unwrap_or(0.0);
            match item["debit_or_credit"].as_str() {
                Some("debit") => {
                    total += amount;
                    saw_directional = true;
                }
                Some("credit") => {
                    total -= amount;
                    saw_directional = true;
                }
                _ => {}
            }
        }
        if saw_directional && total != 0.0 {
            return Some(format!("${:.2}", total.abs()));
        }
    }
    payload["total"]
        .as_f64()
        .or_else(|| payload["amount"].as_f64())
        .map(|t| format!("${:.2}", t))
}
