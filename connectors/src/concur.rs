//! SAP Concur expense API client and password-grant token endpoint.

use crate::http::{
    bool_field, build_client, ensure_success, error_detail, f64_field, i64_field,
    is_transient_status, read_json, str_field, transport_error,
};
use async_trait::async_trait;
use expense_core::{
    backend::validate_id, clamp_limit, ExpenseBackend, ExpenseEntry, ExpenseError, ExpenseType,
    PaymentType, Report, Result, ServiceToken, TokenEndpoint, TokenGrant,
};
use reqwest::{header::ACCEPT, Client, StatusCode};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "https://integration.api.concursolutions.com";
pub const API_VERSION: &str = "v3.0";

/// Connection settings for the expense backend.
#[derive(Clone)]
pub struct ConcurConfig {
    pub base_url: String,
    /// Defaults to `<base_url>/oauth2/v0/token`
    pub token_url: Option<String>,
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
    pub request_timeout: Duration,
}

impl ConcurConfig {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token_url: None,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            username: username.into(),
            password: password.into(),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn token_url(&self) -> String {
        self.token_url
            .clone()
            .unwrap_or_else(|| format!("{}/oauth2/v0/token", self.base()))
    }

    fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api/{API_VERSION}/{path}", self.base())
    }
}

impl fmt::Debug for ConcurConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurConfig")
            .field("base_url", &self.base_url)
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// reqwest implementation of [`ExpenseBackend`] and [`TokenEndpoint`].
#[derive(Clone)]
pub struct ConcurClient {
    http: Client,
    config: ConcurConfig,
}

impl ConcurClient {
    pub fn new(config: ConcurConfig) -> Result<Self> {
        let http = build_client(config.request_timeout)?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ConcurConfig {
        &self.config
    }

    async fn get(&self, token: &ServiceToken, url: &str, query: &[(&str, String)]) -> Result<Value> {
        debug!(url, "Backend GET");
        let resp = self
            .http
            .get(url)
            .bearer_auth(token.secret())
            .header(ACCEPT, "application/json")
            .query(query)
            .send()
            .await
            .map_err(transport_error)?;
        read_json(ensure_success(resp).await?).await
    }
}

fn items(v: &Value) -> &[Value] {
    v.get("Items")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn parse_report(v: &Value) -> Report {
    Report {
        id: str_field(v, "ID").unwrap_or_default(),
        name: str_field(v, "Name"),
        purpose: str_field(v, "Purpose"),
        business_purpose: str_field(v, "BusinessPurpose"),
        total: f64_field(v, "Total"),
        currency_code: str_field(v, "CurrencyCode"),
        submission_date: str_field(v, "SubmitDate"),
        approval_status: str_field(v, "ApprovalStatusName"),
        workflow_step: str_field(v, "WorkflowStepName"),
        owner_name: str_field(v, "OwnerName"),
        created_date: str_field(v, "CreateDate"),
        last_modified_date: str_field(v, "LastModifiedDate"),
        country: str_field(v, "Country"),
        policy_id: str_field(v, "PolicyID"),
        report_version: str_field(v, "ReportVersion"),
    }
}

fn parse_entry(v: &Value) -> ExpenseEntry {
    ExpenseEntry {
        id: str_field(v, "ID").unwrap_or_default(),
        report_id: str_field(v, "ReportID"),
        expense_type: str_field(v, "ExpenseTypeName"),
        transaction_amount: f64_field(v, "TransactionAmount"),
        transaction_currency_code: str_field(v, "TransactionCurrencyCode"),
        transaction_date: str_field(v, "TransactionDate"),
        business_purpose: str_field(v, "BusinessPurpose"),
        vendor_description: str_field(v, "VendorDescription"),
        city_name: str_field(v, "LocationName"),
        country_code: str_field(v, "CountryCode"),
        payment_type: str_field(v, "PaymentTypeName"),
        receipt_required: bool_field(v, "ReceiptRequired"),
        has_receipt: bool_field(v, "HasReceipt"),
    }
}

fn parse_v4_expense_type(v: &Value) -> ExpenseType {
    ExpenseType {
        code: str_field(v, "expenseCode"),
        name: str_field(v, "name"),
        category: str_field(v, "expenseCategoryCode"),
        expense_type_id: str_field(v, "expenseTypeId"),
    }
}

fn parse_v3_expense_type(v: &Value) -> ExpenseType {
    ExpenseType {
        code: str_field(v, "Code"),
        name: str_field(v, "Name"),
        category: str_field(v, "CategoryCode"),
        expense_type_id: str_field(v, "ID"),
    }
}

fn parse_payment_type(v: &Value) -> PaymentType {
    PaymentType {
        id: str_field(v, "ID"),
        code: str_field(v, "Code"),
        name: str_field(v, "Name"),
    }
}

#[async_trait]
impl ExpenseBackend for ConcurClient {
    async fn list_reports(&self, token: &ServiceToken, limit: u32) -> Result<Vec<Report>> {
        let limit = clamp_limit(limit);
        let body = self
            .get(
                token,
                &self.config.api_url("expense/reports"),
                &[("limit", limit.to_string())],
            )
            .await?;
        Ok(items(&body)
            .iter()
            .take(limit as usize)
            .map(parse_report)
            .collect())
    }

    async fn get_report(&self, token: &ServiceToken, report_id: &str) -> Result<Report> {
        validate_id("report_id", report_id)?;
        let url = self
            .config
            .api_url(&format!("expense/reports/{}", report_id.trim()));
        let body = self.get(token, &url, &[]).await?;
        Ok(parse_report(&body))
    }

    async fn check_connection(&self, token: &ServiceToken) -> Result<bool> {
        let resp = self
            .http
            .get(self.config.api_url("expense/reports"))
            .bearer_auth(token.secret())
            .header(ACCEPT, "application/json")
            .query(&[("limit", "1")])
            .send()
            .await
            .map_err(transport_error)?;

        match resp.status() {
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => Ok(false),
            _ => ensure_success(resp).await.map(|_| true),
        }
    }

    async fn list_expenses(
        &self,
        token: &ServiceToken,
        report_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ExpenseEntry>> {
        validate_id("report_id", report_id)?;
        let limit = clamp_limit(limit);
        let mut query = vec![
            ("reportID", report_id.trim().to_string()),
            ("limit", limit.to_string()),
        ];
        // The entries endpoint rejects an explicit zero offset
        if offset > 0 {
            query.push(("offset", offset.to_string()));
        }
        let body = self
            .get(token, &self.config.api_url("expense/entries"), &query)
            .await?;
        Ok(items(&body)
            .iter()
            .take(limit as usize)
            .map(parse_entry)
            .collect())
    }

    async fn get_expense(&self, token: &ServiceToken, expense_id: &str) -> Result<ExpenseEntry> {
        validate_id("expense_id", expense_id)?;
        let url = self
            .config
            .api_url(&format!("expense/entries/{}", expense_id.trim()));
        let body = self.get(token, &url, &[]).await?;
        Ok(parse_entry(&body))
    }

    async fn get_expense_types(&self, token: &ServiceToken) -> Result<Vec<ExpenseType>> {
        let v4_url = format!("{}/expenseconfig/v4/expensetypes", self.config.base());
        match self.get(token, &v4_url, &[]).await {
            Ok(body) => Ok(body
                .as_array()
                .map(|types| types.iter().map(parse_v4_expense_type).collect())
                .unwrap_or_default()),
            // A rejected token is handled by the caller, not by the fallback
            Err(ExpenseError::Unauthorized) => Err(ExpenseError::Unauthorized),
            Err(e) => {
                warn!(error = %e, "v4 expense types unavailable, falling back to v3");
                let body = self
                    .get(token, &self.config.api_url("expense/expensetypes"), &[])
                    .await?;
                Ok(items(&body).iter().map(parse_v3_expense_type).collect())
            }
        }
    }

    async fn get_payment_types(&self, token: &ServiceToken) -> Result<Vec<PaymentType>> {
        let body = self
            .get(token, &self.config.api_url("expense/paymenttypes"), &[])
            .await?;
        Ok(items(&body).iter().map(parse_payment_type).collect())
    }
}

#[async_trait]
impl TokenEndpoint for ConcurClient {
    async fn password_grant(&self) -> Result<TokenGrant> {
        let form = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("grant_type", "password"),
            ("username", self.config.username.as_str()),
            ("password", self.config.password.as_str()),
        ];
        let resp = self
            .http
            .post(self.config.token_url())
            .header(ACCEPT, "application/json")
            .form(&form)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(if is_transient_status(status) {
                ExpenseError::transient(format!("token endpoint returned {status}"))
            } else {
                ExpenseError::Credential(format!(
                    "token endpoint rejected the grant ({status}): {}",
                    error_detail(&body)
                ))
            });
        }

        let body = read_json(resp).await?;
        let access_token = str_field(&body, "access_token").ok_or_else(|| {
            ExpenseError::Credential("token response has no access_token".to_string())
        })?;
        Ok(TokenGrant {
            access_token,
            refresh_token: str_field(&body, "refresh_token"),
            id_token: None,
            expires_in: i64_field(&body, "expires_in"),
        })
    }
}
