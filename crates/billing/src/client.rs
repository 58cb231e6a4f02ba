//! Payment provider client
//!
//! [`PaymentProvider`] is the seam the order manager talks to. The production
//! implementation is [`CashfreeClient`], a thin reqwest wrapper over the
//! Cashfree Payment Gateway REST API.

use std::time::Duration;

use async_trait::async_trait;
use pinvault_shared::{Account, OrderStatus};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::webhooks::verify_signature;

pub const CASHFREE_SANDBOX_URL: &str = "https://sandbox.cashfree.com/pg";
pub const CASHFREE_PRODUCTION_URL: &str = "https://api.cashfree.com/pg";
pub const CASHFREE_API_VERSION: &str = "2023-08-01";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const FETCH_RETRIES: usize = 2;
const RETRY_BASE_DELAY_MS: u64 = 100;
const RETRY_MAX_DELAY: Duration = Duration::from_secs(2);

/// Customer contact details sent with each order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerDetails {
    pub customer_id: String,
    pub email: String,
    pub name: String,
    pub phone: String,
}

impl CustomerDetails {
    pub fn from_account(account: &Account, default_phone: &str) -> Self {
        Self {
            customer_id: account.id.0.simple().to_string(),
            email: account.email.clone(),
            name: account
                .display_name
                .clone()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| account.email.clone()),
            phone: default_phone.to_string(),
        }
    }
}

/// Order creation request in provider-neutral terms
#[derive(Debug, Clone, PartialEq)]
pub struct CreateOrderRequest {
    /// Locally generated id the provider will echo back in webhooks
    pub order_id: String,
    /// Major units, two decimals
    pub amount: f64,
    pub currency: String,
    pub customer: CustomerDetails,
    pub return_url: String,
    pub notify_url: String,
    pub expires_at: OffsetDateTime,
}

/// Provider-side order handle returned on creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderOrder {
    pub provider_order_id: String,
    pub payment_session_id: String,
    pub payment_link: Option<String>,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_order(&self, request: &CreateOrderRequest) -> BillingResult<ProviderOrder>;

    /// Current status of a provider order, mapped onto the local state machine
    async fn fetch_order_status(&self, provider_order_id: &str) -> BillingResult<OrderStatus>;

    /// Verify a webhook delivery. Any failure is reported as
    /// [`BillingError::WebhookVerificationFailed`] without detail.
    fn verify_webhook_signature(&self, signature: &str, raw_body: &[u8], timestamp: &str) -> BillingResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CashfreeEnvironment {
    Sandbox,
    Production,
}

impl CashfreeEnvironment {
    pub fn base_url(&self) -> &'static str {
        match self {
            CashfreeEnvironment::Sandbox => CASHFREE_SANDBOX_URL,
            CashfreeEnvironment::Production => CASHFREE_PRODUCTION_URL,
        }
    }
}

impl std::str::FromStr for CashfreeEnvironment {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sandbox" | "test" => Ok(CashfreeEnvironment::Sandbox),
            "production" | "prod" => Ok(CashfreeEnvironment::Production),
            other => Err(BillingError::ConfigurationInvalid(format!(
                "CASHFREE_ENV must be sandbox or production, got {}",
                other
            ))),
        }
    }
}

/// Configuration for the Cashfree client
#[derive(Debug, Clone)]
pub struct CashfreeConfig {
    pub app_id: String,
    pub secret_key: String,
    /// Key for webhook signatures; Cashfree signs with the client secret
    pub webhook_secret: String,
    pub base_url: String,
    pub api_version: String,
    pub webhook_tolerance: Duration,
}

impl CashfreeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("CASHFREE_SECRET_KEY")
            .map_err(|_| BillingError::ConfigurationInvalid("CASHFREE_SECRET_KEY not set".to_string()))?;
        let environment: CashfreeEnvironment = std::env::var("CASHFREE_ENV")
            .unwrap_or_else(|_| "sandbox".to_string())
            .parse()?;

        Ok(Self {
            app_id: std::env::var("CASHFREE_APP_ID")
                .map_err(|_| BillingError::ConfigurationInvalid("CASHFREE_APP_ID not set".to_string()))?,
            webhook_secret: std::env::var("CASHFREE_WEBHOOK_SECRET").unwrap_or_else(|_| secret_key.clone()),
            secret_key,
            base_url: std::env::var("CASHFREE_BASE_URL")
                .unwrap_or_else(|_| environment.base_url().to_string()),
            api_version: std::env::var("CASHFREE_API_VERSION")
                .unwrap_or_else(|_| CASHFREE_API_VERSION.to_string()),
            webhook_tolerance: Duration::from_secs(
                std::env::var("WEBHOOK_TOLERANCE_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .filter(|v| *v > 0)
                    .unwrap_or(crate::config::DEFAULT_WEBHOOK_TOLERANCE_SECS),
            ),
        })
    }
}

// Cashfree wire types (PG API 2023-08-01)

#[derive(Debug, Serialize)]
struct CashfreeCustomer<'a> {
    customer_id: &'a str,
    customer_email: &'a str,
    customer_name: &'a str,
    customer_phone: &'a str,
}

#[derive(Debug, Serialize)]
struct CashfreeOrderMeta<'a> {
    return_url: &'a str,
    notify_url: &'a str,
}

#[derive(Debug, Serialize)]
struct CashfreeCreateOrder<'a> {
    order_id: &'a str,
    order_amount: f64,
    order_currency: &'a str,
    customer_details: CashfreeCustomer<'a>,
    order_meta: CashfreeOrderMeta<'a>,
    order_expiry_time: String,
}

#[derive(Debug, Deserialize)]
struct CashfreeOrderResponse {
    order_id: String,
    #[serde(default)]
    payment_session_id: Option<String>,
    #[serde(default)]
    payment_link: Option<String>,
    #[serde(default)]
    order_status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CashfreeErrorResponse {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

/// Map a Cashfree `order_status` onto the local order state machine
pub fn map_order_status(status: &str) -> BillingResult<OrderStatus> {
    match status {
        "ACTIVE" => Ok(OrderStatus::Pending),
        "PAID" => Ok(OrderStatus::Paid),
        "EXPIRED" => Ok(OrderStatus::Expired),
        "TERMINATED" | "TERMINATION_REQUESTED" => Ok(OrderStatus::Failed),
        other => Err(BillingError::PaymentProvider(format!(
            "unknown order status: {}",
            other
        ))),
    }
}

/// Cashfree Payment Gateway client
#[derive(Clone)]
pub struct CashfreeClient {
    http: reqwest::Client,
    config: CashfreeConfig,
}

impl CashfreeClient {
    pub fn new(config: CashfreeConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BillingError::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    /// Create a new client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Self::new(CashfreeConfig::from_env()?)
    }

    pub fn config(&self) -> &CashfreeConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("x-client-id", &self.config.app_id)
            .header("x-client-secret", &self.config.secret_key)
            .header("x-api-version", &self.config.api_version)
            .header("accept", "application/json")
    }

    async fn error_from_response(response: reqwest::Response) -> BillingError {
        let status = response.status();
        let detail = match response.json::<CashfreeErrorResponse>().await {
            Ok(body) => format!(
                "{} ({})",
                body.message.unwrap_or_else(|| "no message".to_string()),
                body.code.unwrap_or_else(|| "no code".to_string())
            ),
            Err(_) => "unreadable error body".to_string(),
        };
        BillingError::PaymentProvider(format!("HTTP {}: {}", status.as_u16(), detail))
    }

    /// One status fetch. `Err` carries whether the failure is worth retrying.
    async fn fetch_order_status_once(&self, provider_order_id: &str) -> Result<OrderStatus, (bool, BillingError)> {
        let response = self
            .authed(self.http.get(self.url(&format!("/orders/{}", provider_order_id))))
            .send()
            .await
            .map_err(|e| (true, BillingError::from(e)))?;

        let status = response.status();
        if !status.is_success() {
            let transient = status.is_server_error() || status.as_u16() == 429;
            return Err((transient, Self::error_from_response(response).await));
        }

        let body: CashfreeOrderResponse = response
            .json()
            .await
            .map_err(|e| (false, BillingError::PaymentProvider(format!("invalid order response: {}", e))))?;

        let order_status = body.order_status.ok_or_else(|| {
            (
                false,
                BillingError::PaymentProvider(format!("order {} has no status", body.order_id)),
            )
        })?;
        map_order_status(&order_status).map_err(|e| (false, e))
    }
}

#[async_trait]
impl PaymentProvider for CashfreeClient {
    async fn create_order(&self, request: &CreateOrderRequest) -> BillingResult<ProviderOrder> {
        let expiry = request
            .expires_at
            .format(&Rfc3339)
            .map_err(|e| BillingError::Internal(format!("failed to format expiry: {}", e)))?;
        let return_url = request.return_url.replace("{order_id}", &request.order_id);

        let body = CashfreeCreateOrder {
            order_id: &request.order_id,
            order_amount: request.amount,
            order_currency: &request.currency,
            customer_details: CashfreeCustomer {
                customer_id: &request.customer.customer_id,
                customer_email: &request.customer.email,
                customer_name: &request.customer.name,
                customer_phone: &request.customer.phone,
            },
            order_meta: CashfreeOrderMeta {
                return_url: &return_url,
                notify_url: &request.notify_url,
            },
            order_expiry_time: expiry,
        };

        // Not retried: a second POST with the same order_id is rejected as a duplicate
        let response = self
            .authed(self.http.post(self.url("/orders")))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let err = Self::error_from_response(response).await;
            tracing::error!(order_id = %request.order_id, error = %err, "Cashfree order creation failed");
            return Err(err);
        }

        let order: CashfreeOrderResponse = response
            .json()
            .await
            .map_err(|e| BillingError::PaymentProvider(format!("invalid order response: {}", e)))?;

        let payment_session_id = order.payment_session_id.ok_or_else(|| {
            BillingError::PaymentProvider(format!("order {} has no payment_session_id", order.order_id))
        })?;

        tracing::info!(
            order_id = %order.order_id,
            amount = request.amount,
            currency = %request.currency,
            "Cashfree order created"
        );

        Ok(ProviderOrder {
            provider_order_id: order.order_id,
            payment_session_id,
            payment_link: order.payment_link,
        })
    }

    async fn fetch_order_status(&self, provider_order_id: &str) -> BillingResult<OrderStatus> {
        use tokio_retry::strategy::{jitter, ExponentialBackoff};
        use tokio_retry::Retry;

        let retry_strategy = ExponentialBackoff::from_millis(RETRY_BASE_DELAY_MS)
            .max_delay(RETRY_MAX_DELAY)
            .take(FETCH_RETRIES)
            .map(jitter);

        Retry::start(retry_strategy, || async {
            match self.fetch_order_status_once(provider_order_id).await {
                Ok(status) => Ok(Ok(status)),
                Err((true, e)) => {
                    tracing::debug!(
                        order_id = %provider_order_id,
                        error = %e,
                        "Transient error fetching order status - will retry"
                    );
                    Err(Err(e))
                }
                // Wrapped in Ok to stop retrying
                Err((false, e)) => Ok(Err(e)),
            }
        })
        .await
        .unwrap_or_else(|e| e)
    }

    fn verify_webhook_signature(&self, signature: &str, raw_body: &[u8], timestamp: &str) -> BillingResult<()> {
        verify_signature(
            &self.config.webhook_secret,
            signature,
            timestamp,
            raw_body,
            OffsetDateTime::now_utc(),
            self.config.webhook_tolerance,
        )
    }
}
