//! Payment webhook verification and reconciliation
//!
//! Cashfree signs each delivery as
//! `base64(HMAC-SHA256(secret, timestamp || raw_body))` and sends the result in
//! `x-webhook-signature` with the millisecond timestamp in
//! `x-webhook-timestamp`.
//!
//! Nothing about a rejected delivery is revealed to the sender: every
//! verification failure produces the same acknowledgement. Details go to the
//! operator log only.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use hmac::{Hmac, Mac};
use pinvault_shared::{OrderId, OrderStatus, OrderTransition};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::events::ActorType;
use crate::orders::PaymentOrderManager;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";
pub const TIMESTAMP_HEADER: &str = "x-webhook-timestamp";

/// Signature Cashfree would send for this timestamp and body
pub fn compute_signature(secret: &str, timestamp: &str, raw_body: &[u8]) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Internal("HMAC initialization failed".to_string()))?;
    mac.update(timestamp.as_bytes());
    mac.update(raw_body);
    Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

/// Verify signature and timestamp freshness.
///
/// Every failure maps to [`BillingError::WebhookVerificationFailed`]; the
/// specific cause is only logged.
pub fn verify_signature(
    secret: &str,
    signature: &str,
    timestamp: &str,
    raw_body: &[u8],
    now: OffsetDateTime,
    tolerance: Duration,
) -> BillingResult<()> {
    let sent_ms: i128 = match timestamp.trim().parse::<i64>() {
        Ok(ms) => i128::from(ms),
        Err(_) => {
            tracing::warn!("Webhook rejected: malformed timestamp");
            return Err(BillingError::WebhookVerificationFailed);
        }
    };

    let now_ms = now.unix_timestamp_nanos() / 1_000_000;
    if (now_ms - sent_ms).abs() > tolerance.as_millis() as i128 {
        tracing::warn!(skew_ms = %(now_ms - sent_ms), "Webhook rejected: timestamp outside tolerance");
        return Err(BillingError::WebhookVerificationFailed);
    }

    let expected = compute_signature(secret, timestamp, raw_body)?;
    if !constant_time_compare(signature.trim(), &expected) {
        tracing::warn!("Webhook rejected: signature mismatch");
        return Err(BillingError::WebhookVerificationFailed);
    }

    Ok(())
}

fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        // Same amount of work as a real comparison
        let dummy = vec![0u8; a.len()];
        let _ = a.as_bytes().ct_eq(&dummy);
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

// Payload subset needed for reconciliation

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(rename = "type")]
    event_type: String,
    data: WebhookData,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    order: WebhookOrder,
}

#[derive(Debug, Deserialize)]
struct WebhookOrder {
    order_id: String,
}

/// Webhook types the reconciler understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    PaymentSuccess,
    PaymentFailed,
    /// Customer closed checkout; the session can still be used
    UserDropped,
    Other(String),
}

impl WebhookEvent {
    pub fn parse(event_type: &str) -> Self {
        match event_type {
            "PAYMENT_SUCCESS_WEBHOOK" => WebhookEvent::PaymentSuccess,
            "PAYMENT_FAILED_WEBHOOK" => WebhookEvent::PaymentFailed,
            "PAYMENT_USER_DROPPED_WEBHOOK" => WebhookEvent::UserDropped,
            other => WebhookEvent::Other(other.to_string()),
        }
    }

    /// Target status, if this event settles an order
    pub fn target_status(&self) -> Option<OrderStatus> {
        match self {
            WebhookEvent::PaymentSuccess => Some(OrderStatus::Paid),
            WebhookEvent::PaymentFailed => Some(OrderStatus::Failed),
            WebhookEvent::UserDropped | WebhookEvent::Other(_) => None,
        }
    }
}

/// What processing a delivery did (internal; never sent to the provider)
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    /// This delivery moved the order out of PENDING
    Applied { order_id: OrderId, status: OrderStatus },
    /// The order had already settled; nothing changed
    Duplicate { order_id: OrderId, status: OrderStatus },
    /// Verified but nothing to do (unknown order, non-settling event)
    Ignored,
    /// Failed verification; no state was touched
    Rejected,
    /// Verified but a local failure prevented processing; the provider should redeliver
    Failed,
}

/// Acknowledgement returned to the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookAck {
    Accepted,
    Rejected,
    RetryLater,
}

impl WebhookAck {
    pub fn status_code(&self) -> u16 {
        match self {
            WebhookAck::Accepted => 200,
            WebhookAck::Rejected => 400,
            WebhookAck::RetryLater => 503,
        }
    }
}

impl WebhookOutcome {
    pub fn ack(&self) -> WebhookAck {
        match self {
            WebhookOutcome::Applied { .. } | WebhookOutcome::Duplicate { .. } | WebhookOutcome::Ignored => {
                WebhookAck::Accepted
            }
            WebhookOutcome::Rejected => WebhookAck::Rejected,
            WebhookOutcome::Failed => WebhookAck::RetryLater,
        }
    }
}

#[derive(Clone)]
pub struct WebhookReconciler {
    manager: Arc<PaymentOrderManager>,
}

impl WebhookReconciler {
    pub fn new(manager: Arc<PaymentOrderManager>) -> Self {
        Self { manager }
    }

    /// Verify and apply one delivery. Headers are passed as received.
    pub async fn handle(
        &self,
        signature: Option<&str>,
        timestamp: Option<&str>,
        raw_body: &[u8],
    ) -> WebhookOutcome {
        let (Some(signature), Some(timestamp)) = (signature, timestamp) else {
            tracing::warn!("Webhook rejected: missing signature headers");
            return WebhookOutcome::Rejected;
        };

        if self
            .manager
            .provider()
            .verify_webhook_signature(signature, raw_body, timestamp)
            .is_err()
        {
            return WebhookOutcome::Rejected;
        }

        let payload: WebhookPayload = match serde_json::from_slice(raw_body) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "Verified webhook has an unrecognized payload");
                return WebhookOutcome::Ignored;
            }
        };

        match self.reconcile(payload).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "Failed to process webhook");
                WebhookOutcome::Failed
            }
        }
    }

    async fn reconcile(&self, payload: WebhookPayload) -> BillingResult<WebhookOutcome> {
        let event = WebhookEvent::parse(&payload.event_type);
        let provider_order_id = payload.data.order.order_id;

        let Some(status) = event.target_status() else {
            tracing::info!(
                provider_order_id = %provider_order_id,
                event_type = %payload.event_type,
                "Webhook does not settle the order"
            );
            return Ok(WebhookOutcome::Ignored);
        };

        let Some(order) = self.manager.find_by_provider_id(&provider_order_id).await? else {
            tracing::warn!(provider_order_id = %provider_order_id, "Webhook for unknown order");
            return Ok(WebhookOutcome::Ignored);
        };

        let outcome = match self.manager.apply_status(order.id, status, ActorType::Webhook).await? {
            OrderTransition::Applied(order) => WebhookOutcome::Applied {
                order_id: order.id,
                status: order.status,
            },
            OrderTransition::Unchanged(order) => WebhookOutcome::Duplicate {
                order_id: order.id,
                status: order.status,
            },
        };
        Ok(outcome)
    }
}
