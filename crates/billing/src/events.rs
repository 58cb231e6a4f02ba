//! Billing Events Module
//!
//! Append-only audit trail of billing state changes. Events answer questions
//! such as "which bytes-month did this order charge for?" and "who settled it,
//! the webhook or the poller?".
//!
//! ## Event Types
//!
//! - Orders: created, paid, failed, expired
//! - Subscriptions: created
//! - Quota: upload rejected at the hard limit
//!
//! Settlement events are written only by the caller whose compare-and-set
//! moved the order out of PENDING, so each is recorded once.

use std::sync::Arc;

use pinvault_shared::{AccountId, BillingEventRecord, Order, OrderStatus, RecordStore, Subscription};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Types of billing events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingEventType {
    OrderCreated,
    OrderPaid,
    OrderFailed,
    OrderExpired,
    SubscriptionCreated,
    QuotaRejected,
}

impl BillingEventType {
    /// Event recorded when an order settles into `status`
    pub fn for_settlement(status: OrderStatus) -> Option<Self> {
        match status {
            OrderStatus::Paid => Some(BillingEventType::OrderPaid),
            OrderStatus::Failed => Some(BillingEventType::OrderFailed),
            OrderStatus::Expired => Some(BillingEventType::OrderExpired),
            OrderStatus::Pending => None,
        }
    }
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BillingEventType::OrderCreated => "ORDER_CREATED",
            BillingEventType::OrderPaid => "ORDER_PAID",
            BillingEventType::OrderFailed => "ORDER_FAILED",
            BillingEventType::OrderExpired => "ORDER_EXPIRED",
            BillingEventType::SubscriptionCreated => "SUBSCRIPTION_CREATED",
            BillingEventType::QuotaRejected => "QUOTA_REJECTED",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// End user request
    User,
    /// Scheduled job or service logic
    System,
    /// Payment provider webhook
    Webhook,
    /// Order status poller
    Poller,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::System => write!(f, "system"),
            ActorType::Webhook => write!(f, "webhook"),
            ActorType::Poller => write!(f, "poller"),
        }
    }
}

/// Builder for creating billing events
pub struct BillingEventBuilder {
    account_id: AccountId,
    event_type: BillingEventType,
    event_data: serde_json::Value,
    order_id: Option<pinvault_shared::OrderId>,
    provider_order_id: Option<String>,
    actor_type: ActorType,
}

impl BillingEventBuilder {
    /// Create a new event builder
    pub fn new(account_id: AccountId, event_type: BillingEventType) -> Self {
        Self {
            account_id,
            event_type,
            event_data: serde_json::json!({}),
            order_id: None,
            provider_order_id: None,
            actor_type: ActorType::System,
        }
    }

    /// Set the event data
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    /// Attach the local and provider ids of an order
    pub fn order(mut self, order: &Order) -> Self {
        self.order_id = Some(order.id);
        self.provider_order_id = Some(order.provider_order_id.clone());
        self
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }

    pub fn build(self) -> BillingEventRecord {
        BillingEventRecord {
            id: Uuid::new_v4(),
            account_id: self.account_id,
            event_type: self.event_type.to_string(),
            order_id: self.order_id,
            provider_order_id: self.provider_order_id,
            event_data: self.event_data,
            actor_type: self.actor_type.to_string(),
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Service for logging and querying billing events
#[derive(Clone)]
pub struct BillingEventLogger {
    store: Arc<dyn RecordStore>,
}

impl BillingEventLogger {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Log a billing event
    pub async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<Uuid> {
        let record = builder.build();
        let id = record.id;
        self.store.append_billing_event(record).await?;
        Ok(id)
    }

    /// Log an event where a write failure must not fail the surrounding operation
    pub async fn log_event_best_effort(&self, builder: BillingEventBuilder) {
        let event_type = builder.event_type;
        let account_id = builder.account_id;
        if let Err(e) = self.log_event(builder).await {
            tracing::warn!(
                account_id = %account_id,
                event_type = %event_type,
                error = %e,
                "Failed to record billing event"
            );
        }
    }

    /// Events for an account, oldest first
    pub async fn events_for_account(&self, account_id: AccountId) -> BillingResult<Vec<BillingEventRecord>> {
        Ok(self.store.list_billing_events(account_id).await?)
    }
}

/// Convenience functions for common event logging scenarios
impl BillingEventLogger {
    pub async fn log_order_created(&self, order: &Order, pinned_bytes: u64, actor_type: ActorType) {
        let builder = BillingEventBuilder::new(order.account_id, BillingEventType::OrderCreated)
            .order(order)
            .data(serde_json::json!({
                "amount_minor": order.amount_minor,
                "currency": order.currency,
                "period_start": order.period.start.to_string(),
                "period_end": order.period.end.to_string(),
                "pinned_bytes": pinned_bytes,
            }))
            .actor_type(actor_type);

        self.log_event_best_effort(builder).await;
    }

    /// Log an order leaving PENDING. No-op for a PENDING status.
    pub async fn log_order_settled(&self, order: &Order, actor_type: ActorType) {
        let Some(event_type) = BillingEventType::for_settlement(order.status) else {
            return;
        };

        let builder = BillingEventBuilder::new(order.account_id, event_type)
            .order(order)
            .data(serde_json::json!({
                "amount_minor": order.amount_minor,
                "currency": order.currency,
                "status": order.status.as_str(),
                "period_start": order.period.start.to_string(),
            }))
            .actor_type(actor_type);

        self.log_event_best_effort(builder).await;
    }

    pub async fn log_subscription_created(&self, subscription: &Subscription) {
        let builder = BillingEventBuilder::new(subscription.account_id, BillingEventType::SubscriptionCreated)
            .data(serde_json::json!({
                "billing_day": subscription.billing_day,
                "next_billing_at": subscription.next_billing_at.map(|d| d.to_string()),
            }));

        self.log_event_best_effort(builder).await;
    }

    pub async fn log_quota_rejected(&self, account_id: AccountId, used: u64, incoming: u64, limit: u64) {
        let builder = BillingEventBuilder::new(account_id, BillingEventType::QuotaRejected)
            .data(serde_json::json!({
                "used_bytes": used,
                "incoming_bytes": incoming,
                "limit_bytes": limit,
            }))
            .actor_type(ActorType::User);

        self.log_event_best_effort(builder).await;
    }
}
