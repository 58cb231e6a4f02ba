//! pinvault billing engine
//!
//! Usage-based monthly billing for pinned storage:
//!
//! - `calculator`, `cycle`: pure charge and billing-date arithmetic
//! - `usage`, `quota`: byte accounting and the hard upload limit
//! - `client`: the payment provider seam and its Cashfree implementation
//! - `orders`, `webhooks`, `poller`: order lifecycle and reconciliation
//! - `access`: whether an account may use paid services right now
//! - `events`: append-only billing audit log

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

use std::sync::Arc;

use pinvault_shared::{Account, AccountId, Order, RecordStore, Subscription};
use time::{Date, OffsetDateTime};

pub mod access;
pub mod calculator;
pub mod client;
pub mod config;
pub mod cycle;
pub mod error;
pub mod events;
pub mod orders;
pub mod poller;
pub mod quota;
pub mod usage;
pub mod webhooks;

pub use access::{AccessDecision, AccessGate};
pub use calculator::{BillingCalculator, Charge};
pub use client::{
    CashfreeClient, CashfreeConfig, CashfreeEnvironment, CreateOrderRequest, CustomerDetails,
    PaymentProvider, ProviderOrder,
};
pub use config::BillingConfig;
pub use error::{BillingError, BillingResult};
pub use events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
pub use orders::{EnsureOrder, PaymentOrderManager};
pub use poller::{OrderPoller, PollHandle, PollOutcome};
pub use quota::{Admission, QuotaExceeded, QuotaGate};
pub use usage::{UsageMeter, UsageSummary};
pub use webhooks::{WebhookAck, WebhookOutcome, WebhookReconciler};

/// Result of one billing check for one account
#[derive(Debug, Clone, PartialEq)]
pub enum BillingCheckOutcome {
    /// Usage is within the free tier
    NoCharge { charge: Charge },
    /// The current period is already settled
    AlreadyPaid(Order),
    /// An order awaits payment; `created` is false when it already existed
    Pending { order: Order, created: bool },
}

impl BillingCheckOutcome {
    pub fn order(&self) -> Option<&Order> {
        match self {
            BillingCheckOutcome::NoCharge { .. } => None,
            BillingCheckOutcome::AlreadyPaid(order) => Some(order),
            BillingCheckOutcome::Pending { order, .. } => Some(order),
        }
    }
}

/// Main billing service that combines all billing operations
pub struct BillingService {
    store: Arc<dyn RecordStore>,
    pub config: BillingConfig,
    pub calculator: BillingCalculator,
    pub meter: UsageMeter,
    pub quota: QuotaGate,
    pub orders: Arc<PaymentOrderManager>,
    pub access: AccessGate,
    pub webhooks: WebhookReconciler,
    pub poller: OrderPoller,
    pub events: BillingEventLogger,
}

impl BillingService {
    pub fn new(store: Arc<dyn RecordStore>, provider: Arc<dyn PaymentProvider>, config: BillingConfig) -> Self {
        let config = config.sanitized();
        let calculator = BillingCalculator::new(config.clone());
        let events = BillingEventLogger::new(store.clone());
        let meter = UsageMeter::new(store.clone());
        let orders = Arc::new(PaymentOrderManager::new(
            store.clone(),
            provider,
            events.clone(),
            config.clone(),
        ));

        Self {
            quota: QuotaGate::new(store.clone(), events.clone()),
            access: AccessGate::new(store.clone(), meter.clone(), calculator.clone()),
            webhooks: WebhookReconciler::new(orders.clone()),
            poller: OrderPoller::from_config(orders.clone(), &config),
            store,
            config,
            calculator,
            meter,
            orders,
            events,
        }
    }

    /// Compute the account's charge for the period containing `today` and make
    /// sure an order exists for it when payment is due.
    ///
    /// Safe to call repeatedly: an open order is returned rather than duplicated.
    pub async fn run_billing_check(
        &self,
        account: &Account,
        customer: &CustomerDetails,
        today: Date,
    ) -> BillingResult<BillingCheckOutcome> {
        let pinned_bytes = self.meter.pinned_bytes(account.id).await?;
        let charge = self.calculator.charge_for(pinned_bytes);
        if !charge.is_due() {
            tracing::debug!(account_id = %account.id, pinned_bytes, "Usage within free tier");
            return Ok(BillingCheckOutcome::NoCharge { charge });
        }

        let subscription = self.ensure_subscription(account, today).await?;
        let period = cycle::billing_period(subscription.billing_day, today)?;

        let outcome = match self
            .orders
            .ensure_order_for_period(account.id, customer, &charge, period)
            .await?
        {
            EnsureOrder::AlreadyPaid(order) => BillingCheckOutcome::AlreadyPaid(order),
            EnsureOrder::Existing(order) => BillingCheckOutcome::Pending { order, created: false },
            EnsureOrder::Created(order) => BillingCheckOutcome::Pending { order, created: true },
        };

        let next = cycle::next_billing_date(subscription.billing_day, today)?;
        if subscription.next_billing_at != Some(next) {
            self.store.update_next_billing(account.id, next).await?;
        }

        Ok(outcome)
    }

    async fn ensure_subscription(&self, account: &Account, today: Date) -> BillingResult<Subscription> {
        if let Some(existing) = self.store.get_subscription(account.id).await? {
            return Ok(existing);
        }

        let billing_day = cycle::billing_day(account.created_at);
        let candidate = Subscription {
            account_id: account.id,
            billing_day,
            next_billing_at: Some(cycle::next_billing_date(billing_day, today)?),
            created_at: OffsetDateTime::now_utc(),
        };

        let (subscription, created) = self.store.create_subscription_if_absent(candidate).await?;
        if created {
            tracing::info!(
                account_id = %account.id,
                billing_day = subscription.billing_day,
                "Subscription created"
            );
            self.events.log_subscription_created(&subscription).await;
        }
        Ok(subscription)
    }

    pub async fn check_access(&self, account_id: AccountId, today: Date) -> BillingResult<AccessDecision> {
        self.access.check_access(account_id, today).await
    }

    pub async fn usage_summary(&self, account_id: AccountId) -> BillingResult<UsageSummary> {
        self.meter.summary(account_id, &self.calculator).await
    }

    /// Verify and apply a provider webhook. The outcome's `ack()` is all the caller should reveal.
    pub async fn handle_webhook(
        &self,
        signature: Option<&str>,
        timestamp: Option<&str>,
        raw_body: &[u8],
    ) -> WebhookOutcome {
        self.webhooks.handle(signature, timestamp, raw_body).await
    }

    /// Start polling the provider for an order the user just opened checkout for
    pub fn spawn_poller(&self, order: &Order) -> PollHandle {
        self.poller.spawn(order.id)
    }
}
