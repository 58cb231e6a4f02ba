//! Payment order lifecycle
//!
//! ```text
//! ensure_order_for_period ──► provider.create_order ──► PENDING
//!                                                         │
//!                      webhook / poller / reconciliation  │ compare-and-set
//!                                                         ▼
//!                                              PAID | FAILED | EXPIRED
//! ```
//!
//! At most one PENDING order exists per account and billing period. Callers
//! in this process are serialized per account; the store's conditional insert
//! covers other processes.

use std::collections::HashMap;
use std::sync::Arc;

use pinvault_shared::{
    AccountId, BillingPeriod, Order, OrderId, OrderInsert, OrderStatus, OrderTransition, RecordStore,
};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::calculator::Charge;
use crate::client::{CreateOrderRequest, CustomerDetails, PaymentProvider};
use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventLogger};

/// Result of asking for the order covering a billing period
#[derive(Debug, Clone, PartialEq)]
pub enum EnsureOrder {
    /// A new order was created with the provider and persisted
    Created(Order),
    /// A PENDING order already covered the period
    Existing(Order),
    /// The period has already been paid
    AlreadyPaid(Order),
}

impl EnsureOrder {
    pub fn order(&self) -> &Order {
        match self {
            EnsureOrder::Created(order) | EnsureOrder::Existing(order) | EnsureOrder::AlreadyPaid(order) => order,
        }
    }

    pub fn into_order(self) -> Order {
        match self {
            EnsureOrder::Created(order) | EnsureOrder::Existing(order) | EnsureOrder::AlreadyPaid(order) => order,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, EnsureOrder::Created(_))
    }
}

pub struct PaymentOrderManager {
    store: Arc<dyn RecordStore>,
    provider: Arc<dyn PaymentProvider>,
    events: BillingEventLogger,
    config: BillingConfig,
    account_locks: Mutex<HashMap<AccountId, Arc<Mutex<()>>>>,
}

impl PaymentOrderManager {
    pub fn new(
        store: Arc<dyn RecordStore>,
        provider: Arc<dyn PaymentProvider>,
        events: BillingEventLogger,
        config: BillingConfig,
    ) -> Self {
        Self {
            store,
            provider,
            events,
            config,
            account_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn provider(&self) -> &Arc<dyn PaymentProvider> {
        &self.provider
    }

    async fn account_lock(&self, account_id: AccountId) -> Arc<Mutex<()>> {
        let mut locks = self.account_locks.lock().await;
        locks.entry(account_id).or_default().clone()
    }

    /// Drop the caller's handle and forget the lock once nobody else holds it
    async fn release_account_lock(&self, account_id: AccountId, lock: Arc<Mutex<()>>) {
        let mut locks = self.account_locks.lock().await;
        drop(lock);
        if locks.get(&account_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&account_id);
        }
    }

    #[cfg(test)]
    async fn tracked_locks(&self) -> usize {
        self.account_locks.lock().await.len()
    }

    /// Return the order covering `period`, creating one with the provider if none is open.
    ///
    /// A FAILED or EXPIRED order for the period does not block a new one. If the
    /// provider call fails nothing is persisted.
    pub async fn ensure_order_for_period(
        &self,
        account_id: AccountId,
        customer: &CustomerDetails,
        charge: &Charge,
        period: BillingPeriod,
    ) -> BillingResult<EnsureOrder> {
        if !charge.is_due() {
            return Err(BillingError::InvalidInput(
                "an order requires a positive charge".to_string(),
            ));
        }

        let lock = self.account_lock(account_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.ensure_order_locked(account_id, customer, charge, period).await
        };
        self.release_account_lock(account_id, lock).await;
        result
    }

    async fn ensure_order_locked(
        &self,
        account_id: AccountId,
        customer: &CustomerDetails,
        charge: &Charge,
        period: BillingPeriod,
    ) -> BillingResult<EnsureOrder> {
        if let Some(latest) = self.store.latest_order_for_period(account_id, period.start).await? {
            match latest.status {
                OrderStatus::Pending => {
                    tracing::debug!(
                        account_id = %account_id,
                        order_id = %latest.id,
                        "Reusing pending order for period"
                    );
                    return Ok(EnsureOrder::Existing(latest));
                }
                OrderStatus::Paid => return Ok(EnsureOrder::AlreadyPaid(latest)),
                OrderStatus::Failed | OrderStatus::Expired => {
                    tracing::info!(
                        account_id = %account_id,
                        previous_order_id = %latest.id,
                        previous_status = %latest.status,
                        "Previous order for period did not complete, creating a new one"
                    );
                }
            }
        }

        let now = OffsetDateTime::now_utc();
        let request = CreateOrderRequest {
            order_id: format!("order_{}", Uuid::new_v4().simple()),
            amount: charge.amount,
            currency: charge.currency.clone(),
            customer: customer.clone(),
            return_url: self.config.return_url.clone(),
            notify_url: self.config.notify_url.clone(),
            expires_at: now + time::Duration::days(i64::from(self.config.billing_cycle_days)),
        };

        let provider_order = match self.provider.create_order(&request).await {
            Ok(order) => order,
            Err(e) => {
                tracing::error!(
                    account_id = %account_id,
                    amount_minor = charge.amount_minor,
                    error = %e,
                    "Payment provider order creation failed"
                );
                return Err(if matches!(e, BillingError::PaymentProvider(_)) {
                    e
                } else {
                    BillingError::PaymentProvider(e.to_string())
                });
            }
        };

        let order = Order {
            id: OrderId::new(),
            account_id,
            amount_minor: charge.amount_minor,
            currency: charge.currency.clone(),
            status: OrderStatus::Pending,
            provider_order_id: provider_order.provider_order_id,
            payment_session_id: provider_order.payment_session_id,
            payment_link: provider_order.payment_link,
            period,
            created_at: now,
            updated_at: now,
            settled_at: None,
        };

        match self.store.insert_order_if_no_pending(order).await? {
            OrderInsert::Inserted(order) => {
                tracing::info!(
                    account_id = %account_id,
                    order_id = %order.id,
                    provider_order_id = %order.provider_order_id,
                    amount_minor = order.amount_minor,
                    currency = %order.currency,
                    period = %order.period,
                    "Payment order created"
                );
                self.events
                    .log_order_created(&order, charge.pinned_bytes, ActorType::System)
                    .await;
                Ok(EnsureOrder::Created(order))
            }
            OrderInsert::Existing(existing) => {
                // Another process won; the provider order we just made expires unused
                tracing::warn!(
                    account_id = %account_id,
                    order_id = %existing.id,
                    orphaned_provider_order_id = %request.order_id,
                    "Concurrent order creation for period, keeping existing order"
                );
                Ok(EnsureOrder::Existing(existing))
            }
        }
    }

    pub async fn get_order(&self, order_id: OrderId) -> BillingResult<Option<Order>> {
        Ok(self.store.get_order(order_id).await?)
    }

    pub async fn find_by_provider_id(&self, provider_order_id: &str) -> BillingResult<Option<Order>> {
        Ok(self.store.get_order_by_provider_id(provider_order_id).await?)
    }

    /// Most recent order for the period starting on `period_start`
    pub async fn order_for_period(&self, account_id: AccountId, period_start: time::Date) -> BillingResult<Option<Order>> {
        Ok(self.store.latest_order_for_period(account_id, period_start).await?)
    }

    pub async fn pending_orders(&self) -> BillingResult<Vec<Order>> {
        Ok(self.store.list_pending_orders().await?)
    }

    /// Move a PENDING order to `status`.
    ///
    /// Idempotent: an order that already left PENDING is returned unchanged and
    /// no event is written. Only the caller that wins the compare-and-set
    /// records the settlement.
    pub async fn apply_status(
        &self,
        order_id: OrderId,
        status: OrderStatus,
        actor: ActorType,
    ) -> BillingResult<OrderTransition> {
        if status == OrderStatus::Pending {
            let current = self
                .store
                .get_order(order_id)
                .await?
                .ok_or_else(|| BillingError::NotFound(format!("order {}", order_id)))?;
            return Ok(OrderTransition::Unchanged(current));
        }

        let transition = self.store.transition_order(order_id, status).await?;
        match &transition {
            OrderTransition::Applied(order) => {
                tracing::info!(
                    account_id = %order.account_id,
                    order_id = %order.id,
                    provider_order_id = %order.provider_order_id,
                    status = %order.status,
                    actor = %actor,
                    "Payment order settled"
                );
                self.events.log_order_settled(order, actor).await;
            }
            OrderTransition::Unchanged(order) if order.status != status => {
                tracing::warn!(
                    order_id = %order.id,
                    current = %order.status,
                    reported = %status,
                    actor = %actor,
                    "Ignoring status report for already settled order"
                );
            }
            OrderTransition::Unchanged(order) => {
                tracing::debug!(order_id = %order.id, status = %order.status, "Order already settled");
            }
        }
        Ok(transition)
    }

    /// Fetch the provider's view of a PENDING order and apply it
    pub async fn refresh_from_provider(&self, order: &Order, actor: ActorType) -> BillingResult<OrderTransition> {
        if order.status.is_terminal() {
            return Ok(OrderTransition::Unchanged(order.clone()));
        }
        let status = self.provider.fetch_order_status(&order.provider_order_id).await?;
        self.apply_status(order.id, status, actor).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::calculator::BillingCalculator;
    use crate::client::ProviderOrder;
    use async_trait::async_trait;
    use pinvault_shared::{InMemoryRecordStore, GIB};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use time::macros::date;

    /// Scriptable provider: statuses are returned in order, the last one repeats
    pub(crate) struct FakeProvider {
        pub creates: AtomicUsize,
        pub fetches: AtomicUsize,
        pub fail_create: std::sync::atomic::AtomicBool,
        pub statuses: std::sync::Mutex<Vec<OrderStatus>>,
    }

    impl FakeProvider {
        pub fn new() -> Self {
            Self {
                creates: AtomicUsize::new(0),
                fetches: AtomicUsize::new(0),
                fail_create: std::sync::atomic::AtomicBool::new(false),
                statuses: std::sync::Mutex::new(vec![OrderStatus::Pending]),
            }
        }

        pub fn with_statuses(statuses: Vec<OrderStatus>) -> Self {
            let provider = Self::new();
            *provider.statuses.lock().unwrap() = statuses;
            provider
        }
    }

    #[async_trait]
    impl PaymentProvider for FakeProvider {
        async fn create_order(&self, request: &CreateOrderRequest) -> BillingResult<ProviderOrder> {
            // Yield so concurrent callers interleave
            tokio::task::yield_now().await;
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(BillingError::PaymentProvider("HTTP 503: unavailable".to_string()));
            }
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(ProviderOrder {
                provider_order_id: request.order_id.clone(),
                payment_session_id: format!("session_{}", request.order_id),
                payment_link: Some(format!("https://pay.example.com/{}", request.order_id)),
            })
        }

        async fn fetch_order_status(&self, _provider_order_id: &str) -> BillingResult<OrderStatus> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let mut statuses = self.statuses.lock().unwrap();
            if statuses.len() > 1 {
                Ok(statuses.remove(0))
            } else {
                Ok(statuses[0])
            }
        }

        fn verify_webhook_signature(&self, _signature: &str, _raw_body: &[u8], _timestamp: &str) -> BillingResult<()> {
            Ok(())
        }
    }

    pub(crate) fn customer() -> CustomerDetails {
        CustomerDetails {
            customer_id: "cust_1".to_string(),
            email: "user@example.com".to_string(),
            name: "User".to_string(),
            phone: "9999999999".to_string(),
        }
    }

    pub(crate) fn period() -> BillingPeriod {
        BillingPeriod {
            start: date!(2025-01-15),
            end: date!(2025-02-15),
        }
    }

    fn setup(provider: Arc<FakeProvider>) -> (Arc<InMemoryRecordStore>, Arc<PaymentOrderManager>) {
        let store = Arc::new(InMemoryRecordStore::new());
        let manager = PaymentOrderManager::new(
            store.clone(),
            provider,
            BillingEventLogger::new(store.clone()),
            BillingConfig::default(),
        );
        (store, Arc::new(manager))
    }

    fn due_charge() -> Charge {
        BillingCalculator::new(BillingConfig::default()).charge_for(6 * GIB)
    }

    #[tokio::test]
    async fn test_ensure_order_is_idempotent() {
        let provider = Arc::new(FakeProvider::new());
        let (_store, manager) = setup(provider.clone());
        let account_id = AccountId::new();

        let first = manager
            .ensure_order_for_period(account_id, &customer(), &due_charge(), period())
            .await
            .unwrap();
        let second = manager
            .ensure_order_for_period(account_id, &customer(), &due_charge(), period())
            .await
            .unwrap();

        assert!(first.was_created());
        assert!(matches!(second, EnsureOrder::Existing(_)));
        assert_eq!(first.order().id, second.order().id);
        assert_eq!(first.order().amount_minor, 3320);
        assert_eq!(first.order().status, OrderStatus::Pending);
        assert!(first.order().provider_order_id.starts_with("order_"));
        assert_eq!(provider.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_charge_never_creates_order() {
        let provider = Arc::new(FakeProvider::new());
        let (_store, manager) = setup(provider.clone());
        let free = BillingCalculator::new(BillingConfig::default()).charge_for(GIB);

        let result = manager
            .ensure_order_for_period(AccountId::new(), &customer(), &free, period())
            .await;

        assert!(matches!(result, Err(BillingError::InvalidInput(_))));
        assert_eq!(provider.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_provider_failure_persists_nothing() {
        let provider = Arc::new(FakeProvider::new());
        provider.fail_create.store(true, Ordering::SeqCst);
        let (store, manager) = setup(provider.clone());
        let account_id = AccountId::new();

        let result = manager
            .ensure_order_for_period(account_id, &customer(), &due_charge(), period())
            .await;

        assert!(matches!(result, Err(BillingError::PaymentProvider(_))));
        assert!(store.list_pending_orders().await.unwrap().is_empty());
        assert!(store.list_billing_events(account_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_ensure_creates_one_order() {
        let provider = Arc::new(FakeProvider::new());
        let (store, manager) = setup(provider.clone());
        let account_id = AccountId::new();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    manager
                        .ensure_order_for_period(account_id, &customer(), &due_charge(), period())
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().order().id);
        }
        ids.dedup();

        assert_eq!(ids.len(), 1);
        assert_eq!(store.list_pending_orders().await.unwrap().len(), 1);
        assert_eq!(provider.creates.load(Ordering::SeqCst), 1);
        // Locks are forgotten once every caller has finished
        assert_eq!(manager.tracked_locks().await, 0);
    }

    #[tokio::test]
    async fn test_paid_period_returns_already_paid() {
        let provider = Arc::new(FakeProvider::new());
        let (_store, manager) = setup(provider.clone());
        let account_id = AccountId::new();

        let order = manager
            .ensure_order_for_period(account_id, &customer(), &due_charge(), period())
            .await
            .unwrap()
            .into_order();
        manager
            .apply_status(order.id, OrderStatus::Paid, ActorType::Webhook)
            .await
            .unwrap();

        let again = manager
            .ensure_order_for_period(account_id, &customer(), &due_charge(), period())
            .await
            .unwrap();
        assert!(matches!(again, EnsureOrder::AlreadyPaid(ref o) if o.id == order.id));
        assert_eq!(provider.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_order_allows_retry() {
        let provider = Arc::new(FakeProvider::new());
        let (_store, manager) = setup(provider.clone());
        let account_id = AccountId::new();

        let failed = manager
            .ensure_order_for_period(account_id, &customer(), &due_charge(), period())
            .await
            .unwrap()
            .into_order();
        manager
            .apply_status(failed.id, OrderStatus::Failed, ActorType::Webhook)
            .await
            .unwrap();

        let retry = manager
            .ensure_order_for_period(account_id, &customer(), &due_charge(), period())
            .await
            .unwrap();
        assert!(retry.was_created());
        assert_ne!(retry.order().id, failed.id);
    }

    #[tokio::test]
    async fn test_apply_status_records_settlement_once() {
        let provider = Arc::new(FakeProvider::new());
        let (store, manager) = setup(provider);
        let account_id = AccountId::new();

        let order = manager
            .ensure_order_for_period(account_id, &customer(), &due_charge(), period())
            .await
            .unwrap()
            .into_order();

        let first = manager
            .apply_status(order.id, OrderStatus::Paid, ActorType::Poller)
            .await
            .unwrap();
        let second = manager
            .apply_status(order.id, OrderStatus::Paid, ActorType::Webhook)
            .await
            .unwrap();
        let conflicting = manager
            .apply_status(order.id, OrderStatus::Failed, ActorType::Webhook)
            .await
            .unwrap();

        assert!(first.was_applied());
        assert!(!second.was_applied());
        assert_eq!(conflicting.order().status, OrderStatus::Paid);

        let events = store.list_billing_events(account_id).await.unwrap();
        let paid: Vec<_> = events.iter().filter(|e| e.event_type == "ORDER_PAID").collect();
        assert_eq!(paid.len(), 1);
        assert_eq!(paid[0].actor_type, "poller");
    }

    #[tokio::test]
    async fn test_refresh_from_provider() {
        let provider = Arc::new(FakeProvider::with_statuses(vec![OrderStatus::Expired]));
        let (_store, manager) = setup(provider.clone());

        let order = manager
            .ensure_order_for_period(AccountId::new(), &customer(), &due_charge(), period())
            .await
            .unwrap()
            .into_order();

        let transition = manager.refresh_from_provider(&order, ActorType::System).await.unwrap();
        assert!(transition.was_applied());
        assert_eq!(transition.order().status, OrderStatus::Expired);

        // Already settled: no provider call
        let settled = transition.order().clone();
        manager.refresh_from_provider(&settled, ActorType::System).await.unwrap();
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);
    }
}
