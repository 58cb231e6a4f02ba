//! Order status polling
//!
//! Fallback for delayed or lost webhooks. A poller runs as its own tokio task
//! with a fixed interval and a bounded number of attempts. It stops as soon as
//! the order leaves PENDING, whether the provider reported it or a webhook got
//! there first. Running out of attempts leaves the order PENDING for the
//! periodic reconciliation job.

use std::sync::Arc;
use std::time::Duration;

use pinvault_shared::{Order, OrderId, OrderTransition};
use tokio::task::JoinHandle;

use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::events::ActorType;
use crate::orders::PaymentOrderManager;

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// This poller applied the terminal status
    Settled(Order),
    /// The order was settled by someone else (webhook, another poller)
    AlreadySettled(Order),
    /// Attempts used up with the order still PENDING
    Exhausted { attempts: u32 },
}

#[derive(Clone)]
pub struct OrderPoller {
    manager: Arc<PaymentOrderManager>,
    interval: Duration,
    max_attempts: u32,
}

impl OrderPoller {
    pub fn new(manager: Arc<PaymentOrderManager>, interval: Duration, max_attempts: u32) -> Self {
        Self {
            manager,
            interval,
            max_attempts,
        }
    }

    pub fn from_config(manager: Arc<PaymentOrderManager>, config: &BillingConfig) -> Self {
        Self::new(manager, config.poll_interval, config.poll_max_attempts)
    }

    /// Poll until the order settles or attempts run out
    pub async fn poll_until_settled(&self, order_id: OrderId) -> BillingResult<PollOutcome> {
        for attempt in 1..=self.max_attempts {
            tokio::time::sleep(self.interval).await;

            let order = self
                .manager
                .get_order(order_id)
                .await?
                .ok_or_else(|| BillingError::NotFound(format!("order {}", order_id)))?;

            if order.status.is_terminal() {
                tracing::debug!(order_id = %order_id, status = %order.status, attempt, "Order settled elsewhere");
                return Ok(PollOutcome::AlreadySettled(order));
            }

            match self.manager.refresh_from_provider(&order, ActorType::Poller).await {
                Ok(OrderTransition::Applied(order)) => {
                    tracing::info!(order_id = %order_id, status = %order.status, attempt, "Order settled by poller");
                    return Ok(PollOutcome::Settled(order));
                }
                Ok(OrderTransition::Unchanged(order)) if order.status.is_terminal() => {
                    return Ok(PollOutcome::AlreadySettled(order));
                }
                Ok(OrderTransition::Unchanged(_)) => {}
                Err(e) => {
                    tracing::warn!(order_id = %order_id, attempt, error = %e, "Order status poll failed");
                }
            }
        }

        tracing::info!(
            order_id = %order_id,
            attempts = self.max_attempts,
            "Polling exhausted, order left pending"
        );
        Ok(PollOutcome::Exhausted {
            attempts: self.max_attempts,
        })
    }

    /// Run [`Self::poll_until_settled`] on a background task
    pub fn spawn(&self, order_id: OrderId) -> PollHandle {
        let poller = self.clone();
        let handle = tokio::spawn(async move { poller.poll_until_settled(order_id).await });
        PollHandle { order_id, handle }
    }
}

/// Handle to a running poller
pub struct PollHandle {
    order_id: OrderId,
    handle: JoinHandle<BillingResult<PollOutcome>>,
}

impl PollHandle {
    pub fn order_id(&self) -> OrderId {
        self.order_id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    pub async fn join(self) -> BillingResult<PollOutcome> {
        self.handle
            .await
            .map_err(|e| BillingError::Internal(format!("poller task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculator::BillingCalculator;
    use crate::events::BillingEventLogger;
    use crate::orders::tests::{customer, period, FakeProvider};
    use pinvault_shared::{AccountId, InMemoryRecordStore, OrderStatus, RecordStore, GIB};
    use std::sync::atomic::Ordering;

    async fn setup(provider: Arc<FakeProvider>) -> (Arc<InMemoryRecordStore>, Arc<PaymentOrderManager>, Order) {
        let store = Arc::new(InMemoryRecordStore::new());
        let manager = Arc::new(PaymentOrderManager::new(
            store.clone(),
            provider,
            BillingEventLogger::new(store.clone()),
            BillingConfig::default(),
        ));
        let charge = BillingCalculator::new(BillingConfig::default()).charge_for(6 * GIB);
        let order = manager
            .ensure_order_for_period(AccountId::new(), &customer(), &charge, period())
            .await
            .unwrap()
            .into_order();
        (store, manager, order)
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_settles_when_provider_reports_paid() {
        let provider = Arc::new(FakeProvider::with_statuses(vec![
            OrderStatus::Pending,
            OrderStatus::Pending,
            OrderStatus::Paid,
        ]));
        let (store, manager, order) = setup(provider.clone()).await;

        let poller = OrderPoller::new(manager, Duration::from_secs(5), 60);
        let outcome = poller.spawn(order.id).join().await.unwrap();

        assert!(matches!(outcome, PollOutcome::Settled(ref o) if o.status == OrderStatus::Paid));
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 3);
        assert_eq!(store.get_order(order.id).await.unwrap().unwrap().status, OrderStatus::Paid);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_exhaustion_leaves_order_pending() {
        let provider = Arc::new(FakeProvider::new());
        let (store, manager, order) = setup(provider.clone()).await;

        let started = tokio::time::Instant::now();
        let poller = OrderPoller::new(manager, Duration::from_secs(5), 60);
        let outcome = poller.poll_until_settled(order.id).await.unwrap();

        assert_eq!(outcome, PollOutcome::Exhausted { attempts: 60 });
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 60);
        assert!(started.elapsed() >= Duration::from_secs(300));
        assert_eq!(store.get_order(order.id).await.unwrap().unwrap().status, OrderStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_stops_when_webhook_settled_first() {
        let provider = Arc::new(FakeProvider::new());
        let (_store, manager, order) = setup(provider.clone()).await;

        manager
            .apply_status(order.id, OrderStatus::Failed, ActorType::Webhook)
            .await
            .unwrap();

        let poller = OrderPoller::new(manager, Duration::from_secs(5), 60);
        let outcome = poller.poll_until_settled(order.id).await.unwrap();

        assert!(matches!(outcome, PollOutcome::AlreadySettled(ref o) if o.status == OrderStatus::Failed));
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_unknown_order() {
        let provider = Arc::new(FakeProvider::new());
        let (_store, manager, _order) = setup(provider).await;

        let poller = OrderPoller::new(manager, Duration::from_secs(5), 3);
        let result = poller.poll_until_settled(pinvault_shared::OrderId::new()).await;
        assert!(matches!(result, Err(BillingError::NotFound(_))));
    }
}
