//! Access gate
//!
//! Answers "may this account use paid services right now?". Read-only: it
//! composes the usage meter, calculator and cycle arithmetic with the order
//! table and never creates or settles anything.
//!
//! An account under the free tier is always allowed. Above it, the most
//! recent order for the billing period containing `today` must be PAID.

use std::sync::Arc;

use pinvault_shared::{AccountId, BillingPeriod, OrderStatus, RecordStore};
use serde::{Deserialize, Serialize};
use time::Date;

use crate::calculator::{BillingCalculator, Charge};
use crate::cycle;
use crate::error::{BillingError, BillingResult};
use crate::usage::UsageMeter;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub charge: Charge,
    pub period: BillingPeriod,
}

impl AccessDecision {
    fn allow(charge: Charge, period: BillingPeriod) -> Self {
        Self {
            allowed: true,
            reason: None,
            charge,
            period,
        }
    }
}

#[derive(Clone)]
pub struct AccessGate {
    store: Arc<dyn RecordStore>,
    meter: UsageMeter,
    calculator: BillingCalculator,
}

impl AccessGate {
    pub fn new(store: Arc<dyn RecordStore>, meter: UsageMeter, calculator: BillingCalculator) -> Self {
        Self {
            store,
            meter,
            calculator,
        }
    }

    pub async fn check_access(&self, account_id: AccountId, today: Date) -> BillingResult<AccessDecision> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("account {}", account_id)))?;

        let billing_day = match self.store.get_subscription(account_id).await? {
            Some(subscription) => subscription.billing_day,
            None => cycle::billing_day(account.created_at),
        };
        let period = cycle::billing_period(billing_day, today)?;

        let pinned_bytes = self.meter.pinned_bytes(account_id).await?;
        let charge = self.calculator.charge_for(pinned_bytes);
        if !charge.is_due() {
            return Ok(AccessDecision::allow(charge, period));
        }

        let latest = self.store.latest_order_for_period(account_id, period.start).await?;
        if matches!(latest, Some(ref order) if order.status == OrderStatus::Paid) {
            return Ok(AccessDecision::allow(charge, period));
        }

        let reason = format!(
            "Payment of {:.2} {} outstanding for billing period {}",
            charge.amount, charge.currency, period
        );
        tracing::debug!(
            account_id = %account_id,
            amount = charge.amount,
            latest_status = ?latest.as_ref().map(|o| o.status),
            "Access blocked"
        );

        Ok(AccessDecision {
            allowed: false,
            reason: Some(reason),
            charge,
            period,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BillingConfig;
    use pinvault_shared::{
        Account, InMemoryRecordStore, Order, OrderId, StoredObject, Subscription, GIB,
    };
    use time::macros::{date, datetime};

    fn account() -> Account {
        Account {
            id: AccountId::new(),
            subject: "user_access".to_string(),
            email: "access@example.com".to_string(),
            display_name: None,
            storage_used_bytes: 0,
            storage_limit_bytes: 20 * GIB,
            created_at: datetime!(2024-11-15 09:00 UTC),
            updated_at: datetime!(2024-11-15 09:00 UTC),
        }
    }

    async fn setup(pinned: u64) -> (Arc<InMemoryRecordStore>, AccessGate, Account) {
        let store = Arc::new(InMemoryRecordStore::new());
        let account = account();
        store.insert_account(account.clone()).await;
        if pinned > 0 {
            store
                .insert_object(StoredObject::new(account.id, "bafy-access", pinned, true))
                .await
                .unwrap();
        }
        let gate = AccessGate::new(
            store.clone(),
            UsageMeter::new(store.clone()),
            BillingCalculator::new(BillingConfig::default()),
        );
        (store, gate, account)
    }

    fn order(account_id: AccountId, status: OrderStatus, period: BillingPeriod) -> Order {
        let now = datetime!(2025-01-15 00:05 UTC);
        Order {
            id: OrderId::new(),
            account_id,
            amount_minor: 3320,
            currency: "INR".to_string(),
            status,
            provider_order_id: format!("order_{}", uuid::Uuid::new_v4().simple()),
            payment_session_id: "session".to_string(),
            payment_link: None,
            period,
            created_at: now,
            updated_at: now,
            settled_at: None,
        }
    }

    #[tokio::test]
    async fn test_free_tier_always_allowed() {
        let (_store, gate, account) = setup(3 * GIB).await;
        let decision = gate.check_access(account.id, date!(2025-01-20)).await.unwrap();
        assert!(decision.allowed);
        assert!(decision.reason.is_none());
        assert_eq!(decision.charge.amount, 0.0);
    }

    #[tokio::test]
    async fn test_blocked_without_order() {
        let (_store, gate, account) = setup(6 * GIB).await;
        let decision = gate.check_access(account.id, date!(2025-01-20)).await.unwrap();

        assert!(!decision.allowed);
        let reason = decision.reason.unwrap();
        assert!(reason.contains("33.20 INR"), "{}", reason);
        assert!(reason.contains("2025-01-15 to 2025-02-15"), "{}", reason);
    }

    #[tokio::test]
    async fn test_paid_order_unblocks_only_its_period() {
        let (store, gate, account) = setup(6 * GIB).await;
        let period = BillingPeriod {
            start: date!(2025-01-15),
            end: date!(2025-02-15),
        };
        store
            .insert_order_if_no_pending(order(account.id, OrderStatus::Pending, period))
            .await
            .unwrap();
        assert!(!gate.check_access(account.id, date!(2025-01-20)).await.unwrap().allowed);

        let pending = store.list_pending_orders().await.unwrap();
        store.transition_order(pending[0].id, OrderStatus::Paid).await.unwrap();
        assert!(gate.check_access(account.id, date!(2025-01-20)).await.unwrap().allowed);

        // Next period needs a new payment
        assert!(!gate.check_access(account.id, date!(2025-02-15)).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_subscription_billing_day_takes_precedence() {
        let (store, gate, account) = setup(6 * GIB).await;
        store
            .create_subscription_if_absent(Subscription {
                account_id: account.id,
                billing_day: 1,
                next_billing_at: None,
                created_at: account.created_at,
            })
            .await
            .unwrap();

        let decision = gate.check_access(account.id, date!(2025-01-20)).await.unwrap();
        assert_eq!(decision.period.start, date!(2025-01-01));
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let (_store, gate, _account) = setup(0).await;
        let result = gate.check_access(AccountId::new(), date!(2025-01-20)).await;
        assert!(matches!(result, Err(BillingError::NotFound(_))));
    }
}
