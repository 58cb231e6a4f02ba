//! In-memory record store (for development without PostgreSQL, and tests)

use std::collections::HashMap;

use async_trait::async_trait;
use time::{Date, OffsetDateTime};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::RecordStore;
use crate::error::{StoreError, StoreResult};
use crate::types::{
    Account, AccountId, BillingEventRecord, NewAccount, Order, OrderId, OrderInsert,
    OrderStatus, OrderTransition, StorageReservation, StoredObject, Subscription,
};

#[derive(Default)]
struct State {
    accounts: HashMap<AccountId, Account>,
    subjects: HashMap<String, AccountId>,
    objects: HashMap<Uuid, StoredObject>,
    subscriptions: HashMap<AccountId, Subscription>,
    orders: HashMap<OrderId, Order>,
    events: Vec<BillingEventRecord>,
}

impl State {
    fn account_mut(&mut self, id: AccountId) -> StoreResult<&mut Account> {
        self.accounts
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("account {}", id)))
    }

    fn pending_order_for(&self, account_id: AccountId, period_start: Date) -> Option<&Order> {
        self.orders.values().find(|o| {
            o.account_id == account_id
                && o.period.start == period_start
                && o.status == OrderStatus::Pending
        })
    }
}

/// Record store backed by maps behind a single lock.
/// Every write takes the write lock, so each trait operation is atomic.
#[derive(Default)]
pub struct InMemoryRecordStore {
    state: RwLock<State>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully-formed account (tests use this to control `created_at`)
    pub async fn insert_account(&self, account: Account) {
        let mut state = self.state.write().await;
        state.subjects.insert(account.subject.clone(), account.id);
        state.accounts.insert(account.id, account);
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get_account(&self, id: AccountId) -> StoreResult<Option<Account>> {
        Ok(self.state.read().await.accounts.get(&id).cloned())
    }

    async fn get_account_by_subject(&self, subject: &str) -> StoreResult<Option<Account>> {
        let state = self.state.read().await;
        Ok(state
            .subjects
            .get(subject)
            .and_then(|id| state.accounts.get(id))
            .cloned())
    }

    async fn get_or_create_account(&self, new: NewAccount) -> StoreResult<Account> {
        let mut state = self.state.write().await;
        if let Some(existing) = state
            .subjects
            .get(&new.subject)
            .and_then(|id| state.accounts.get(id))
        {
            return Ok(existing.clone());
        }

        let now = OffsetDateTime::now_utc();
        let account = Account {
            id: AccountId::new(),
            subject: new.subject,
            email: new.email,
            display_name: new.display_name,
            storage_used_bytes: 0,
            storage_limit_bytes: new.storage_limit_bytes,
            created_at: now,
            updated_at: now,
        };
        state.subjects.insert(account.subject.clone(), account.id);
        state.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn list_accounts(&self) -> StoreResult<Vec<Account>> {
        let mut accounts: Vec<Account> =
            self.state.read().await.accounts.values().cloned().collect();
        accounts.sort_by_key(|a| a.created_at);
        Ok(accounts)
    }

    async fn try_reserve_storage(&self, id: AccountId, bytes: u64) -> StoreResult<StorageReservation> {
        let mut state = self.state.write().await;
        let account = state.account_mut(id)?;

        let used = account.storage_used_bytes;
        let limit = account.storage_limit_bytes;
        match used.checked_add(bytes) {
            Some(next) if next <= limit => {
                account.storage_used_bytes = next;
                account.updated_at = OffsetDateTime::now_utc();
                Ok(StorageReservation::Reserved { used: next, limit })
            }
            _ => Ok(StorageReservation::Exceeded { used, limit }),
        }
    }

    async fn adjust_storage(&self, id: AccountId, delta: i64) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let account = state.account_mut(id)?;

        account.storage_used_bytes = if delta >= 0 {
            account.storage_used_bytes.saturating_add(delta as u64)
        } else {
            account.storage_used_bytes.saturating_sub(delta.unsigned_abs())
        };
        account.updated_at = OffsetDateTime::now_utc();
        Ok(account.storage_used_bytes)
    }

    async fn insert_object(&self, object: StoredObject) -> StoreResult<StoredObject> {
        let mut state = self.state.write().await;
        if state.objects.contains_key(&object.id) {
            return Err(StoreError::Conflict(format!("object {}", object.id)));
        }
        state.objects.insert(object.id, object.clone());
        Ok(object)
    }

    async fn get_object(&self, account_id: AccountId, cid: &str) -> StoreResult<Option<StoredObject>> {
        let state = self.state.read().await;
        Ok(state
            .objects
            .values()
            .filter(|o| o.account_id == account_id && o.cid == cid && !o.is_deleted)
            .max_by_key(|o| o.created_at)
            .cloned())
    }

    async fn update_object_pin(&self, object_id: Uuid, pinned: bool) -> StoreResult<StoredObject> {
        let mut state = self.state.write().await;
        let object = state
            .objects
            .get_mut(&object_id)
            .ok_or_else(|| StoreError::NotFound(format!("object {}", object_id)))?;

        object.is_pinned = pinned;
        object.pin_status = if pinned {
            crate::types::PinStatus::Pinned
        } else {
            crate::types::PinStatus::Unpinned
        };
        object.updated_at = OffsetDateTime::now_utc();
        Ok(object.clone())
    }

    async fn mark_object_deleted(&self, object_id: Uuid) -> StoreResult<Option<StoredObject>> {
        let mut state = self.state.write().await;
        let object = state
            .objects
            .get_mut(&object_id)
            .ok_or_else(|| StoreError::NotFound(format!("object {}", object_id)))?;

        if object.is_deleted {
            return Ok(None);
        }
        let now = OffsetDateTime::now_utc();
        object.is_deleted = true;
        object.is_pinned = false;
        object.pin_status = crate::types::PinStatus::Unpinned;
        object.updated_at = now;
        let deleted = object.clone();

        if let Some(account) = state.accounts.get_mut(&deleted.account_id) {
            account.storage_used_bytes = account.storage_used_bytes.saturating_sub(deleted.size_bytes);
            account.updated_at = now;
        }
        Ok(Some(deleted))
    }

    async fn count_pinned_by_cid(&self, cid: &str) -> StoreResult<u64> {
        let state = self.state.read().await;
        Ok(state
            .objects
            .values()
            .filter(|o| o.cid == cid && o.is_billable())
            .count() as u64)
    }

    async fn list_objects(&self, account_id: AccountId) -> StoreResult<Vec<StoredObject>> {
        let state = self.state.read().await;
        let mut objects: Vec<StoredObject> = state
            .objects
            .values()
            .filter(|o| o.account_id == account_id && !o.is_deleted)
            .cloned()
            .collect();
        objects.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(objects)
    }

    async fn pinned_bytes(&self, account_id: AccountId) -> StoreResult<u64> {
        let state = self.state.read().await;
        Ok(state
            .objects
            .values()
            .filter(|o| o.account_id == account_id && o.is_billable())
            .map(|o| o.size_bytes)
            .sum())
    }

    async fn get_subscription(&self, account_id: AccountId) -> StoreResult<Option<Subscription>> {
        Ok(self.state.read().await.subscriptions.get(&account_id).cloned())
    }

    async fn create_subscription_if_absent(
        &self,
        subscription: Subscription,
    ) -> StoreResult<(Subscription, bool)> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.subscriptions.get(&subscription.account_id) {
            return Ok((existing.clone(), false));
        }
        state
            .subscriptions
            .insert(subscription.account_id, subscription.clone());
        Ok((subscription, true))
    }

    async fn update_next_billing(&self, account_id: AccountId, next: Date) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let subscription = state
            .subscriptions
            .get_mut(&account_id)
            .ok_or_else(|| StoreError::NotFound(format!("subscription for {}", account_id)))?;
        subscription.next_billing_at = Some(next);
        Ok(())
    }

    async fn insert_order_if_no_pending(&self, order: Order) -> StoreResult<OrderInsert> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.pending_order_for(order.account_id, order.period.start) {
            return Ok(OrderInsert::Existing(existing.clone()));
        }
        if state
            .orders
            .values()
            .any(|o| o.provider_order_id == order.provider_order_id)
        {
            return Err(StoreError::Conflict(format!(
                "provider order {}",
                order.provider_order_id
            )));
        }
        state.orders.insert(order.id, order.clone());
        Ok(OrderInsert::Inserted(order))
    }

    async fn get_order(&self, id: OrderId) -> StoreResult<Option<Order>> {
        Ok(self.state.read().await.orders.get(&id).cloned())
    }

    async fn get_order_by_provider_id(&self, provider_order_id: &str) -> StoreResult<Option<Order>> {
        let state = self.state.read().await;
        Ok(state
            .orders
            .values()
            .find(|o| o.provider_order_id == provider_order_id)
            .cloned())
    }

    async fn latest_order_for_period(
        &self,
        account_id: AccountId,
        period_start: Date,
    ) -> StoreResult<Option<Order>> {
        let state = self.state.read().await;
        Ok(state
            .orders
            .values()
            .filter(|o| o.account_id == account_id && o.period.start == period_start)
            .max_by_key(|o| o.created_at)
            .cloned())
    }

    async fn list_pending_orders(&self) -> StoreResult<Vec<Order>> {
        let state = self.state.read().await;
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Pending)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    async fn transition_order(&self, id: OrderId, to: OrderStatus) -> StoreResult<OrderTransition> {
        if !to.is_terminal() {
            return Err(StoreError::InvalidTransition {
                from: OrderStatus::Pending,
                to,
            });
        }

        let mut state = self.state.write().await;
        let order = state
            .orders
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("order {}", id)))?;

        if !order.status.can_transition_to(to) {
            return Ok(OrderTransition::Unchanged(order.clone()));
        }

        let now = OffsetDateTime::now_utc();
        order.status = to;
        order.updated_at = now;
        order.settled_at = Some(now);
        Ok(OrderTransition::Applied(order.clone()))
    }

    async fn append_billing_event(&self, event: BillingEventRecord) -> StoreResult<()> {
        self.state.write().await.events.push(event);
        Ok(())
    }

    async fn list_billing_events(&self, account_id: AccountId) -> StoreResult<Vec<BillingEventRecord>> {
        let state = self.state.read().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BillingPeriod, GIB};
    use std::sync::Arc;
    use time::macros::date;

    fn pending_order(account_id: AccountId, provider_id: &str) -> Order {
        let now = OffsetDateTime::now_utc();
        Order {
            id: OrderId::new(),
            account_id,
            amount_minor: 3320,
            currency: "INR".to_string(),
            status: OrderStatus::Pending,
            provider_order_id: provider_id.to_string(),
            payment_session_id: format!("session_{}", provider_id),
            payment_link: None,
            period: BillingPeriod {
                start: date!(2025 - 03 - 10),
                end: date!(2025 - 04 - 10),
            },
            created_at: now,
            updated_at: now,
            settled_at: None,
        }
    }

    #[tokio::test]
    async fn test_get_or_create_account_is_idempotent() {
        let store = InMemoryRecordStore::new();
        let first = store
            .get_or_create_account(NewAccount::new("sub_1", "a@example.com"))
            .await
            .unwrap();
        let second = store
            .get_or_create_account(NewAccount::new("sub_1", "other@example.com"))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.email, "a@example.com");
        assert_eq!(store.list_accounts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reservation_allows_exact_limit_and_rejects_one_over() {
        let store = InMemoryRecordStore::new();
        let account = store
            .get_or_create_account(NewAccount::new("sub_1", "a@example.com").storage_limit(100))
            .await
            .unwrap();

        let result = store.try_reserve_storage(account.id, 100).await.unwrap();
        assert_eq!(result, StorageReservation::Reserved { used: 100, limit: 100 });

        let result = store.try_reserve_storage(account.id, 1).await.unwrap();
        assert_eq!(result, StorageReservation::Exceeded { used: 100, limit: 100 });
    }

    #[tokio::test]
    async fn test_concurrent_reservations_never_exceed_limit() {
        let store = Arc::new(InMemoryRecordStore::new());
        let account = store
            .get_or_create_account(NewAccount::new("sub_1", "a@example.com").storage_limit(10 * GIB))
            .await
            .unwrap();

        let account_id = account.id;
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.try_reserve_storage(account_id, 3 * GIB).await.unwrap()
            }));
        }

        let mut reserved = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), StorageReservation::Reserved { .. }) {
                reserved += 1;
            }
        }
        assert_eq!(reserved, 3);
        let account = store.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.storage_used_bytes, 9 * GIB);
    }

    #[tokio::test]
    async fn test_adjust_storage_saturates_at_zero() {
        let store = InMemoryRecordStore::new();
        let account = store
            .get_or_create_account(NewAccount::new("sub_1", "a@example.com"))
            .await
            .unwrap();
        store.adjust_storage(account.id, 50).await.unwrap();
        assert_eq!(store.adjust_storage(account.id, -80).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_returns_bytes_to_the_counter() {
        let store = InMemoryRecordStore::new();
        let account = store
            .get_or_create_account(NewAccount::new("sub_1", "a@example.com").storage_limit(1000))
            .await
            .unwrap();
        store.try_reserve_storage(account.id, 300).await.unwrap();
        let object = store
            .insert_object(StoredObject::new(account.id, "bafy-a", 300, true))
            .await
            .unwrap();

        store.mark_object_deleted(object.id).await.unwrap().unwrap();
        assert_eq!(store.get_account(account.id).await.unwrap().unwrap().storage_used_bytes, 0);

        // A repeated delete releases nothing
        store.try_reserve_storage(account.id, 50).await.unwrap();
        assert!(store.mark_object_deleted(object.id).await.unwrap().is_none());
        assert_eq!(store.get_account(account.id).await.unwrap().unwrap().storage_used_bytes, 50);
    }

    #[tokio::test]
    async fn test_count_pinned_by_cid_spans_accounts() {
        let store = InMemoryRecordStore::new();
        let (alice, bob) = (AccountId::new(), AccountId::new());

        let first = store.insert_object(StoredObject::new(alice, "bafy-shared", 10, true)).await.unwrap();
        store.insert_object(StoredObject::new(bob, "bafy-shared", 10, true)).await.unwrap();
        store.insert_object(StoredObject::new(bob, "bafy-shared", 10, false)).await.unwrap();
        store.insert_object(StoredObject::new(bob, "bafy-other", 10, true)).await.unwrap();
        assert_eq!(store.count_pinned_by_cid("bafy-shared").await.unwrap(), 2);

        store.mark_object_deleted(first.id).await.unwrap();
        assert_eq!(store.count_pinned_by_cid("bafy-shared").await.unwrap(), 1);
        assert_eq!(store.count_pinned_by_cid("bafy-missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pinned_bytes_ignores_unpinned_and_deleted() {
        let store = InMemoryRecordStore::new();
        let account = AccountId::new();

        store.insert_object(StoredObject::new(account, "a", 100, true)).await.unwrap();
        store.insert_object(StoredObject::new(account, "b", 40, false)).await.unwrap();
        let deleted = store.insert_object(StoredObject::new(account, "c", 7, true)).await.unwrap();
        store.mark_object_deleted(deleted.id).await.unwrap();

        assert_eq!(store.pinned_bytes(account).await.unwrap(), 100);
        assert!(store.mark_object_deleted(deleted.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_only_one_pending_order_per_period() {
        let store = InMemoryRecordStore::new();
        let account = AccountId::new();

        let first = store
            .insert_order_if_no_pending(pending_order(account, "order_a"))
            .await
            .unwrap();
        assert!(matches!(first, OrderInsert::Inserted(_)));

        let second = store
            .insert_order_if_no_pending(pending_order(account, "order_b"))
            .await
            .unwrap();
        match second {
            OrderInsert::Existing(order) => assert_eq!(order.provider_order_id, "order_a"),
            other => panic!("expected existing order, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let store = InMemoryRecordStore::new();
        let order = store
            .insert_order_if_no_pending(pending_order(AccountId::new(), "order_a"))
            .await
            .unwrap()
            .into_order();

        let first = store.transition_order(order.id, OrderStatus::Paid).await.unwrap();
        assert!(first.was_applied());
        assert!(first.order().settled_at.is_some());

        let second = store.transition_order(order.id, OrderStatus::Failed).await.unwrap();
        assert!(!second.was_applied());
        assert_eq!(second.order().status, OrderStatus::Paid);

        let invalid = store.transition_order(order.id, OrderStatus::Pending).await;
        assert!(matches!(invalid, Err(StoreError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_subscription_billing_day_is_never_overwritten() {
        let store = InMemoryRecordStore::new();
        let account = AccountId::new();
        let now = OffsetDateTime::now_utc();

        let (_, created) = store
            .create_subscription_if_absent(Subscription {
                account_id: account,
                billing_day: 31,
                next_billing_at: None,
                created_at: now,
            })
            .await
            .unwrap();
        assert!(created);

        let (stored, created) = store
            .create_subscription_if_absent(Subscription {
                account_id: account,
                billing_day: 5,
                next_billing_at: None,
                created_at: now,
            })
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(stored.billing_day, 31);
    }
}
