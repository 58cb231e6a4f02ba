//! Record store abstraction
//!
//! Every component reads and writes accounts, objects, subscriptions and
//! orders through [`RecordStore`]. Two implementations ship:
//!
//! - [`PgRecordStore`]: PostgreSQL via sqlx, used in production
//! - [`InMemoryRecordStore`]: lock-guarded maps, for development and tests
//!
//! Operations that guard invariants (`try_reserve_storage`,
//! `insert_order_if_no_pending`, `transition_order`) are atomic in both.

mod memory;
mod postgres;

pub use memory::InMemoryRecordStore;
pub use postgres::PgRecordStore;

use async_trait::async_trait;
use time::Date;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::types::{
    Account, AccountId, BillingEventRecord, NewAccount, Order, OrderId, OrderInsert,
    OrderStatus, OrderTransition, StorageReservation, StoredObject, Subscription,
};

#[async_trait]
pub trait RecordStore: Send + Sync {
    // Accounts

    async fn get_account(&self, id: AccountId) -> StoreResult<Option<Account>>;

    async fn get_account_by_subject(&self, subject: &str) -> StoreResult<Option<Account>>;

    /// Returns the account for `new.subject`, creating it if absent
    async fn get_or_create_account(&self, new: NewAccount) -> StoreResult<Account>;

    async fn list_accounts(&self) -> StoreResult<Vec<Account>>;

    /// Atomically add `bytes` to the usage counter only if the result stays within the limit
    async fn try_reserve_storage(&self, id: AccountId, bytes: u64) -> StoreResult<StorageReservation>;

    /// Apply a signed delta to the usage counter, saturating at zero. Returns the new value.
    async fn adjust_storage(&self, id: AccountId, delta: i64) -> StoreResult<u64>;

    // Stored objects

    async fn insert_object(&self, object: StoredObject) -> StoreResult<StoredObject>;

    /// Most recent non-deleted object with this CID owned by the account
    async fn get_object(&self, account_id: AccountId, cid: &str) -> StoreResult<Option<StoredObject>>;

    async fn update_object_pin(&self, object_id: Uuid, pinned: bool) -> StoreResult<StoredObject>;

    /// Marks the object deleted and returns its bytes to the owner's usage
    /// counter in the same step. Returns `None` if it was already deleted.
    async fn mark_object_deleted(&self, object_id: Uuid) -> StoreResult<Option<StoredObject>>;

    /// Live pinned objects referencing `cid`, across all accounts
    async fn count_pinned_by_cid(&self, cid: &str) -> StoreResult<u64>;

    async fn list_objects(&self, account_id: AccountId) -> StoreResult<Vec<StoredObject>>;

    /// Sum of `size_bytes` over pinned, non-deleted objects
    async fn pinned_bytes(&self, account_id: AccountId) -> StoreResult<u64>;

    // Subscriptions

    async fn get_subscription(&self, account_id: AccountId) -> StoreResult<Option<Subscription>>;

    /// Insert unless one exists. Returns the stored row and whether this call created it.
    async fn create_subscription_if_absent(
        &self,
        subscription: Subscription,
    ) -> StoreResult<(Subscription, bool)>;

    async fn update_next_billing(&self, account_id: AccountId, next: Date) -> StoreResult<()>;

    // Orders

    /// Insert a PENDING order unless one already exists for the same account and period start
    async fn insert_order_if_no_pending(&self, order: Order) -> StoreResult<OrderInsert>;

    async fn get_order(&self, id: OrderId) -> StoreResult<Option<Order>>;

    async fn get_order_by_provider_id(&self, provider_order_id: &str) -> StoreResult<Option<Order>>;

    /// Most recently created order for the account whose period starts on `period_start`
    async fn latest_order_for_period(
        &self,
        account_id: AccountId,
        period_start: Date,
    ) -> StoreResult<Option<Order>>;

    async fn list_pending_orders(&self) -> StoreResult<Vec<Order>>;

    /// Compare-and-set: moves the order to `to` only if it is currently PENDING
    async fn transition_order(&self, id: OrderId, to: OrderStatus) -> StoreResult<OrderTransition>;

    // Billing events

    async fn append_billing_event(&self, event: BillingEventRecord) -> StoreResult<()>;

    async fn list_billing_events(&self, account_id: AccountId) -> StoreResult<Vec<BillingEventRecord>>;
}
