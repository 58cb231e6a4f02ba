//! PostgreSQL record store

use async_trait::async_trait;
use sqlx::PgPool;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use super::RecordStore;
use crate::error::{StoreError, StoreResult};
use crate::types::{
    Account, AccountId, BillingEventRecord, BillingPeriod, NewAccount, Order, OrderId,
    OrderInsert, OrderStatus, OrderTransition, PinStatus, StorageReservation, StoredObject,
    Subscription,
};

const ACCOUNT_COLUMNS: &str = "id, subject, email, display_name, storage_used_bytes, \
     storage_limit_bytes, created_at, updated_at";

const OBJECT_COLUMNS: &str = "id, account_id, cid, filename, size_bytes, is_pinned, \
     pin_status, is_deleted, created_at, updated_at";

const ORDER_COLUMNS: &str = "id, account_id, amount_minor, currency, status, provider_order_id, \
     payment_session_id, payment_link, period_start, period_end, created_at, updated_at, settled_at";

// Row types mirror the SQL column types (BIGINT/SMALLINT); conversions into
// the domain types reject negative counters and unknown enum strings.

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: Uuid,
    subject: String,
    email: String,
    display_name: Option<String>,
    storage_used_bytes: i64,
    storage_limit_bytes: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<AccountRow> for Account {
    type Error = StoreError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        Ok(Account {
            id: AccountId(row.id),
            subject: row.subject,
            email: row.email,
            display_name: row.display_name,
            storage_used_bytes: to_u64(row.storage_used_bytes, "storage_used_bytes")?,
            storage_limit_bytes: to_u64(row.storage_limit_bytes, "storage_limit_bytes")?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ObjectRow {
    id: Uuid,
    account_id: Uuid,
    cid: String,
    filename: Option<String>,
    size_bytes: i64,
    is_pinned: bool,
    pin_status: String,
    is_deleted: bool,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<ObjectRow> for StoredObject {
    type Error = StoreError;

    fn try_from(row: ObjectRow) -> Result<Self, Self::Error> {
        Ok(StoredObject {
            id: row.id,
            account_id: AccountId(row.account_id),
            cid: row.cid,
            filename: row.filename,
            size_bytes: to_u64(row.size_bytes, "size_bytes")?,
            is_pinned: row.is_pinned,
            pin_status: row.pin_status.parse::<PinStatus>().map_err(StoreError::Corrupt)?,
            is_deleted: row.is_deleted,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    account_id: Uuid,
    billing_day: i16,
    next_billing_at: Option<Date>,
    created_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = StoreError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let billing_day = u8::try_from(row.billing_day)
            .ok()
            .filter(|d| (1..=31).contains(d))
            .ok_or_else(|| StoreError::Corrupt(format!("billing_day {}", row.billing_day)))?;

        Ok(Subscription {
            account_id: AccountId(row.account_id),
            billing_day,
            next_billing_at: row.next_billing_at,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    account_id: Uuid,
    amount_minor: i64,
    currency: String,
    status: String,
    provider_order_id: String,
    payment_session_id: String,
    payment_link: Option<String>,
    period_start: Date,
    period_end: Date,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    settled_at: Option<OffsetDateTime>,
}

impl TryFrom<OrderRow> for Order {
    type Error = StoreError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        Ok(Order {
            id: OrderId(row.id),
            account_id: AccountId(row.account_id),
            amount_minor: row.amount_minor,
            currency: row.currency,
            status: row.status.parse::<OrderStatus>().map_err(StoreError::Corrupt)?,
            provider_order_id: row.provider_order_id,
            payment_session_id: row.payment_session_id,
            payment_link: row.payment_link,
            period: BillingPeriod {
                start: row.period_start,
                end: row.period_end,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
            settled_at: row.settled_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BillingEventRow {
    id: Uuid,
    account_id: Uuid,
    event_type: String,
    order_id: Option<Uuid>,
    provider_order_id: Option<String>,
    event_data: serde_json::Value,
    actor_type: String,
    created_at: OffsetDateTime,
}

impl From<BillingEventRow> for BillingEventRecord {
    fn from(row: BillingEventRow) -> Self {
        BillingEventRecord {
            id: row.id,
            account_id: AccountId(row.account_id),
            event_type: row.event_type,
            order_id: row.order_id.map(OrderId),
            provider_order_id: row.provider_order_id,
            event_data: row.event_data,
            actor_type: row.actor_type,
            created_at: row.created_at,
        }
    }
}

fn to_u64(value: i64, column: &str) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{} is negative: {}", column, value)))
}

fn to_i64(value: u64, column: &str) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{} overflows BIGINT: {}", column, value)))
}

/// Record store backed by PostgreSQL
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn pending_order_for(&self, account_id: AccountId, period_start: Date) -> StoreResult<Option<Order>> {
        let row: Option<OrderRow> = sqlx::query_as(&format!(
            "SELECT {} FROM orders WHERE account_id = $1 AND period_start = $2 AND status = 'PENDING'",
            ORDER_COLUMNS
        ))
        .bind(account_id.0)
        .bind(period_start)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Order::try_from).transpose()
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn get_account(&self, id: AccountId) -> StoreResult<Option<Account>> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {} FROM accounts WHERE id = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Account::try_from).transpose()
    }

    async fn get_account_by_subject(&self, subject: &str) -> StoreResult<Option<Account>> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {} FROM accounts WHERE subject = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(subject)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Account::try_from).transpose()
    }

    async fn get_or_create_account(&self, new: NewAccount) -> StoreResult<Account> {
        // ON CONFLICT DO NOTHING returns no row when another request created the
        // account first; fall back to reading it.
        let inserted: Option<AccountRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO accounts (id, subject, email, display_name, storage_used_bytes, storage_limit_bytes)
            VALUES ($1, $2, $3, $4, 0, $5)
            ON CONFLICT (subject) DO NOTHING
            RETURNING {}
            "#,
            ACCOUNT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&new.subject)
        .bind(&new.email)
        .bind(&new.display_name)
        .bind(to_i64(new.storage_limit_bytes, "storage_limit_bytes")?)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            let account = Account::try_from(row)?;
            tracing::info!(account_id = %account.id, subject = %account.subject, "Created account");
            return Ok(account);
        }

        self.get_account_by_subject(&new.subject)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("account for subject {}", new.subject)))
    }

    async fn list_accounts(&self) -> StoreResult<Vec<Account>> {
        let rows: Vec<AccountRow> = sqlx::query_as(&format!(
            "SELECT {} FROM accounts ORDER BY created_at ASC",
            ACCOUNT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Account::try_from).collect()
    }

    async fn try_reserve_storage(&self, id: AccountId, bytes: u64) -> StoreResult<StorageReservation> {
        let bytes = to_i64(bytes, "bytes")?;

        // The row lock taken by UPDATE serializes concurrent reservations for
        // the same account; the WHERE clause is the limit check.
        let reserved: Option<(i64, i64)> = sqlx::query_as(
            r#"
            UPDATE accounts
            SET storage_used_bytes = storage_used_bytes + $2, updated_at = NOW()
            WHERE id = $1 AND storage_used_bytes + $2 <= storage_limit_bytes
            RETURNING storage_used_bytes, storage_limit_bytes
            "#,
        )
        .bind(id.0)
        .bind(bytes)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((used, limit)) = reserved {
            return Ok(StorageReservation::Reserved {
                used: to_u64(used, "storage_used_bytes")?,
                limit: to_u64(limit, "storage_limit_bytes")?,
            });
        }

        let current: Option<(i64, i64)> = sqlx::query_as(
            "SELECT storage_used_bytes, storage_limit_bytes FROM accounts WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        let (used, limit) = current.ok_or_else(|| StoreError::NotFound(format!("account {}", id)))?;
        Ok(StorageReservation::Exceeded {
            used: to_u64(used, "storage_used_bytes")?,
            limit: to_u64(limit, "storage_limit_bytes")?,
        })
    }

    async fn adjust_storage(&self, id: AccountId, delta: i64) -> StoreResult<u64> {
        let used: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE accounts
            SET storage_used_bytes = GREATEST(storage_used_bytes + $2, 0), updated_at = NOW()
            WHERE id = $1
            RETURNING storage_used_bytes
            "#,
        )
        .bind(id.0)
        .bind(delta)
        .fetch_optional(&self.pool)
        .await?;

        let (used,) = used.ok_or_else(|| StoreError::NotFound(format!("account {}", id)))?;
        to_u64(used, "storage_used_bytes")
    }

    async fn insert_object(&self, object: StoredObject) -> StoreResult<StoredObject> {
        let row: ObjectRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO stored_objects (
                id, account_id, cid, filename, size_bytes, is_pinned, pin_status,
                is_deleted, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {}
            "#,
            OBJECT_COLUMNS
        ))
        .bind(object.id)
        .bind(object.account_id.0)
        .bind(&object.cid)
        .bind(&object.filename)
        .bind(to_i64(object.size_bytes, "size_bytes")?)
        .bind(object.is_pinned)
        .bind(object.pin_status.as_str())
        .bind(object.is_deleted)
        .bind(object.created_at)
        .bind(object.updated_at)
        .fetch_one(&self.pool)
        .await?;

        StoredObject::try_from(row)
    }

    async fn get_object(&self, account_id: AccountId, cid: &str) -> StoreResult<Option<StoredObject>> {
        let row: Option<ObjectRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM stored_objects
            WHERE account_id = $1 AND cid = $2 AND is_deleted = false
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            OBJECT_COLUMNS
        ))
        .bind(account_id.0)
        .bind(cid)
        .fetch_optional(&self.pool)
        .await?;

        row.map(StoredObject::try_from).transpose()
    }

    async fn update_object_pin(&self, object_id: Uuid, pinned: bool) -> StoreResult<StoredObject> {
        let status = if pinned { PinStatus::Pinned } else { PinStatus::Unpinned };
        let row: Option<ObjectRow> = sqlx::query_as(&format!(
            r#"
            UPDATE stored_objects
            SET is_pinned = $2, pin_status = $3, updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            OBJECT_COLUMNS
        ))
        .bind(object_id)
        .bind(pinned)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(StoredObject::try_from)
            .transpose()?
            .ok_or_else(|| StoreError::NotFound(format!("object {}", object_id)))
    }

    async fn mark_object_deleted(&self, object_id: Uuid) -> StoreResult<Option<StoredObject>> {
        let mut tx = self.pool.begin().await?;

        let row: Option<ObjectRow> = sqlx::query_as(&format!(
            r#"
            UPDATE stored_objects
            SET is_deleted = true, is_pinned = false, pin_status = 'unpinned', updated_at = NOW()
            WHERE id = $1 AND is_deleted = false
            RETURNING {}
            "#,
            OBJECT_COLUMNS
        ))
        .bind(object_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let object = StoredObject::try_from(row)?;

        sqlx::query(
            r#"
            UPDATE accounts
            SET storage_used_bytes = GREATEST(storage_used_bytes - $2, 0), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(object.account_id.0)
        .bind(to_i64(object.size_bytes, "size_bytes")?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(object))
    }

    async fn count_pinned_by_cid(&self, cid: &str) -> StoreResult<u64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM stored_objects WHERE cid = $1 AND is_pinned = true AND is_deleted = false",
        )
        .bind(cid)
        .fetch_one(&self.pool)
        .await?;

        to_u64(count, "pinned_count")
    }

    async fn list_objects(&self, account_id: AccountId) -> StoreResult<Vec<StoredObject>> {
        let rows: Vec<ObjectRow> = sqlx::query_as(&format!(
            "SELECT {} FROM stored_objects WHERE account_id = $1 AND is_deleted = false ORDER BY created_at DESC",
            OBJECT_COLUMNS
        ))
        .bind(account_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StoredObject::try_from).collect()
    }

    async fn pinned_bytes(&self, account_id: AccountId) -> StoreResult<u64> {
        let (total,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(size_bytes), 0)::BIGINT
            FROM stored_objects
            WHERE account_id = $1 AND is_pinned = true AND is_deleted = false
            "#,
        )
        .bind(account_id.0)
        .fetch_one(&self.pool)
        .await?;

        to_u64(total, "pinned_bytes")
    }

    async fn get_subscription(&self, account_id: AccountId) -> StoreResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            "SELECT account_id, billing_day, next_billing_at, created_at FROM subscriptions WHERE account_id = $1",
        )
        .bind(account_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn create_subscription_if_absent(
        &self,
        subscription: Subscription,
    ) -> StoreResult<(Subscription, bool)> {
        let inserted: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            INSERT INTO subscriptions (account_id, billing_day, next_billing_at, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (account_id) DO NOTHING
            RETURNING account_id, billing_day, next_billing_at, created_at
            "#,
        )
        .bind(subscription.account_id.0)
        .bind(i16::from(subscription.billing_day))
        .bind(subscription.next_billing_at)
        .bind(subscription.created_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((Subscription::try_from(row)?, true));
        }

        let existing = self
            .get_subscription(subscription.account_id)
            .await?
            .ok_or_else(|| {
                StoreError::NotFound(format!("subscription for {}", subscription.account_id))
            })?;
        Ok((existing, false))
    }

    async fn update_next_billing(&self, account_id: AccountId, next: Date) -> StoreResult<()> {
        let result = sqlx::query("UPDATE subscriptions SET next_billing_at = $2 WHERE account_id = $1")
            .bind(account_id.0)
            .bind(next)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("subscription for {}", account_id)));
        }
        Ok(())
    }

    async fn insert_order_if_no_pending(&self, order: Order) -> StoreResult<OrderInsert> {
        // ux_orders_pending_period allows one PENDING row per (account_id, period_start)
        let inserted: Option<OrderRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO orders (
                id, account_id, amount_minor, currency, status, provider_order_id,
                payment_session_id, payment_link, period_start, period_end, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, 'PENDING', $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (account_id, period_start) WHERE status = 'PENDING' DO NOTHING
            RETURNING {}
            "#,
            ORDER_COLUMNS
        ))
        .bind(order.id.0)
        .bind(order.account_id.0)
        .bind(order.amount_minor)
        .bind(&order.currency)
        .bind(&order.provider_order_id)
        .bind(&order.payment_session_id)
        .bind(&order.payment_link)
        .bind(order.period.start)
        .bind(order.period.end)
        .bind(order.created_at)
        .bind(order.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(OrderInsert::Inserted(Order::try_from(row)?));
        }

        match self.pending_order_for(order.account_id, order.period.start).await? {
            Some(existing) => Ok(OrderInsert::Existing(existing)),
            // The conflicting order settled between the insert and the read
            None => Err(StoreError::Conflict(format!(
                "pending order for {} / {} changed concurrently",
                order.account_id, order.period.start
            ))),
        }
    }

    async fn get_order(&self, id: OrderId) -> StoreResult<Option<Order>> {
        let row: Option<OrderRow> = sqlx::query_as(&format!(
            "SELECT {} FROM orders WHERE id = $1",
            ORDER_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Order::try_from).transpose()
    }

    async fn get_order_by_provider_id(&self, provider_order_id: &str) -> StoreResult<Option<Order>> {
        let row: Option<OrderRow> = sqlx::query_as(&format!(
            "SELECT {} FROM orders WHERE provider_order_id = $1",
            ORDER_COLUMNS
        ))
        .bind(provider_order_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Order::try_from).transpose()
    }

    async fn latest_order_for_period(
        &self,
        account_id: AccountId,
        period_start: Date,
    ) -> StoreResult<Option<Order>> {
        let row: Option<OrderRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM orders
            WHERE account_id = $1 AND period_start = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            ORDER_COLUMNS
        ))
        .bind(account_id.0)
        .bind(period_start)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Order::try_from).transpose()
    }

    async fn list_pending_orders(&self) -> StoreResult<Vec<Order>> {
        let rows: Vec<OrderRow> = sqlx::query_as(&format!(
            "SELECT {} FROM orders WHERE status = 'PENDING' ORDER BY created_at ASC",
            ORDER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Order::try_from).collect()
    }

    async fn transition_order(&self, id: OrderId, to: OrderStatus) -> StoreResult<OrderTransition> {
        if !to.is_terminal() {
            return Err(StoreError::InvalidTransition {
                from: OrderStatus::Pending,
                to,
            });
        }

        let applied: Option<OrderRow> = sqlx::query_as(&format!(
            r#"
            UPDATE orders
            SET status = $2, updated_at = NOW(), settled_at = NOW()
            WHERE id = $1 AND status = 'PENDING'
            RETURNING {}
            "#,
            ORDER_COLUMNS
        ))
        .bind(id.0)
        .bind(to.as_str())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = applied {
            return Ok(OrderTransition::Applied(Order::try_from(row)?));
        }

        let current = self
            .get_order(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("order {}", id)))?;
        Ok(OrderTransition::Unchanged(current))
    }

    async fn append_billing_event(&self, event: BillingEventRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_events (
                id, account_id, event_type, order_id, provider_order_id, event_data,
                actor_type, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.id)
        .bind(event.account_id.0)
        .bind(&event.event_type)
        .bind(event.order_id.map(|id| id.0))
        .bind(&event.provider_order_id)
        .bind(&event.event_data)
        .bind(&event.actor_type)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_billing_events(&self, account_id: AccountId) -> StoreResult<Vec<BillingEventRecord>> {
        let rows: Vec<BillingEventRow> = sqlx::query_as(
            r#"
            SELECT id, account_id, event_type, order_id, provider_order_id, event_data,
                   actor_type, created_at
            FROM billing_events
            WHERE account_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(account_id.0)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(BillingEventRecord::from).collect())
    }
}
