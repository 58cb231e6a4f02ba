//! Common types used across pinvault

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

/// One binary gigabyte (2^30 bytes)
pub const GIB: u64 = 1 << 30;

/// Hard storage cap applied to new accounts unless configured otherwise
pub const DEFAULT_STORAGE_LIMIT_BYTES: u64 = 10 * GIB;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Account ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub Uuid);

impl AccountId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AccountId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for AccountId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Order ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub Uuid);

impl OrderId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for OrderId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Accounts
// =============================================================================

/// A user account keyed by the identity provider's subject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// Identity-provider subject, immutable
    pub subject: String,
    pub email: String,
    pub display_name: Option<String>,
    /// Bytes of all non-deleted objects (hard quota denominator)
    pub storage_used_bytes: u64,
    pub storage_limit_bytes: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Account {
    pub fn remaining_bytes(&self) -> u64 {
        self.storage_limit_bytes.saturating_sub(self.storage_used_bytes)
    }

    /// Percentage of the hard limit in use (0-100, may exceed 100 after a limit change)
    pub fn usage_percentage(&self) -> f64 {
        if self.storage_limit_bytes == 0 {
            return 100.0;
        }
        (self.storage_used_bytes as f64 / self.storage_limit_bytes as f64) * 100.0
    }
}

/// Details needed to create an account on first authenticated request
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub subject: String,
    pub email: String,
    pub display_name: Option<String>,
    pub storage_limit_bytes: u64,
}

impl NewAccount {
    pub fn new(subject: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            email: email.into(),
            display_name: None,
            storage_limit_bytes: DEFAULT_STORAGE_LIMIT_BYTES,
        }
    }

    pub fn display_name(mut self, name: Option<String>) -> Self {
        self.display_name = name;
        self
    }

    pub fn storage_limit(mut self, bytes: u64) -> Self {
        self.storage_limit_bytes = bytes;
        self
    }
}

/// Outcome of an atomic increment-if-under-limit on the usage counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageReservation {
    /// Counter incremented; `used` is the post-increment value
    Reserved { used: u64, limit: u64 },
    /// Counter unchanged; `used` is the current value
    Exceeded { used: u64, limit: u64 },
}

// =============================================================================
// Stored objects
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinStatus {
    Unpinned,
    Pinned,
}

impl PinStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PinStatus::Unpinned => "unpinned",
            PinStatus::Pinned => "pinned",
        }
    }
}

impl std::fmt::Display for PinStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PinStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unpinned" => Ok(PinStatus::Unpinned),
            "pinned" => Ok(PinStatus::Pinned),
            other => Err(format!("unknown pin status: {}", other)),
        }
    }
}

/// A blob stored in IPFS on behalf of an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub id: Uuid,
    pub account_id: AccountId,
    pub cid: String,
    pub filename: Option<String>,
    pub size_bytes: u64,
    pub is_pinned: bool,
    pub pin_status: PinStatus,
    pub is_deleted: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl StoredObject {
    pub fn new(account_id: AccountId, cid: impl Into<String>, size_bytes: u64, pinned: bool) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            account_id,
            cid: cid.into(),
            filename: None,
            size_bytes,
            is_pinned: pinned,
            pin_status: if pinned { PinStatus::Pinned } else { PinStatus::Unpinned },
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_filename(mut self, filename: Option<String>) -> Self {
        self.filename = filename;
        self
    }

    /// Counts toward the hard quota regardless of pin state
    pub fn counts_toward_quota(&self) -> bool {
        !self.is_deleted
    }

    /// Counts toward the monthly bill
    pub fn is_billable(&self) -> bool {
        self.is_pinned && !self.is_deleted
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

/// Per-account billing schedule, created lazily on the first positive charge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub account_id: AccountId,
    /// Day of month (1-31) fixed from the account's creation date
    pub billing_day: u8,
    pub next_billing_at: Option<Date>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Orders
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Pending,
    Paid,
    Failed,
    Expired,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Paid => "PAID",
            OrderStatus::Failed => "FAILED",
            OrderStatus::Expired => "EXPIRED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }

    /// Only PENDING may move, and only to a terminal state
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        *self == OrderStatus::Pending && next.is_terminal()
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OrderStatus::Pending),
            "PAID" => Ok(OrderStatus::Paid),
            "FAILED" => Ok(OrderStatus::Failed),
            "EXPIRED" => Ok(OrderStatus::Expired),
            other => Err(format!("unknown order status: {}", other)),
        }
    }
}

/// Half-open billing period `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub start: Date,
    pub end: Date,
}

impl BillingPeriod {
    pub fn contains(&self, day: Date) -> bool {
        self.start <= day && day < self.end
    }
}

impl std::fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} to {}", self.start, self.end)
    }
}

/// A single billing period's payment request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub account_id: AccountId,
    /// Amount in minor units of `currency` (paise for INR)
    pub amount_minor: i64,
    pub currency: String,
    pub status: OrderStatus,
    pub provider_order_id: String,
    pub payment_session_id: String,
    pub payment_link: Option<String>,
    pub period: BillingPeriod,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub settled_at: Option<OffsetDateTime>,
}

impl Order {
    /// Amount in major units
    pub fn amount(&self) -> f64 {
        self.amount_minor as f64 / 100.0
    }
}

/// Outcome of inserting an order while at most one PENDING order may exist per period
#[derive(Debug, Clone, PartialEq)]
pub enum OrderInsert {
    Inserted(Order),
    Existing(Order),
}

impl OrderInsert {
    pub fn into_order(self) -> Order {
        match self {
            OrderInsert::Inserted(order) | OrderInsert::Existing(order) => order,
        }
    }
}

/// Outcome of a compare-and-set on order status
#[derive(Debug, Clone, PartialEq)]
pub enum OrderTransition {
    /// This call moved the order out of PENDING
    Applied(Order),
    /// The order was already terminal; returned as stored
    Unchanged(Order),
}

impl OrderTransition {
    pub fn order(&self) -> &Order {
        match self {
            OrderTransition::Applied(order) | OrderTransition::Unchanged(order) => order,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, OrderTransition::Applied(_))
    }
}

// =============================================================================
// Billing events
// =============================================================================

/// Append-only audit record of a billing state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingEventRecord {
    pub id: Uuid,
    pub account_id: AccountId,
    pub event_type: String,
    pub order_id: Option<OrderId>,
    pub provider_order_id: Option<String>,
    pub event_data: serde_json::Value,
    pub actor_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn test_order_status_transitions() {
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Paid));
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Failed));
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Expired));
        assert!(!OrderStatus::Pending.can_transition_to(OrderStatus::Pending));
        assert!(!OrderStatus::Paid.can_transition_to(OrderStatus::Failed));
        assert!(!OrderStatus::Expired.can_transition_to(OrderStatus::Paid));
    }

    #[test]
    fn test_order_status_round_trip_strings() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Paid,
            OrderStatus::Failed,
            OrderStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
        assert!("ACTIVE".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn test_stored_object_denominators() {
        let account = AccountId::new();
        let mut object = StoredObject::new(account, "bafy", 10, false);
        assert!(object.counts_toward_quota());
        assert!(!object.is_billable());

        object.is_pinned = true;
        assert!(object.is_billable());

        object.is_deleted = true;
        assert!(!object.counts_toward_quota());
        assert!(!object.is_billable());
    }

    #[test]
    fn test_billing_period_is_half_open() {
        let period = BillingPeriod {
            start: date!(2025 - 01 - 15),
            end: date!(2025 - 02 - 15),
        };
        assert!(period.contains(date!(2025 - 01 - 15)));
        assert!(period.contains(date!(2025 - 02 - 14)));
        assert!(!period.contains(date!(2025 - 02 - 15)));
    }

    #[test]
    fn test_order_amount_major_units() {
        let now = OffsetDateTime::now_utc();
        let order = Order {
            id: OrderId::new(),
            account_id: AccountId::new(),
            amount_minor: 3320,
            currency: "INR".to_string(),
            status: OrderStatus::Pending,
            provider_order_id: "order_1".to_string(),
            payment_session_id: "session".to_string(),
            payment_link: None,
            period: BillingPeriod {
                start: date!(2025 - 01 - 15),
                end: date!(2025 - 02 - 15),
            },
            created_at: now,
            updated_at: now,
            settled_at: None,
        };
        assert!((order.amount() - 33.20).abs() < 1e-9);
    }

    #[test]
    fn test_account_remaining_bytes() {
        let now = OffsetDateTime::now_utc();
        let account = Account {
            id: AccountId::new(),
            subject: "user_1".to_string(),
            email: "a@example.com".to_string(),
            display_name: None,
            storage_used_bytes: 9 * GIB,
            storage_limit_bytes: DEFAULT_STORAGE_LIMIT_BYTES,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(account.remaining_bytes(), GIB);
        assert!((account.usage_percentage() - 90.0).abs() < 1e-9);
    }
}
