//! Usage metering
//!
//! Two numbers describe an account's storage and they are deliberately
//! different:
//!
//! - `storage_used_bytes` on the account: every non-deleted object, pinned or
//!   not. This is the hard-quota counter maintained by the quota gate.
//! - pinned bytes: live sum over pinned, non-deleted objects. This is what the
//!   monthly bill is computed from.

use std::sync::Arc;

use pinvault_shared::{AccountId, RecordStore};
use serde::{Deserialize, Serialize};

use crate::calculator::BillingCalculator;
use crate::error::{BillingError, BillingResult};

/// Storage and cost snapshot for one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub account_id: AccountId,
    /// All non-deleted bytes (hard quota)
    pub storage_used_bytes: u64,
    /// Pinned, non-deleted bytes (billing)
    pub pinned_bytes: u64,
    pub storage_limit_bytes: u64,
    pub usage_percentage: f64,
    pub exceeds_free_tier: bool,
    pub monthly_cost_usd: f64,
}

#[derive(Clone)]
pub struct UsageMeter {
    store: Arc<dyn RecordStore>,
}

impl UsageMeter {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Bytes currently pinned by the account
    pub async fn pinned_bytes(&self, account_id: AccountId) -> BillingResult<u64> {
        Ok(self.store.pinned_bytes(account_id).await?)
    }

    pub async fn summary(
        &self,
        account_id: AccountId,
        calculator: &BillingCalculator,
    ) -> BillingResult<UsageSummary> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("account {}", account_id)))?;
        let pinned_bytes = self.pinned_bytes(account_id).await?;

        Ok(UsageSummary {
            account_id,
            storage_used_bytes: account.storage_used_bytes,
            pinned_bytes,
            storage_limit_bytes: account.storage_limit_bytes,
            usage_percentage: account.usage_percentage(),
            exceeds_free_tier: calculator.exceeds_free_tier(pinned_bytes),
            monthly_cost_usd: calculator.monthly_cost(pinned_bytes),
        })
    }
}
