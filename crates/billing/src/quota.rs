//! Hard storage quota
//!
//! Admission and the usage-counter increment are a single atomic store
//! operation (`try_reserve_storage`), so two concurrent uploads can never
//! both pass against a stale counter. An `Allow` means the bytes are already
//! counted: the caller must [`QuotaGate::release`] them if the blob write
//! fails afterwards.

use std::sync::Arc;

use pinvault_shared::{AccountId, RecordStore, StorageReservation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{BillingError, BillingResult};
use crate::events::BillingEventLogger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("Storage quota exceeded: used={used}, incoming={incoming}, limit={limit}")]
pub struct QuotaExceeded {
    pub used: u64,
    pub incoming: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Bytes reserved; `used` includes them
    Allow { used: u64, limit: u64 },
    Reject(QuotaExceeded),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allow { .. })
    }
}

#[derive(Clone)]
pub struct QuotaGate {
    store: Arc<dyn RecordStore>,
    events: BillingEventLogger,
}

impl QuotaGate {
    pub fn new(store: Arc<dyn RecordStore>, events: BillingEventLogger) -> Self {
        Self { store, events }
    }

    /// Admit `incoming_bytes` for the account, reserving them on success.
    ///
    /// A post-upload total equal to the limit is admitted.
    pub async fn admit(&self, account_id: AccountId, incoming_bytes: u64) -> BillingResult<Admission> {
        match self.store.try_reserve_storage(account_id, incoming_bytes).await? {
            StorageReservation::Reserved { used, limit } => {
                tracing::debug!(
                    account_id = %account_id,
                    incoming_bytes,
                    used,
                    limit,
                    "Storage reserved"
                );
                Ok(Admission::Allow { used, limit })
            }
            StorageReservation::Exceeded { used, limit } => {
                tracing::info!(
                    account_id = %account_id,
                    incoming_bytes,
                    used,
                    limit,
                    "Upload rejected: storage quota exceeded"
                );
                self.events
                    .log_quota_rejected(account_id, used, incoming_bytes, limit)
                    .await;
                Ok(Admission::Reject(QuotaExceeded {
                    used,
                    incoming: incoming_bytes,
                    limit,
                }))
            }
        }
    }

    /// Read-only preview of whether `incoming_bytes` would be admitted right now
    pub async fn check(&self, account_id: AccountId, incoming_bytes: u64) -> BillingResult<Admission> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("account {}", account_id)))?;

        let used = account.storage_used_bytes;
        let limit = account.storage_limit_bytes;
        match used.checked_add(incoming_bytes) {
            Some(total) if total <= limit => Ok(Admission::Allow { used: total, limit }),
            _ => Ok(Admission::Reject(QuotaExceeded {
                used,
                incoming: incoming_bytes,
                limit,
            })),
        }
    }

    /// Give back a reservation whose upload did not complete
    pub async fn release(&self, account_id: AccountId, bytes: u64) -> BillingResult<u64> {
        let delta = i64::try_from(bytes)
            .map_err(|_| BillingError::InvalidInput(format!("release of {} bytes", bytes)))?;
        self.record_usage_delta(account_id, -delta).await
    }

    /// Apply a signed change to the usage counter (negative on delete). Returns the new total.
    pub async fn record_usage_delta(&self, account_id: AccountId, delta: i64) -> BillingResult<u64> {
        let used = self.store.adjust_storage(account_id, delta).await?;
        tracing::debug!(account_id = %account_id, delta, used, "Storage usage adjusted");
        Ok(used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinvault_shared::{InMemoryRecordStore, NewAccount, GIB};

    async fn setup(used: u64) -> (Arc<InMemoryRecordStore>, QuotaGate, AccountId) {
        let store = Arc::new(InMemoryRecordStore::new());
        let account = store
            .get_or_create_account(NewAccount::new("quota_user", "q@example.com").storage_limit(10 * GIB))
            .await
            .unwrap();
        if used > 0 {
            store.try_reserve_storage(account.id, used).await.unwrap();
        }
        let gate = QuotaGate::new(store.clone(), BillingEventLogger::new(store.clone()));
        (store, gate, account.id)
    }

    #[tokio::test]
    async fn test_upload_over_limit_rejected_with_figures() {
        let (store, gate, account_id) = setup(9 * GIB).await;

        let admission = gate.admit(account_id, 2 * GIB).await.unwrap();
        assert_eq!(
            admission,
            Admission::Reject(QuotaExceeded {
                used: 9 * GIB,
                incoming: 2 * GIB,
                limit: 10 * GIB,
            })
        );

        // Counter untouched, rejection audited
        let account = store.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.storage_used_bytes, 9 * GIB);
        let events = store.list_billing_events(account_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "QUOTA_REJECTED");
    }

    #[tokio::test]
    async fn test_exact_limit_admitted_one_byte_over_rejected() {
        let (_store, gate, account_id) = setup(9 * GIB).await;

        assert!(!gate.check(account_id, GIB + 1).await.unwrap().is_allowed());
        assert!(gate.check(account_id, GIB).await.unwrap().is_allowed());

        let admission = gate.admit(account_id, GIB).await.unwrap();
        assert_eq!(
            admission,
            Admission::Allow {
                used: 10 * GIB,
                limit: 10 * GIB
            }
        );
        assert!(!gate.admit(account_id, 1).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_release_and_delete_adjust_counter() {
        let (store, gate, account_id) = setup(0).await;

        assert!(gate.admit(account_id, 3 * GIB).await.unwrap().is_allowed());
        assert_eq!(gate.release(account_id, 3 * GIB).await.unwrap(), 0);

        assert!(gate.admit(account_id, 4 * GIB).await.unwrap().is_allowed());
        assert_eq!(gate.record_usage_delta(account_id, -(GIB as i64)).await.unwrap(), 3 * GIB);

        let account = store.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.storage_used_bytes, 3 * GIB);
    }

    #[tokio::test]
    async fn test_concurrent_admissions_never_jointly_exceed_limit() {
        let (store, gate, account_id) = setup(0).await;

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move { gate.admit(account_id, 4 * GIB).await.unwrap() })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap().is_allowed() {
                allowed += 1;
            }
        }

        assert_eq!(allowed, 2);
        let account = store.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.storage_used_bytes, 8 * GIB);
    }
}
