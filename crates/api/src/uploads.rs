//! Upload service
//!
//! Every operation starts from a bearer token. The first authenticated call
//! for a subject creates its account.
//!
//! Upload order matters: billing access, then an atomic quota reservation,
//! then the blob write, then the record. Any failure after the reservation
//! gives the bytes back so a failed upload never counts against the quota.

use std::sync::Arc;

use bytes::Bytes;
use pinvault_billing::{Admission, BillingCheckOutcome, BillingService, CustomerDetails, UsageSummary};
use pinvault_shared::{Account, NewAccount, Order, RecordStore, StoredObject};
use time::OffsetDateTime;

use crate::auth::IdentityVerifier;
use crate::config::Config;
use crate::error::{UploadError, UploadResult};
use crate::ipfs::{BlobStore, BlobStream};

/// A blob to store for the caller
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub filename: Option<String>,
    pub data: Bytes,
    /// Pinned blobs count toward the monthly bill
    pub pin: bool,
}

/// What the caller owes for the current billing period
#[derive(Debug, Clone, PartialEq)]
pub enum Checkout {
    /// Usage is within the free tier
    NothingDue,
    Paid(Order),
    /// Pay through this order's session or link
    Due(Order),
}

pub struct UploadService {
    verifier: Arc<dyn IdentityVerifier>,
    store: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    billing: Arc<BillingService>,
    default_storage_limit_bytes: u64,
    enforce_billing_access: bool,
}

impl UploadService {
    pub fn new(
        verifier: Arc<dyn IdentityVerifier>,
        store: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobStore>,
        billing: Arc<BillingService>,
        config: &Config,
    ) -> Self {
        Self {
            verifier,
            store,
            blobs,
            billing,
            default_storage_limit_bytes: config.default_storage_limit_bytes,
            enforce_billing_access: config.enforce_billing_access,
        }
    }

    /// Resolve the caller's account, creating it on first sight
    pub async fn authenticate(&self, token: &str) -> UploadResult<Account> {
        let identity = self.verifier.verify(token)?;
        let new = NewAccount::new(identity.subject, identity.email.unwrap_or_default())
            .display_name(identity.name)
            .storage_limit(self.default_storage_limit_bytes);
        Ok(self.store.get_or_create_account(new).await?)
    }

    pub async fn upload(&self, token: &str, request: UploadRequest) -> UploadResult<StoredObject> {
        let account = self.authenticate(token).await?;
        let size = request.data.len() as u64;
        if size == 0 {
            return Err(UploadError::BadRequest("empty upload".to_string()));
        }

        if self.enforce_billing_access {
            let today = OffsetDateTime::now_utc().date();
            let decision = self.billing.check_access(account.id, today).await?;
            if !decision.allowed {
                tracing::info!(account_id = %account.id, "Upload blocked: payment outstanding");
                return Err(UploadError::PaymentRequired {
                    reason: decision.reason.unwrap_or_else(|| "payment outstanding".to_string()),
                });
            }
        }

        match self.billing.quota.admit(account.id, size).await? {
            Admission::Allow { .. } => {}
            Admission::Reject(exceeded) => return Err(exceeded.into()),
        }

        match self.store_blob(&account, request, size).await {
            Ok(object) => {
                tracing::info!(
                    account_id = %account.id,
                    cid = %object.cid,
                    size_bytes = object.size_bytes,
                    pinned = object.is_pinned,
                    "Upload stored"
                );
                Ok(object)
            }
            Err(e) => {
                if let Err(release_err) = self.billing.quota.release(account.id, size).await {
                    tracing::error!(
                        account_id = %account.id,
                        bytes = size,
                        error = %release_err,
                        "Failed to release storage reservation"
                    );
                }
                tracing::warn!(account_id = %account.id, error = %e, "Upload failed");
                Err(e)
            }
        }
    }

    async fn store_blob(&self, account: &Account, request: UploadRequest, size: u64) -> UploadResult<StoredObject> {
        let added = self.blobs.add(request.filename.as_deref(), request.data).await?;
        if request.pin {
            self.blobs.pin(&added.cid).await?;
        }

        let object = StoredObject::new(account.id, added.cid, size, request.pin).with_filename(request.filename);
        Ok(self.store.insert_object(object).await?)
    }

    /// Stream a blob the caller owns
    pub async fn fetch(&self, token: &str, cid: &str) -> UploadResult<BlobStream> {
        let account = self.authenticate(token).await?;
        self.owned_object(&account, cid).await?;
        Ok(self.blobs.cat(cid).await?)
    }

    pub async fn pin(&self, token: &str, cid: &str) -> UploadResult<StoredObject> {
        let account = self.authenticate(token).await?;
        let object = self.owned_object(&account, cid).await?;
        if object.is_pinned {
            return Ok(object);
        }

        self.blobs.pin(cid).await?;
        let object = self.store.update_object_pin(object.id, true).await?;
        tracing::info!(account_id = %account.id, cid = %cid, "Object pinned");
        Ok(object)
    }

    pub async fn unpin(&self, token: &str, cid: &str) -> UploadResult<StoredObject> {
        let account = self.authenticate(token).await?;
        let object = self.owned_object(&account, cid).await?;
        if !object.is_pinned {
            return Ok(object);
        }

        let object = self.store.update_object_pin(object.id, false).await?;
        self.release_node_pin(cid).await?;
        tracing::info!(account_id = %account.id, cid = %cid, "Object unpinned");
        Ok(object)
    }

    /// Soft-delete the caller's object and return its bytes to the quota
    pub async fn delete(&self, token: &str, cid: &str) -> UploadResult<StoredObject> {
        let account = self.authenticate(token).await?;
        let object = self.owned_object(&account, cid).await?;

        // Releases the quota bytes in the same store operation
        let Some(deleted) = self.store.mark_object_deleted(object.id).await? else {
            return Err(UploadError::NotFound(format!("object {}", cid)));
        };

        if object.is_pinned {
            if let Err(e) = self.release_node_pin(cid).await {
                tracing::warn!(account_id = %account.id, cid = %cid, error = %e, "Failed to unpin deleted object");
            }
        }

        tracing::info!(account_id = %account.id, cid = %cid, size_bytes = deleted.size_bytes, "Object deleted");
        Ok(deleted)
    }

    /// Unpin on the node only once no live record still pins the CID
    async fn release_node_pin(&self, cid: &str) -> UploadResult<()> {
        let remaining = self.store.count_pinned_by_cid(cid).await?;
        if remaining > 0 {
            tracing::debug!(cid = %cid, remaining, "CID still pinned by other objects");
            return Ok(());
        }
        Ok(self.blobs.unpin(cid).await?)
    }

    /// Open (or reopen) payment for the caller's current billing period.
    ///
    /// Creates the order when payment is due and none is open, and starts
    /// polling the provider for it. The webhook usually settles it first.
    pub async fn checkout(&self, token: &str) -> UploadResult<Checkout> {
        let account = self.authenticate(token).await?;
        let customer = CustomerDetails::from_account(&account, &self.billing.config.default_customer_phone);
        let today = OffsetDateTime::now_utc().date();

        let checkout = match self.billing.run_billing_check(&account, &customer, today).await? {
            BillingCheckOutcome::NoCharge { .. } => Checkout::NothingDue,
            BillingCheckOutcome::AlreadyPaid(order) => Checkout::Paid(order),
            BillingCheckOutcome::Pending { order, created } => {
                if created {
                    let handle = self.billing.spawn_poller(&order);
                    tracing::info!(
                        account_id = %account.id,
                        order_id = %handle.order_id(),
                        amount = order.amount(),
                        "Checkout opened"
                    );
                }
                Checkout::Due(order)
            }
        };
        Ok(checkout)
    }

    pub async fn usage(&self, token: &str) -> UploadResult<UsageSummary> {
        let account = self.authenticate(token).await?;
        Ok(self.billing.usage_summary(account.id).await?)
    }

    async fn owned_object(&self, account: &Account, cid: &str) -> UploadResult<StoredObject> {
        self.store
            .get_object(account.id, cid)
            .await?
            .ok_or_else(|| UploadError::NotFound(format!("object {}", cid)))
    }
}
