//! Upload service error types

use pinvault_billing::{BillingError, QuotaExceeded};
use pinvault_shared::StoreError;

use crate::auth::AuthError;
use crate::ipfs::IpfsError;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    // Authentication
    #[error("Authentication required")]
    Unauthenticated,

    // Quota and billing
    #[error("Storage quota exceeded: {used} of {limit} bytes used, upload needs {incoming}")]
    QuotaExceeded { used: u64, incoming: u64, limit: u64 },
    #[error("Payment required: {reason}")]
    PaymentRequired { reason: String },

    // Resources
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Collaborators
    #[error("Blob store error: {0}")]
    BlobStore(#[from] IpfsError),
    #[error("Billing error: {0}")]
    Billing(#[from] BillingError),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl UploadError {
    /// HTTP status the route layer should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            UploadError::Unauthenticated => 401,
            UploadError::QuotaExceeded { .. } => 413,
            UploadError::PaymentRequired { .. } => 402,
            UploadError::NotFound(_) => 404,
            UploadError::BadRequest(_) => 400,
            UploadError::BlobStore(IpfsError::Timeout) => 504,
            UploadError::BlobStore(_) => 502,
            UploadError::Billing(e) if e.is_transient() => 503,
            UploadError::Billing(_) | UploadError::Store(_) => 500,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            UploadError::Unauthenticated => "UNAUTHENTICATED",
            UploadError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            UploadError::PaymentRequired { .. } => "PAYMENT_REQUIRED",
            UploadError::NotFound(_) => "NOT_FOUND",
            UploadError::BadRequest(_) => "BAD_REQUEST",
            UploadError::BlobStore(_) => "BLOB_STORE_ERROR",
            UploadError::Billing(_) => "BILLING_ERROR",
            UploadError::Store(_) => "DATABASE_ERROR",
        }
    }

    /// Whether the caller can fix the problem themselves
    pub fn is_user_error(&self) -> bool {
        self.status_code() < 500
    }
}

impl From<AuthError> for UploadError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Unauthenticated => UploadError::Unauthenticated,
        }
    }
}

impl From<QuotaExceeded> for UploadError {
    fn from(err: QuotaExceeded) -> Self {
        UploadError::QuotaExceeded {
            used: err.used,
            incoming: err.incoming,
            limit: err.limit,
        }
    }
}

pub type UploadResult<T> = Result<T, UploadError>;
