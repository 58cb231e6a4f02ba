//! Billing error types

use pinvault_shared::{OrderStatus, StoreError};
use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Payment provider error: {0}")]
    PaymentProvider(String),

    /// Deliberately carries no detail about which check failed
    #[error("Webhook verification failed")]
    WebhookVerificationFailed,

    #[error("Invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Concurrent modification detected: {0}")]
    ConcurrentModification(String),

    #[error("Invalid order transition from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BillingError::PaymentProvider(_) | BillingError::ConcurrentModification(_)
        )
    }
}

impl From<StoreError> for BillingError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => BillingError::NotFound(what),
            StoreError::Conflict(what) => BillingError::ConcurrentModification(what),
            StoreError::InvalidTransition { from, to } => BillingError::InvalidTransition { from, to },
            StoreError::Corrupt(what) => BillingError::Internal(what),
            StoreError::Database(what) => BillingError::Database(what),
            StoreError::Config(what) => BillingError::ConfigurationInvalid(what),
        }
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::PaymentProvider(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
