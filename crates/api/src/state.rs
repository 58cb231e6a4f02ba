//! Shared service state

use std::sync::Arc;

use pinvault_billing::{BillingService, CashfreeClient, PaymentProvider};
use pinvault_shared::RecordStore;

use crate::auth::{IdentityVerifier, JwtVerifier};
use crate::config::Config;
use crate::ipfs::{BlobStore, KuboClient};
use crate::uploads::UploadService;

/// Everything a request handler needs, built once at startup
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn RecordStore>,
    pub billing: Arc<BillingService>,
    pub uploads: Arc<UploadService>,
}

impl AppState {
    /// Wire services around explicit collaborators
    pub fn new(
        config: Config,
        store: Arc<dyn RecordStore>,
        provider: Arc<dyn PaymentProvider>,
        blobs: Arc<dyn BlobStore>,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Self {
        let billing = Arc::new(BillingService::new(store.clone(), provider, config.billing.clone()));
        let uploads = Arc::new(UploadService::new(
            verifier,
            store.clone(),
            blobs,
            billing.clone(),
            &config,
        ));

        Self {
            config: Arc::new(config),
            store,
            billing,
            uploads,
        }
    }

    /// Production wiring: Cashfree, the configured Kubo node and HS256 tokens
    pub fn from_config(config: Config, store: Arc<dyn RecordStore>) -> anyhow::Result<Self> {
        let provider = Arc::new(CashfreeClient::from_env()?);
        let blobs = Arc::new(KuboClient::from_config(&config)?);
        let verifier = Arc::new(JwtVerifier::from_config(&config));

        tracing::info!(
            ipfs_api_url = %config.ipfs_api_url,
            enforce_billing_access = config.enforce_billing_access,
            "Services initialized"
        );
        Ok(Self::new(config, store, provider, blobs, verifier))
    }
}
