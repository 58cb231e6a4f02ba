//! pinvault API Library
//!
//! Service layer behind the HTTP routes: configuration, bearer-token
//! identity, the IPFS blob store and the upload service.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod auth;
pub mod config;
pub mod error;
pub mod ipfs;
pub mod state;
pub mod uploads;

pub use auth::{AuthError, Identity, IdentityVerifier, JwtVerifier};
pub use config::{Config, ConfigError};
pub use error::{UploadError, UploadResult};
pub use ipfs::{BlobStore, IpfsError, KuboClient};
pub use state::AppState;
pub use uploads::{Checkout, UploadRequest, UploadService};
