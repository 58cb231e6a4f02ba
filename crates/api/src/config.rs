//! Application configuration

use std::env;
use std::time::Duration;

use pinvault_billing::BillingConfig;
use pinvault_shared::DEFAULT_STORAGE_LIMIT_BYTES;

pub const DEFAULT_IPFS_API_URL: &str = "http://127.0.0.1:5001";
pub const DEFAULT_IPFS_TIMEOUT_SECS: u64 = 60;

/// Minimum length for the bearer-token signing secret
pub const MIN_SECRET_LEN: usize = 32;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // IPFS
    pub ipfs_api_url: String,
    pub ipfs_timeout: Duration,

    // Authentication
    pub auth_jwt_secret: String,
    pub auth_jwt_audience: Option<String>,
    pub auth_jwt_issuer: Option<String>,

    // Storage
    pub default_storage_limit_bytes: u64,

    // Billing
    pub enforce_billing_access: bool,
    pub billing: BillingConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // IPFS
            ipfs_api_url: env::var("IPFS_API_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| DEFAULT_IPFS_API_URL.to_string()),
            ipfs_timeout: Duration::from_secs(
                env::var("IPFS_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .filter(|secs| *secs > 0)
                    .unwrap_or(DEFAULT_IPFS_TIMEOUT_SECS),
            ),

            // Authentication
            auth_jwt_secret: {
                let secret =
                    env::var("AUTH_JWT_SECRET").map_err(|_| ConfigError::Missing("AUTH_JWT_SECRET"))?;
                if secret.len() < MIN_SECRET_LEN {
                    return Err(ConfigError::WeakSecret(
                        "AUTH_JWT_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },
            auth_jwt_audience: non_empty_var("AUTH_JWT_AUDIENCE"),
            auth_jwt_issuer: non_empty_var("AUTH_JWT_ISSUER"),

            // Storage
            default_storage_limit_bytes: match env::var("DEFAULT_STORAGE_LIMIT_BYTES") {
                Ok(raw) => match raw.trim().parse::<u64>() {
                    Ok(bytes) if bytes > 0 => bytes,
                    _ => return Err(ConfigError::Invalid("DEFAULT_STORAGE_LIMIT_BYTES", raw)),
                },
                Err(_) => DEFAULT_STORAGE_LIMIT_BYTES,
            },

            // Billing
            enforce_billing_access: env::var("ENFORCE_BILLING_ACCESS")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            billing: BillingConfig::from_env(),
        })
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
    #[error("Invalid value for {0}: {1:?}")]
    Invalid(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const SECRET: &str = "test-auth-secret-must-be-at-least-32-characters";

    fn cleanup_config() {
        for key in [
            "AUTH_JWT_SECRET",
            "AUTH_JWT_AUDIENCE",
            "AUTH_JWT_ISSUER",
            "IPFS_API_URL",
            "IPFS_TIMEOUT_SECS",
            "DEFAULT_STORAGE_LIMIT_BYTES",
            "ENFORCE_BILLING_ACCESS",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        cleanup_config();
        env::set_var("AUTH_JWT_SECRET", SECRET);

        let config = Config::from_env().unwrap();
        assert_eq!(config.ipfs_api_url, DEFAULT_IPFS_API_URL);
        assert_eq!(config.ipfs_timeout, Duration::from_secs(60));
        assert_eq!(config.default_storage_limit_bytes, DEFAULT_STORAGE_LIMIT_BYTES);
        assert!(config.enforce_billing_access);
        assert!(config.auth_jwt_audience.is_none());

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_secret_validation() {
        cleanup_config();
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Missing("AUTH_JWT_SECRET"))
        ));

        env::set_var("AUTH_JWT_SECRET", "too-short");
        assert!(matches!(Config::from_env(), Err(ConfigError::WeakSecret(_))));

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_overrides() {
        cleanup_config();
        env::set_var("AUTH_JWT_SECRET", SECRET);
        env::set_var("AUTH_JWT_AUDIENCE", "pinvault");
        env::set_var("IPFS_API_URL", "http://ipfs:5001/");
        env::set_var("IPFS_TIMEOUT_SECS", "0");
        env::set_var("DEFAULT_STORAGE_LIMIT_BYTES", "1073741824");
        env::set_var("ENFORCE_BILLING_ACCESS", "false");

        let config = Config::from_env().unwrap();
        assert_eq!(config.ipfs_api_url, "http://ipfs:5001");
        assert_eq!(config.ipfs_timeout, Duration::from_secs(60));
        assert_eq!(config.auth_jwt_audience.as_deref(), Some("pinvault"));
        assert_eq!(config.default_storage_limit_bytes, 1_073_741_824);
        assert!(!config.enforce_billing_access);

        env::set_var("DEFAULT_STORAGE_LIMIT_BYTES", "lots");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("DEFAULT_STORAGE_LIMIT_BYTES", _))
        ));

        cleanup_config();
    }
}
