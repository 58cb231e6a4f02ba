//! JWT bearer-token verification

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use super::{AuthError, AuthResult, Identity, IdentityVerifier};
use crate::config::Config;

/// Claims read from identity-provider tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (stable user id at the identity provider)
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    /// Expiration
    pub exp: i64,
}

/// HS256 verifier for identity-provider tokens
#[derive(Clone)]
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    audience: Option<String>,
    issuer: Option<String>,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            audience: None,
            issuer: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.auth_jwt_secret)
            .with_audience(config.auth_jwt_audience.clone())
            .with_issuer(config.auth_jwt_issuer.clone())
    }

    pub fn with_audience(mut self, audience: Option<String>) -> Self {
        self.audience = audience;
        self
    }

    pub fn with_issuer(mut self, issuer: Option<String>) -> Self {
        self.issuer = issuer;
        self
    }

    /// Validate and decode a token
    pub fn decode_claims(&self, token: &str) -> AuthResult<Claims> {
        // Pin the algorithm so a token cannot pick its own
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 60;
        let mut required = vec!["exp", "sub"];
        match &self.audience {
            Some(aud) => {
                validation.set_audience(&[aud]);
                required.push("aud");
            }
            None => validation.validate_aud = false,
        }
        if let Some(iss) = &self.issuer {
            validation.set_issuer(&[iss]);
            required.push("iss");
        }
        // A configured check only binds when the claim must be present
        validation.set_required_spec_claims(required.as_slice());

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(reason = ?e.kind(), "Bearer token rejected");
                AuthError::Unauthenticated
            })
    }
}

impl IdentityVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> AuthResult<Identity> {
        let claims = self.decode_claims(token)?;
        if claims.sub.trim().is_empty() {
            return Err(AuthError::Unauthenticated);
        }

        Ok(Identity {
            subject: claims.sub,
            email: claims.email.filter(|e| !e.trim().is_empty()),
            name: claims.name.filter(|n| !n.trim().is_empty()),
        })
    }
}
