//! Authentication module for pinvault

pub mod jwt;

pub use jwt::{Claims, JwtVerifier};

/// Caller identity established from a bearer token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Stable identity-provider subject
    pub subject: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Authentication required")]
    Unauthenticated,
}

pub type AuthResult<T> = Result<T, AuthError>;

/// Verifies bearer tokens issued by the identity provider
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, token: &str) -> AuthResult<Identity>;
}

/// Strip the `Bearer ` scheme from an Authorization header value
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}
