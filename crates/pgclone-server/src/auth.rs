//! Bearer-credential authenticators used by the request chain.

use crate::oauth::{OAuthClient, OAuthError};
use async_trait::async_trait;
use axum::http::{header::AUTHORIZATION, HeaderMap};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Identity reported for requests carrying the shared secret.
pub const AUTOMATION_IDENTITY: &str = "automation";

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingCredentials,

    #[error("malformed authorization header")]
    MalformedHeader,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("{email} is not in the allowed domain {domain}")]
    DomainNotAllowed { email: String, domain: String },

    #[error("OAuth provider rejected the token: {0}")]
    Provider(#[from] OAuthError),
}

/// Resolves the caller's identity from request headers.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<String, AuthError>;
}

/// The token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingCredentials)?
        .to_str()
        .map_err(|_| AuthError::MalformedHeader)?;

    let (scheme, token) = value.split_once(' ').ok_or(AuthError::MalformedHeader)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::MalformedHeader);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::MissingCredentials);
    }
    Ok(token)
}

/// Accepts a single static secret, for automation that cannot do OAuth.
pub struct SharedSecretAuthenticator {
    digest: [u8; 32],
}

impl SharedSecretAuthenticator {
    pub fn new(secret: &str) -> Self {
        Self {
            digest: Sha256::digest(secret.as_bytes()).into(),
        }
    }
}

#[async_trait]
impl Authenticator for SharedSecretAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<String, AuthError> {
        let token = bearer_token(headers)?;
        let presented: [u8; 32] = Sha256::digest(token.as_bytes()).into();

        // Fixed-length digests compared without early exit
        let diff = presented
            .iter()
            .zip(self.digest.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff != 0 {
            return Err(AuthError::InvalidCredentials);
        }
        Ok(AUTOMATION_IDENTITY.to_string())
    }
}

/// Treats the bearer as an OAuth refresh token and resolves it to the user's
/// email address at the provider.
pub struct OAuthAuthenticator {
    client: Arc<dyn OAuthClient>,
    allowed_domain: Option<String>,
}

impl OAuthAuthenticator {
    pub fn new(client: Arc<dyn OAuthClient>, allowed_domain: Option<String>) -> Self {
        Self {
            client,
            allowed_domain,
        }
    }
}

#[async_trait]
impl Authenticator for OAuthAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<String, AuthError> {
        let refresh_token = bearer_token(headers)?;
        let token = self.client.refresh(refresh_token).await?;
        let email = self.client.user_email(&token.access_token).await?;

        if let Some(domain) = &self.allowed_domain {
            let in_domain = email
                .rsplit_once('@')
                .is_some_and(|(_, d)| d.eq_ignore_ascii_case(domain));
            if !in_domain {
                return Err(AuthError::DomainNotAllowed {
                    email,
                    domain: domain.clone(),
                });
            }
        }

        Ok(email)
    }
}

/// Tries each authenticator in turn and returns the first identity found.
pub struct ChainedAuthenticator {
    authenticators: Vec<Arc<dyn Authenticator>>,
}

impl ChainedAuthenticator {
    pub fn new(authenticators: Vec<Arc<dyn Authenticator>>) -> Self {
        Self { authenticators }
    }
}

#[async_trait]
impl Authenticator for ChainedAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<String, AuthError> {
        let mut last = AuthError::MissingCredentials;
        for authenticator in &self.authenticators {
            match authenticator.authenticate(headers).await {
                Ok(identity) => return Ok(identity),
                Err(e) => {
                    debug!(error = %e, "Authenticator declined request");
                    last = e;
                }
            }
        }
        Err(last)
    }
}
