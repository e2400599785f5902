//! Client for the external OAuth provider.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use pgclone_common::AccessToken;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Error, Debug)]
pub enum OAuthError {
    #[error("HTTP request to OAuth provider failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("OAuth provider responded {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("OAuth provider did not return an email address")]
    MissingEmail,
}

pub type Result<T> = std::result::Result<T, OAuthError>;

/// The two halves of the authorization-code flow plus token refresh.
#[async_trait]
pub trait OAuthClient: Send + Sync {
    /// URL the browser is redirected to, carrying the caller's `state`.
    fn auth_code_url(&self, state: &str) -> String;

    /// Trade an authorization code for a token.
    async fn exchange(&self, code: &str) -> Result<AccessToken>;

    /// Trade a refresh token for a fresh access token.
    async fn refresh(&self, refresh_token: &str) -> Result<AccessToken>;

    /// Email address of the user an access token belongs to.
    async fn user_email(&self, access_token: &str) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
    pub auth_url: Url,
    pub token_url: Url,
    pub userinfo_url: Url,
    pub scopes: Vec<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl From<TokenResponse> for AccessToken {
    fn from(response: TokenResponse) -> Self {
        AccessToken {
            access_token: response.access_token,
            token_type: response.token_type.unwrap_or_else(|| "Bearer".to_string()),
            refresh_token: response.refresh_token,
            expiry: response
                .expires_in
                .map(|secs| Utc::now() + ChronoDuration::seconds(secs)),
        }
    }
}

#[derive(Deserialize)]
struct UserInfo {
    #[serde(default)]
    email: Option<String>,
}

/// [`OAuthClient`] that talks to a standard OAuth 2 provider over HTTP.
#[derive(Clone)]
pub struct HttpOAuthClient {
    http: reqwest::Client,
    config: OAuthConfig,
}

impl HttpOAuthClient {
    pub fn new(config: OAuthConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http, config })
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<AccessToken> {
        let response = self
            .http
            .post(self.config.token_url.clone())
            .form(params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(OAuthError::Provider {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let token: TokenResponse = response.json().await?;
        Ok(token.into())
    }
}

#[async_trait]
impl OAuthClient for HttpOAuthClient {
    fn auth_code_url(&self, state: &str) -> String {
        let mut url = self.config.auth_url.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_url)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair("state", state)
            .append_pair("access_type", "offline");
        url.into()
    }

    async fn exchange(&self, code: &str) -> Result<AccessToken> {
        debug!("Exchanging authorization code");
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &self.config.redirect_url),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<AccessToken> {
        let mut token = self
            .token_request(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", &self.config.client_id),
                ("client_secret", &self.config.client_secret),
            ])
            .await?;
        // Providers usually omit the refresh token from refresh responses
        if token.refresh_token.is_none() {
            token.refresh_token = Some(refresh_token.to_string());
        }
        Ok(token)
    }

    async fn user_email(&self, access_token: &str) -> Result<String> {
        let response = self
            .http
            .get(self.config.userinfo_url.clone())
            .bearer_auth(access_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(OAuthError::Provider {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let info: UserInfo = response.json().await?;
        info.email
            .filter(|email| !email.is_empty())
            .ok_or(OAuthError::MissingEmail)
    }
}
