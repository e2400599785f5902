//! # pgclone Rust SDK
//!
//! Typed client for the pgclone API.
//!
//! ```no_run
//! use pgclone_sdk::PgcloneClient;
//!
//! # async fn run() -> Result<(), pgclone_sdk::SdkError> {
//! let client = PgcloneClient::new("https://pgclone.example.com", "refresh-token")?;
//!
//! let image = client.get_latest_image().await?;
//! let instance = client.create_instance(image.id).await?;
//! println!("postgres listening on port {}", instance.port);
//!
//! client.destroy_instance(instance.id).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Obtaining a refresh token is a two-legged flow: open
//! [`PgcloneClient::authenticate_url`] in a browser and, at the same time,
//! call [`PgcloneClient::create_access_token`] with the same state.

use pgclone_common::{AccessToken, Image, ImageId, Instance, InstanceId, NewImage};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub use pgclone_common as common;

/// Sent with every request so the server can spot outdated clients.
pub const VERSION_HEADER: &str = "pgclone-version";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Token creation blocks server side until the browser flow finishes.
const ACCESS_TOKEN_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Error, Debug)]
pub enum SdkError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("API error ({status}): {}", .error.detail)]
    Api { status: u16, error: ApiErrorBody },

    #[error("Unexpected response ({status}): {body}")]
    UnexpectedResponse { status: u16, body: String },

    #[error("no ready images available")]
    NoImagesAvailable,
}

/// Error document returned by the server for every failed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub id: String,
    pub status: String,
    pub code: String,
    pub title: String,
    pub detail: String,
    #[serde(default)]
    pub source: Option<ErrorSource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSource {
    #[serde(default)]
    pub pointer: Option<String>,
    #[serde(default)]
    pub parameter: Option<String>,
}

#[derive(Serialize)]
struct CreateInstanceRequest {
    image_id: String,
}

#[derive(Serialize)]
struct CreateAccessTokenRequest<'a> {
    state: &'a str,
}

/// A fresh random state for the access-token flow.
pub fn new_state() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Clone)]
pub struct PgcloneClient {
    client: Client,
    base_url: Url,
    refresh_token: String,
}

impl PgcloneClient {
    pub fn new(base_url: &str, refresh_token: impl Into<String>) -> Result<Self, SdkError> {
        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self {
            client,
            base_url: Url::parse(base_url)?,
            refresh_token: refresh_token.into(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Page the user's browser must visit to grant access for `state`.
    pub fn authenticate_url(&self, state: &str) -> Result<Url, SdkError> {
        let mut url = self.base_url.join("authenticate")?;
        url.query_pairs_mut().append_pair("state", state);
        Ok(url)
    }

    pub async fn list_images(&self) -> Result<Vec<Image>, SdkError> {
        self.json(self.request(Method::GET, "images")?).await
    }

    pub async fn get_image(&self, id: ImageId) -> Result<Image, SdkError> {
        self.json(self.request(Method::GET, &format!("images/{id}"))?)
            .await
    }

    /// The most recently updated image that is ready for use.
    pub async fn get_latest_image(&self) -> Result<Image, SdkError> {
        self.list_images()
            .await?
            .into_iter()
            .filter(|image| image.ready)
            .max_by_key(|image| image.updated_at)
            .ok_or(SdkError::NoImagesAvailable)
    }

    pub async fn create_image(&self, image: &NewImage) -> Result<Image, SdkError> {
        self.json(self.request(Method::POST, "images")?.json(image))
            .await
    }

    pub async fn finalise_image(&self, id: ImageId) -> Result<Image, SdkError> {
        self.json(self.request(Method::POST, &format!("images/{id}/done"))?)
            .await
    }

    pub async fn destroy_image(&self, id: ImageId) -> Result<(), SdkError> {
        self.empty(self.request(Method::DELETE, &format!("images/{id}"))?)
            .await
    }

    pub async fn list_instances(&self) -> Result<Vec<Instance>, SdkError> {
        self.json(self.request(Method::GET, "instances")?).await
    }

    pub async fn get_instance(&self, id: InstanceId) -> Result<Instance, SdkError> {
        self.json(self.request(Method::GET, &format!("instances/{id}"))?)
            .await
    }

    pub async fn create_instance(&self, image_id: ImageId) -> Result<Instance, SdkError> {
        let body = CreateInstanceRequest {
            image_id: image_id.to_string(),
        };
        self.json(self.request(Method::POST, "instances")?.json(&body))
            .await
    }

    pub async fn destroy_instance(&self, id: InstanceId) -> Result<(), SdkError> {
        self.empty(self.request(Method::DELETE, &format!("instances/{id}"))?)
            .await
    }

    /// Wait for the browser flow started with `state` to produce a token.
    pub async fn create_access_token(&self, state: &str) -> Result<AccessToken, SdkError> {
        let url = self.base_url.join("access_tokens")?;
        let request = self
            .client
            .post(url)
            .header(VERSION_HEADER, VERSION)
            .timeout(ACCESS_TOKEN_TIMEOUT)
            .json(&CreateAccessTokenRequest { state });
        self.json(request).await
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, SdkError> {
        let url = self.base_url.join(path)?;
        Ok(self
            .client
            .request(method, url)
            .bearer_auth(&self.refresh_token)
            .header(VERSION_HEADER, VERSION))
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, SdkError> {
        let response = check(request.send().await?).await?;
        Ok(response.json().await?)
    }

    async fn empty(&self, request: RequestBuilder) -> Result<(), SdkError> {
        check(request.send().await?).await?;
        Ok(())
    }
}

async fn check(response: Response) -> Result<Response, SdkError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await?;
    match serde_json::from_str::<ApiErrorBody>(&body) {
        Ok(error) => Err(SdkError::Api {
            status: status.as_u16(),
            error,
        }),
        Err(_) => Err(SdkError::UnexpectedResponse {
            status: status.as_u16(),
            body,
        }),
    }
}
