// Shared domain types and the privileged executor boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type ImageId = i64;
pub type InstanceId = i64;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("Internal executor error: {0}")]
    Internal(String),
}

pub type ExecutorResult<T> = std::result::Result<T, ExecutorError>;

/// An anonymised, point-in-time snapshot of the source database.
///
/// `anon` holds the anonymisation script. It is only populated when a single
/// image is fetched; listings leave it empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: ImageId,
    pub backed_up_at: DateTime<Utc>,
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anon: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Image {
    /// Copy of this image with the anonymisation script removed.
    pub fn redacted(&self) -> Self {
        Self {
            anon: None,
            ..self.clone()
        }
    }
}

/// Attributes supplied when registering a new image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewImage {
    pub backed_up_at: DateTime<Utc>,
    #[serde(default)]
    pub anon: String,
}

/// A running database provisioned from a ready image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub image_id: ImageId,
    pub port: u16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// OAuth token as handed back to API clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Privileged side effects the server cannot perform itself.
///
/// Every call is opaque: the only contract is success or failure. Snapshot
/// layout, certificate issuance and the post-start access checks all live
/// behind the implementation.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Materialise writable storage that an image upload lands in.
    async fn create_snapshot(&self, image_id: ImageId) -> ExecutorResult<()>;

    /// Anonymise the uploaded data and freeze it into a usable image.
    async fn finalize_image(&self, image_id: ImageId) -> ExecutorResult<()>;

    /// Remove the storage backing an image.
    async fn destroy_image(&self, image_id: ImageId) -> ExecutorResult<()>;

    /// Clone the image, issue certificates, start Postgres on `port` and
    /// verify that only the provisioned client identity can connect.
    async fn provision_instance(
        &self,
        image_id: ImageId,
        instance_id: InstanceId,
        port: u16,
    ) -> ExecutorResult<()>;

    /// Stop the database and remove the instance storage.
    async fn teardown_instance(&self, instance_id: InstanceId) -> ExecutorResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn image() -> Image {
        let at = Utc.with_ymd_and_hms(2016, 1, 2, 3, 4, 5).unwrap();
        Image {
            id: 1,
            backed_up_at: at,
            ready: false,
            anon: Some("UPDATE users SET email = 'x';".to_string()),
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn redacted_image_omits_anon_from_json() {
        let json = serde_json::to_value(image().redacted()).unwrap();
        assert!(json.get("anon").is_none());
        assert_eq!(json["backed_up_at"], "2016-01-02T03:04:05Z");
        assert_eq!(json["ready"], false);
    }

    #[test]
    fn full_image_carries_anon() {
        let json = serde_json::to_value(image()).unwrap();
        assert_eq!(json["anon"], "UPDATE users SET email = 'x';");
    }

    #[test]
    fn access_token_defaults_token_type() {
        let token: AccessToken =
            serde_json::from_str(r#"{"access_token":"abc","refresh_token":"def"}"#).unwrap();
        assert_eq!(token.token_type, "Bearer");
        assert_eq!(token.refresh_token.as_deref(), Some("def"));
        assert!(token.expiry.is_none());
    }
}
