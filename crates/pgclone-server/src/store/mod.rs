//! Persistence for images and instances.
//!
//! Two backends implement the same traits: an in-memory store for development
//! and tests, and a Postgres store for production. Both enforce the `ready`
//! transition with a compare-and-swap rather than an external lock.

use async_trait::async_trait;
use pgclone_common::{Image, ImageId, Instance, InstanceId, NewImage};
use thiserror::Error;

mod memory;
mod postgres;

pub use memory::{InMemoryImageStore, InMemoryInstanceStore};
pub use postgres::{connect_postgres, PgImageStore, PgInstanceStore, SCHEMA_SQL};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    /// The conditional update matched no row: someone else already moved it.
    #[error("image {id} was not updated: ready is no longer {expected_ready}")]
    Stale { id: ImageId, expected_ready: bool },

    #[error("{kind} {id} already exists")]
    Duplicate { kind: &'static str, id: i64 },

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Attributes for inserting an instance whose id was reserved up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewInstance {
    pub id: InstanceId,
    pub image_id: ImageId,
    pub port: u16,
}

#[async_trait]
pub trait ImageStore: Send + Sync {
    /// All images, oldest id first, without their anonymisation scripts.
    async fn list(&self) -> Result<Vec<Image>>;

    /// A single image including `anon`.
    async fn get(&self, id: ImageId) -> Result<Image>;

    /// Insert a new image with `ready = false`.
    async fn create(&self, image: NewImage) -> Result<Image>;

    /// Set `ready = true` only if the stored value still equals `image.ready`.
    ///
    /// Fails with [`StoreError::Stale`] when the row exists but no longer
    /// matches, and [`StoreError::NotFound`] when it does not exist.
    async fn mark_as_ready(&self, image: &Image) -> Result<Image>;

    /// Delete the row. Deleting a missing id is not an error.
    async fn destroy(&self, image: &Image) -> Result<()>;
}

#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn list(&self) -> Result<Vec<Instance>>;

    async fn get(&self, id: InstanceId) -> Result<Instance>;

    /// Reserve an id without persisting anything.
    async fn next_id(&self) -> Result<InstanceId>;

    async fn create(&self, instance: NewInstance) -> Result<Instance>;

    async fn destroy(&self, instance: &Instance) -> Result<()>;

    async fn count_for_image(&self, image_id: ImageId) -> Result<usize>;
}
