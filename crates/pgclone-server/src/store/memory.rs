use super::{ImageStore, InstanceStore, NewInstance, Result, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use pgclone_common::{Image, ImageId, Instance, InstanceId, NewImage};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

// In-memory storage implementation for development/testing
#[derive(Clone, Default)]
pub struct InMemoryImageStore {
    images: Arc<RwLock<BTreeMap<ImageId, Image>>>,
    last_id: Arc<AtomicI64>,
}

impl InMemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ImageStore for InMemoryImageStore {
    async fn list(&self) -> Result<Vec<Image>> {
        Ok(self
            .images
            .read()
            .await
            .values()
            .map(Image::redacted)
            .collect())
    }

    async fn get(&self, id: ImageId) -> Result<Image> {
        self.images
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { kind: "image", id })
    }

    async fn create(&self, image: NewImage) -> Result<Image> {
        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();
        let stored = Image {
            id,
            backed_up_at: image.backed_up_at,
            ready: false,
            anon: Some(image.anon),
            created_at: now,
            updated_at: now,
        };

        let returned = stored.redacted();
        self.images.write().await.insert(id, stored);
        Ok(returned)
    }

    async fn mark_as_ready(&self, image: &Image) -> Result<Image> {
        let mut images = self.images.write().await;
        let stored = images.get_mut(&image.id).ok_or(StoreError::NotFound {
            kind: "image",
            id: image.id,
        })?;

        if stored.ready != image.ready {
            return Err(StoreError::Stale {
                id: image.id,
                expected_ready: image.ready,
            });
        }

        stored.ready = true;
        stored.updated_at = Utc::now();
        Ok(stored.redacted())
    }

    async fn destroy(&self, image: &Image) -> Result<()> {
        self.images.write().await.remove(&image.id);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryInstanceStore {
    instances: Arc<RwLock<BTreeMap<InstanceId, Instance>>>,
    last_id: Arc<AtomicI64>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn list(&self) -> Result<Vec<Instance>> {
        Ok(self.instances.read().await.values().cloned().collect())
    }

    async fn get(&self, id: InstanceId) -> Result<Instance> {
        self.instances
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound {
                kind: "instance",
                id,
            })
    }

    async fn next_id(&self) -> Result<InstanceId> {
        Ok(self.last_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn create(&self, instance: NewInstance) -> Result<Instance> {
        let mut instances = self.instances.write().await;
        if instances.contains_key(&instance.id) {
            return Err(StoreError::Duplicate {
                kind: "instance",
                id: instance.id,
            });
        }

        let now = Utc::now();
        let stored = Instance {
            id: instance.id,
            image_id: instance.image_id,
            port: instance.port,
            created_at: now,
            updated_at: now,
        };
        instances.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn destroy(&self, instance: &Instance) -> Result<()> {
        self.instances.write().await.remove(&instance.id);
        Ok(())
    }

    async fn count_for_image(&self, image_id: ImageId) -> Result<usize> {
        Ok(self
            .instances
            .read()
            .await
            .values()
            .filter(|instance| instance.image_id == image_id)
            .count())
    }
}
