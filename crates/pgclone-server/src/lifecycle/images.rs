use super::{ImageClaims, LifecycleError, Result};
use crate::store::{ImageStore, InstanceStore};
use pgclone_common::{Executor, Image, ImageId, NewImage};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Image creation, finalisation and removal.
#[derive(Clone)]
pub struct ImageLifecycle {
    images: Arc<dyn ImageStore>,
    instances: Arc<dyn InstanceStore>,
    executor: Arc<dyn Executor>,
    claims: ImageClaims,
}

impl ImageLifecycle {
    pub fn new(
        images: Arc<dyn ImageStore>,
        instances: Arc<dyn InstanceStore>,
        executor: Arc<dyn Executor>,
        claims: ImageClaims,
    ) -> Self {
        Self {
            images,
            instances,
            executor,
            claims,
        }
    }

    pub async fn list_images(&self) -> Result<Vec<Image>> {
        Ok(self.images.list().await?)
    }

    pub async fn get_image(&self, id: ImageId) -> Result<Image> {
        Ok(self.images.get(id).await?)
    }

    /// Register the image and create the storage its upload will land in.
    #[instrument(skip(self, image), fields(backed_up_at = %image.backed_up_at))]
    pub async fn create_image(&self, image: NewImage) -> Result<Image> {
        let created = self.images.create(image).await?;

        if let Err(e) = self.executor.create_snapshot(created.id).await {
            error!(image_id = created.id, error = %e, "Failed to create upload storage");
            if let Err(cleanup) = self.images.destroy(&created).await {
                warn!(image_id = created.id, error = %cleanup, "Failed to remove orphaned image row");
            }
            return Err(e.into());
        }

        info!(image_id = created.id, "Created image");
        Ok(created)
    }

    /// Run the anonymisation pipeline and flip the image to ready.
    #[instrument(skip(self))]
    pub async fn finalise_image(&self, id: ImageId) -> Result<Image> {
        let _claim = self.claims.finalise(id)?;
        let image = self.images.get(id).await?;
        if image.ready {
            return Err(LifecycleError::Conflict(format!(
                "image {id} is already finalised"
            )));
        }

        self.executor.finalize_image(id).await.map_err(|e| {
            error!(image_id = id, error = %e, "Image finalisation failed");
            LifecycleError::from(e)
        })?;

        // `image` still carries the ready=false we observed; a concurrent
        // finaliser that got there first makes this a conflict.
        let ready = self.images.mark_as_ready(&image).await?;
        info!(image_id = id, "Image is ready");
        Ok(ready)
    }

    /// Remove the image snapshot, then its row.
    #[instrument(skip(self))]
    pub async fn destroy_image(&self, id: ImageId) -> Result<()> {
        // Held until the row is gone so no provisioning can start from a
        // half-deleted snapshot.
        let _claim = self.claims.destroy(id)?;
        let image = self.images.get(id).await?;

        let in_use = self.instances.count_for_image(id).await?;
        if in_use > 0 {
            return Err(LifecycleError::Conflict(format!(
                "image {id} is used by {in_use} instance(s)"
            )));
        }

        self.executor.destroy_image(id).await.map_err(|e| {
            error!(image_id = id, error = %e, "Failed to remove image snapshot");
            LifecycleError::from(e)
        })?;
        self.images.destroy(&image).await?;

        info!(image_id = id, "Destroyed image");
        Ok(())
    }
}
