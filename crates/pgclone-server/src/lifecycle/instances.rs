use super::{ImageClaims, LifecycleError, PortAllocator, Result};
use crate::store::{ImageStore, InstanceStore, NewInstance};
use pgclone_common::{Executor, ImageId, Instance, InstanceId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

pub const DEFAULT_PROVISION_TIMEOUT: Duration = Duration::from_secs(300);

/// Creates and destroys instances.
///
/// An instance row only ever exists for a database that finished
/// provisioning: the id is reserved first, the executor runs, and the row is
/// inserted last. Teardown runs before the row is deleted. The image is
/// claimed for the whole provisioning run, so it cannot be destroyed while an
/// instance is still being cloned from it.
#[derive(Clone)]
pub struct InstanceLifecycle {
    images: Arc<dyn ImageStore>,
    instances: Arc<dyn InstanceStore>,
    executor: Arc<dyn Executor>,
    ports: PortAllocator,
    claims: ImageClaims,
    provision_timeout: Duration,
}

impl InstanceLifecycle {
    pub fn new(
        images: Arc<dyn ImageStore>,
        instances: Arc<dyn InstanceStore>,
        executor: Arc<dyn Executor>,
        ports: PortAllocator,
        claims: ImageClaims,
    ) -> Self {
        Self {
            images,
            instances,
            executor,
            ports,
            claims,
            provision_timeout: DEFAULT_PROVISION_TIMEOUT,
        }
    }

    pub fn with_provision_timeout(mut self, timeout: Duration) -> Self {
        self.provision_timeout = timeout;
        self
    }

    pub async fn list_instances(&self) -> Result<Vec<Instance>> {
        Ok(self.instances.list().await?)
    }

    pub async fn get_instance(&self, id: InstanceId) -> Result<Instance> {
        Ok(self.instances.get(id).await?)
    }

    #[instrument(skip(self))]
    pub async fn create_instance(&self, image_id: ImageId) -> Result<Instance> {
        let _claim = self.claims.provision(image_id)?;
        let image = self.images.get(image_id).await?;
        if !image.ready {
            return Err(LifecycleError::ImageNotReady(image_id));
        }

        let lease = self.ports.lease().ok_or_else(|| LifecycleError::NoPortAvailable {
            min: *self.ports.range().start(),
            max: *self.ports.range().end(),
        })?;
        let port = lease.port();
        let instance_id = self.instances.next_id().await?;

        let provisioned = tokio::time::timeout(
            self.provision_timeout,
            self.executor
                .provision_instance(image_id, instance_id, port),
        )
        .await;

        match provisioned {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(image_id, instance_id, port, error = %e, "Provisioning failed");
                return Err(e.into());
            }
            Err(_) => {
                error!(image_id, instance_id, port, "Provisioning timed out");
                self.teardown_partial(instance_id).await;
                return Err(LifecycleError::ProvisionTimedOut {
                    instance_id,
                    after: self.provision_timeout,
                });
            }
        }

        let instance = match self
            .instances
            .create(NewInstance {
                id: instance_id,
                image_id,
                port,
            })
            .await
        {
            Ok(instance) => instance,
            Err(e) => {
                error!(instance_id, error = %e, "Failed to persist provisioned instance");
                self.teardown_partial(instance_id).await;
                return Err(e.into());
            }
        };

        lease.commit();
        info!(instance_id, image_id, port, "Created instance");
        Ok(instance)
    }

    /// Tear the database down, then forget it.
    #[instrument(skip(self))]
    pub async fn destroy_instance(&self, id: InstanceId) -> Result<()> {
        let instance = self.instances.get(id).await?;

        self.executor.teardown_instance(id).await.map_err(|e| {
            error!(instance_id = id, error = %e, "Instance teardown failed");
            LifecycleError::from(e)
        })?;
        self.instances.destroy(&instance).await?;
        self.ports.release(instance.port);

        info!(instance_id = id, "Destroyed instance");
        Ok(())
    }

    async fn teardown_partial(&self, instance_id: InstanceId) {
        if let Err(e) = self.executor.teardown_instance(instance_id).await {
            warn!(instance_id, error = %e, "Failed to tear down partially provisioned instance");
        }
    }
}
