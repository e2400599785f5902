//! Orchestration of images and instances across the store and the executor.

use pgclone_common::{ExecutorError, ImageId, InstanceId};
use std::time::Duration;
use thiserror::Error;

use crate::store::StoreError;

mod claims;
mod images;
mod instances;
mod ports;

pub use claims::{ImageClaim, ImageClaims};
pub use images::ImageLifecycle;
pub use instances::InstanceLifecycle;
pub use ports::{PortAllocator, PortLease};

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    #[error("image {0} is not ready")]
    ImageNotReady(ImageId),

    #[error("{0}")]
    Conflict(String),

    #[error("no free port between {min} and {max}")]
    NoPortAvailable { min: u16, max: u16 },

    #[error("provisioning instance {instance_id} timed out after {after:?}")]
    ProvisionTimedOut {
        instance_id: InstanceId,
        after: Duration,
    },

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for LifecycleError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind, id } => LifecycleError::NotFound { kind, id },
            StoreError::Stale { id, .. } => {
                LifecycleError::Conflict(format!("image {id} was modified concurrently"))
            }
            StoreError::Duplicate { kind, id } => {
                LifecycleError::Conflict(format!("{kind} {id} already exists"))
            }
            other => LifecycleError::Store(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, LifecycleError>;
