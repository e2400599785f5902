use super::{LifecycleError, Result};
use pgclone_common::ImageId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activity {
    Provisioning(usize),
    Finalising,
    Destroying,
}

/// In-flight work per image, shared by both lifecycles.
///
/// Any number of instances may be provisioned from an image at once, but
/// finalising or destroying it needs the image to itself. A claim is released
/// when its guard is dropped, however the operation ended.
#[derive(Debug, Clone, Default)]
pub struct ImageClaims {
    active: Arc<Mutex<HashMap<ImageId, Activity>>>,
}

impl ImageClaims {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provision(&self, image_id: ImageId) -> Result<ImageClaim> {
        let mut active = self.lock();
        match active.get(&image_id).copied() {
            None => {
                active.insert(image_id, Activity::Provisioning(1));
            }
            Some(Activity::Provisioning(n)) => {
                active.insert(image_id, Activity::Provisioning(n + 1));
            }
            Some(Activity::Finalising) => {
                return Err(busy(image_id, "being finalised"));
            }
            Some(Activity::Destroying) => {
                return Err(busy(image_id, "being destroyed"));
            }
        }
        Ok(self.claim(image_id))
    }

    pub fn finalise(&self, image_id: ImageId) -> Result<ImageClaim> {
        self.exclusive(image_id, Activity::Finalising)
    }

    pub fn destroy(&self, image_id: ImageId) -> Result<ImageClaim> {
        self.exclusive(image_id, Activity::Destroying)
    }

    /// Number of instances currently being provisioned from `image_id`.
    pub fn provisioning(&self, image_id: ImageId) -> usize {
        match self.lock().get(&image_id) {
            Some(Activity::Provisioning(n)) => *n,
            _ => 0,
        }
    }

    pub fn is_idle(&self, image_id: ImageId) -> bool {
        !self.lock().contains_key(&image_id)
    }

    fn exclusive(&self, image_id: ImageId, activity: Activity) -> Result<ImageClaim> {
        let mut active = self.lock();
        match active.get(&image_id) {
            None => {
                active.insert(image_id, activity);
                Ok(self.claim(image_id))
            }
            Some(Activity::Provisioning(n)) => Err(LifecycleError::Conflict(format!(
                "image {image_id} has {n} instance(s) being provisioned"
            ))),
            Some(Activity::Finalising) => Err(busy(image_id, "being finalised")),
            Some(Activity::Destroying) => Err(busy(image_id, "being destroyed")),
        }
    }

    fn claim(&self, image_id: ImageId) -> ImageClaim {
        ImageClaim {
            image_id,
            claims: self.clone(),
        }
    }

    fn release(&self, image_id: ImageId) {
        let mut active = self.lock();
        match active.get(&image_id).copied() {
            Some(Activity::Provisioning(n)) if n > 1 => {
                active.insert(image_id, Activity::Provisioning(n - 1));
            }
            _ => {
                active.remove(&image_id);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ImageId, Activity>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn busy(image_id: ImageId, what: &str) -> LifecycleError {
    LifecycleError::Conflict(format!("image {image_id} is {what}"))
}

#[derive(Debug)]
pub struct ImageClaim {
    image_id: ImageId,
    claims: ImageClaims,
}

impl Drop for ImageClaim {
    fn drop(&mut self) {
        self.claims.release(self.image_id);
    }
}
