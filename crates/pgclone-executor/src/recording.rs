//! In-process executor that records every call instead of touching the host.
//!
//! Used by the server's tests and for local development without root.

use async_trait::async_trait;
use pgclone_common::{Executor, ExecutorError, ExecutorResult, ImageId, InstanceId};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutorOp {
    CreateSnapshot,
    FinalizeImage,
    DestroyImage,
    ProvisionInstance,
    TeardownInstance,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorCall {
    CreateSnapshot(ImageId),
    FinalizeImage(ImageId),
    DestroyImage(ImageId),
    ProvisionInstance {
        image_id: ImageId,
        instance_id: InstanceId,
        port: u16,
    },
    TeardownInstance(InstanceId),
}

impl ExecutorCall {
    pub fn op(&self) -> ExecutorOp {
        match self {
            ExecutorCall::CreateSnapshot(_) => ExecutorOp::CreateSnapshot,
            ExecutorCall::FinalizeImage(_) => ExecutorOp::FinalizeImage,
            ExecutorCall::DestroyImage(_) => ExecutorOp::DestroyImage,
            ExecutorCall::ProvisionInstance { .. } => ExecutorOp::ProvisionInstance,
            ExecutorCall::TeardownInstance(_) => ExecutorOp::TeardownInstance,
        }
    }
}

#[derive(Clone, Default)]
pub struct RecordingExecutor {
    calls: Arc<Mutex<Vec<ExecutorCall>>>,
    failing: Arc<RwLock<HashSet<ExecutorOp>>>,
    provision_delay: Arc<RwLock<Option<Duration>>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call of `op` fail.
    pub async fn fail_on(&self, op: ExecutorOp) {
        self.failing.write().await.insert(op);
    }

    pub async fn succeed_on(&self, op: ExecutorOp) {
        self.failing.write().await.remove(&op);
    }

    /// Sleep this long inside `provision_instance` before answering.
    pub async fn set_provision_delay(&self, delay: Option<Duration>) {
        *self.provision_delay.write().await = delay;
    }

    pub async fn calls(&self) -> Vec<ExecutorCall> {
        self.calls.lock().await.clone()
    }

    pub async fn count(&self, op: ExecutorOp) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|call| call.op() == op)
            .count()
    }

    async fn record(&self, call: ExecutorCall) -> ExecutorResult<()> {
        let op = call.op();
        debug!(?call, "Recording executor call");
        self.calls.lock().await.push(call);

        if self.failing.read().await.contains(&op) {
            return Err(ExecutorError::Failed {
                program: "recording-executor".to_string(),
                status: "exit status: 1".to_string(),
                stderr: format!("{op:?} configured to fail"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Executor for RecordingExecutor {
    async fn create_snapshot(&self, image_id: ImageId) -> ExecutorResult<()> {
        self.record(ExecutorCall::CreateSnapshot(image_id)).await
    }

    async fn finalize_image(&self, image_id: ImageId) -> ExecutorResult<()> {
        self.record(ExecutorCall::FinalizeImage(image_id)).await
    }

    async fn destroy_image(&self, image_id: ImageId) -> ExecutorResult<()> {
        self.record(ExecutorCall::DestroyImage(image_id)).await
    }

    async fn provision_instance(
        &self,
        image_id: ImageId,
        instance_id: InstanceId,
        port: u16,
    ) -> ExecutorResult<()> {
        let delay = *self.provision_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.record(ExecutorCall::ProvisionInstance {
            image_id,
            instance_id,
            port,
        })
        .await
    }

    async fn teardown_instance(&self, instance_id: InstanceId) -> ExecutorResult<()> {
        self.record(ExecutorCall::TeardownInstance(instance_id)).await
    }
}
