use async_trait::async_trait;
use pgclone_common::{Executor, ExecutorError, ExecutorResult, ImageId, InstanceId};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, instrument};

// Re-export so consumers only need one import path
pub use pgclone_common as common;

pub mod recording;

pub use recording::{ExecutorCall, ExecutorOp, RecordingExecutor};

/// Where the privileged tooling lives and which storage root it operates on.
#[derive(Debug, Clone)]
pub struct CommandExecutorConfig {
    /// BTRFS mount holding `image_uploads/`, `image_snapshots/` and `instances/`.
    pub root: PathBuf,
    /// Helper that runs as root and performs the multi-step pipelines.
    pub baker: PathBuf,
    pub pg_ctl: PathBuf,
}

impl Default for CommandExecutorConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/btrfs"),
            baker: PathBuf::from("pgclone-baker"),
            pg_ctl: PathBuf::from("/usr/lib/postgresql/current/bin/pg_ctl"),
        }
    }
}

/// Executor that shells out to `btrfs` and the privileged baker helper.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    config: CommandExecutorConfig,
}

impl CommandExecutor {
    pub fn new(config: CommandExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CommandExecutorConfig {
        &self.config
    }

    pub fn upload_path(&self, image_id: ImageId) -> PathBuf {
        self.config
            .root
            .join("image_uploads")
            .join(image_id.to_string())
    }

    fn baker(&self, action: &str) -> Command {
        let mut command = Command::new(&self.config.baker);
        command
            .arg("--root")
            .arg(&self.config.root)
            .arg("--pgctl")
            .arg(&self.config.pg_ctl)
            .arg("--action")
            .arg(action)
            // A caller-side timeout drops the future; the helper must not outlive it.
            .kill_on_drop(true);
        command
    }

    fn baker_name(&self) -> String {
        self.config.baker.display().to_string()
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    #[instrument(skip(self))]
    async fn create_snapshot(&self, image_id: ImageId) -> ExecutorResult<()> {
        let path = self.upload_path(image_id);
        let mut command = Command::new("btrfs");
        command.args(["subvolume", "create"]).arg(&path);
        let output = run(command, "btrfs").await?;
        info!(path = %path.display(), %output, "Created upload subvolume");

        set_group_writable(&path).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn finalize_image(&self, image_id: ImageId) -> ExecutorResult<()> {
        let mut command = self.baker("finalise-image");
        command.arg("--id").arg(image_id.to_string());
        run(command, &self.baker_name()).await?;
        info!(image_id, "Finalised image");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn destroy_image(&self, image_id: ImageId) -> ExecutorResult<()> {
        let mut command = self.baker("destroy-image");
        command.arg("--id").arg(image_id.to_string());
        run(command, &self.baker_name()).await?;
        info!(image_id, "Destroyed image snapshot");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn provision_instance(
        &self,
        image_id: ImageId,
        instance_id: InstanceId,
        port: u16,
    ) -> ExecutorResult<()> {
        // The helper snapshots the image, issues the CA and the server/client
        // certificates, starts postgres without TCP, checks that non-TLS,
        // certless, superuser and foreign-identity connections are all refused,
        // and only then enables listening. Any failed check stops the instance
        // and exits non-zero.
        let mut command = self.baker("create-instance");
        command
            .arg("--image-id")
            .arg(image_id.to_string())
            .arg("--instance-id")
            .arg(instance_id.to_string())
            .arg("--port")
            .arg(port.to_string());
        run(command, &self.baker_name()).await?;
        info!(image_id, instance_id, port, "Provisioned instance");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn teardown_instance(&self, instance_id: InstanceId) -> ExecutorResult<()> {
        let mut command = self.baker("destroy-instance");
        command.arg("--instance-id").arg(instance_id.to_string());
        run(command, &self.baker_name()).await?;
        info!(instance_id, "Tore down instance");
        Ok(())
    }
}

async fn run(mut command: Command, program: &str) -> ExecutorResult<String> {
    let output = command
        .output()
        .await
        .map_err(|source| ExecutorError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !output.status.success() {
        return Err(ExecutorError::Failed {
            program: program.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    debug!(%program, %stdout, "Command completed");
    Ok(stdout)
}

// 775 so the upload user can write into the subvolume
#[cfg(unix)]
async fn set_group_writable(path: &Path) -> ExecutorResult<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o775))
        .await
        .map_err(|e| ExecutorError::Internal(format!("chmod {}: {e}", path.display())))?;
    debug!(path = %path.display(), "Set permissions to 775");
    Ok(())
}

#[cfg(not(unix))]
async fn set_group_writable(_path: &Path) -> ExecutorResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor_with_baker(baker: &str) -> CommandExecutor {
        CommandExecutor::new(CommandExecutorConfig {
            root: PathBuf::from("/tmp/pgclone-test"),
            baker: PathBuf::from(baker),
            pg_ctl: PathBuf::from("/bin/true"),
        })
    }

    #[test]
    fn upload_path_is_scoped_by_image() {
        let executor = executor_with_baker("true");
        assert_eq!(
            executor.upload_path(42),
            PathBuf::from("/tmp/pgclone-test/image_uploads/42")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_helper_is_ok() {
        let executor = executor_with_baker("true");
        executor.finalize_image(1).await.unwrap();
        executor.provision_instance(1, 2, 6000).await.unwrap();
        executor.teardown_instance(2).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_helper_reports_exit_status() {
        let executor = executor_with_baker("false");
        let err = executor.provision_instance(1, 2, 6000).await.unwrap_err();
        match err {
            ExecutorError::Failed { program, .. } => assert_eq!(program, "false"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_helper_is_a_spawn_error() {
        let executor = executor_with_baker("/nonexistent/pgclone-baker");
        let err = executor.finalize_image(1).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Spawn { .. }));
    }
}
