//! Container runtime abstraction.
//!
//! The orchestrator talks to the container control plane through the narrow
//! [`ContainerRuntime`] trait so that batch scheduling and task running are
//! testable against fakes without a real Docker daemon. The production
//! implementation is [`DockerRuntime`].

mod context;
mod docker;

pub use context::{probe_binary_format, BuildContext, Mount, MountMode};
pub use docker::{DockerRuntime, DockerRuntimeConfig};

use std::path::Path;

use async_trait::async_trait;

use crate::error::{BuildError, ContainerError};

/// Output captured from a finished container command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// Exit code of the container's main process.
    pub exit_code: i64,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl ExecOutput {
    /// Whether the command completed with a zero exit code.
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// A finished (exited) container, still present for artifact export.
///
/// The runtime keeps the container around after the command completes so the
/// task runner can export directories from its filesystem; callers must
/// invoke [`ContainerRuntime::cleanup`] when done with it.
#[derive(Debug, Clone)]
pub struct ContainerRun {
    /// Runtime-assigned container ID.
    pub id: String,
    /// Captured output of the generation command.
    pub output: ExecOutput,
}

/// A named persistent cache volume shared by all containers in a batch.
///
/// Only declare volumes for dependency classes that tolerate concurrent
/// writers (e.g. content-hash-keyed download caches). Package-manager stores
/// with non-atomic installs (the npm store is the canonical example) corrupt
/// under parallel writes and must instead be baked into the image at build
/// time or left per-task-local.
#[derive(Debug, Clone)]
pub struct CacheVolume {
    /// Stable volume key; repeated batches with the same key reuse the volume.
    pub key: String,
    /// Mount point inside the container.
    pub container_path: String,
    /// Optional `user:group` owner for the mounted path.
    pub owner: Option<String>,
}

impl CacheVolume {
    /// Creates a cache volume with the given key and container path.
    pub fn new(key: impl Into<String>, container_path: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            container_path: container_path.into(),
            owner: None,
        }
    }

    /// Sets the owner applied to the mounted path.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// Opaque handle to a built execution image plus its run-time attachments.
///
/// The handle is a pure value: it is cloned freely across concurrent task
/// units and never mutated after the build completes. Docker cannot layer
/// host files onto an already-built image without committing a new one, so
/// resolved mounts and cache volumes travel on the handle as bind specs
/// applied when each task's container is created.
#[derive(Debug, Clone)]
pub struct ImageHandle {
    /// Image tag or ID understood by the runtime.
    pub image_id: String,
    /// `KEY=VALUE` environment entries applied to every container.
    pub env: Vec<String>,
    /// Host bind mounts in `host:container[:ro]` form.
    pub binds: Vec<String>,
    /// Named-volume binds in `volume:container` form.
    pub cache_binds: Vec<String>,
    /// User the generation command runs as.
    pub user: Option<String>,
    /// Working directory for the generation command.
    pub working_dir: String,
}

impl ImageHandle {
    /// Returns a new handle with the cache volume attached.
    ///
    /// Pure transformation: the receiver is not modified.
    pub fn with_cache_volume(&self, volume: &CacheVolume) -> Self {
        let mut next = self.clone();
        next.cache_binds
            .push(format!("{}:{}", volume.key, volume.container_path));
        next
    }

    /// Returns a new handle with an extra environment entry.
    pub fn with_env_var(&self, key: &str, value: &str) -> Self {
        let mut next = self.clone();
        next.env.push(format!("{key}={value}"));
        next
    }
}

/// Capability interface to the container control plane.
///
/// One implementation instance represents one control-plane session held
/// open for the duration of a batch. Dropping the session causes in-flight
/// operations to fail with session errors rather than hang.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Builds the reusable execution image for a batch.
    ///
    /// # Errors
    ///
    /// Any failure here is batch-fatal: a missing required mount, an
    /// incompatible task-execution binary, or a failed image build.
    async fn build_image(&self, context: &BuildContext) -> Result<ImageHandle, BuildError>;

    /// Runs the generation command to completion in a fresh container.
    ///
    /// Synchronizes on the command: the returned [`ContainerRun`] carries the
    /// final exit code and captured streams. A non-zero exit code is NOT an
    /// error at this layer; the task runner decides what it means.
    async fn run_in_container(
        &self,
        image: &ImageHandle,
        task_name: &str,
        cmd: Vec<String>,
    ) -> Result<ContainerRun, ContainerError>;

    /// Exports a directory from the exited container's filesystem to the host.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::ExportNotFound`] when the path does not
    /// exist in the container (distinguishable from all other failures, which
    /// surface as [`ContainerError::ExportFailed`]).
    async fn export_directory(
        &self,
        run: &ContainerRun,
        container_path: &str,
        host_dest: &Path,
    ) -> Result<(), ContainerError>;

    /// Removes the exited container. Best-effort; failures are logged.
    async fn cleanup(&self, run: &ContainerRun);

    /// Releases the batch image when the batch completes. Best-effort.
    async fn release_image(&self, _image: &ImageHandle) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> ImageHandle {
        ImageHandle {
            image_id: "appforge:test".to_string(),
            env: vec!["FOO=bar".to_string()],
            binds: Vec::new(),
            cache_binds: Vec::new(),
            user: None,
            working_dir: "/workspace".to_string(),
        }
    }

    #[test]
    fn test_with_cache_volume_is_pure() {
        let base = handle();
        let volume = CacheVolume::new("appforge-tool-cache", "/home/agent/.cache");
        let attached = base.with_cache_volume(&volume);

        assert!(base.cache_binds.is_empty());
        assert_eq!(
            attached.cache_binds,
            vec!["appforge-tool-cache:/home/agent/.cache".to_string()]
        );
    }

    #[test]
    fn test_with_cache_volume_stacks() {
        let base = handle();
        let a = CacheVolume::new("cache-a", "/a");
        let b = CacheVolume::new("cache-b", "/b");
        let attached = base.with_cache_volume(&a).with_cache_volume(&b);
        assert_eq!(attached.cache_binds.len(), 2);
    }

    #[test]
    fn test_with_env_var_is_pure() {
        let base = handle();
        let next = base.with_env_var("API_KEY", "secret");
        assert_eq!(base.env.len(), 1);
        assert_eq!(next.env.len(), 2);
        assert_eq!(next.env[1], "API_KEY=secret");
    }

    #[test]
    fn test_cache_volume_builder() {
        let volume = CacheVolume::new("k", "/c").with_owner("agent:agent");
        assert_eq!(volume.key, "k");
        assert_eq!(volume.container_path, "/c");
        assert_eq!(volume.owner.as_deref(), Some("agent:agent"));
    }

    #[test]
    fn test_exec_output_succeeded() {
        let ok = ExecOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        };
        let failed = ExecOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(ok.succeeded());
        assert!(!failed.succeeded());
    }
}
