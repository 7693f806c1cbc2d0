//! Docker implementation of [`ContainerRuntime`] using the bollard crate.
//!
//! One `DockerRuntime` holds one client session to the local Docker daemon
//! for the duration of a batch. The batch image is built from a gzipped tar
//! of the build context; each task then runs in its own container created
//! from that image, with host mounts and cache volumes applied as binds.

use std::path::Path;
use std::time::Duration;

use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::{BuildImageOptions, RemoveImageOptions};
use bollard::models::HostConfig;
use bollard::Docker;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::container::{
    BuildContext, ContainerRun, ContainerRuntime, ExecOutput, ImageHandle,
};
use crate::error::{BuildError, ContainerError};

/// Configuration for the Docker runtime.
#[derive(Debug, Clone)]
pub struct DockerRuntimeConfig {
    /// Maximum wall-clock time for one task's container command.
    pub task_timeout: Duration,
    /// Working directory for generation commands inside containers.
    pub workspace_dir: String,
    /// User the generation command runs as (e.g. "agent" or "1000:1000").
    pub user: Option<String>,
}

impl Default for DockerRuntimeConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(1800), // 30 minutes
            workspace_dir: "/workspace".to_string(),
            user: None,
        }
    }
}

/// Docker-backed container runtime.
pub struct DockerRuntime {
    docker: Docker,
    config: DockerRuntimeConfig,
}

impl DockerRuntime {
    /// Connects to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `BuildError::DaemonUnavailable` if the daemon is not reachable.
    pub fn new(config: DockerRuntimeConfig) -> Result<Self, BuildError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| BuildError::DaemonUnavailable(format!("Failed to connect: {e}")))?;
        Ok(Self { docker, config })
    }

    /// Creates a runtime from an existing bollard Docker session.
    pub fn from_docker(docker: Docker, config: DockerRuntimeConfig) -> Self {
        Self { docker, config }
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn build_image(&self, context: &BuildContext) -> Result<ImageHandle, BuildError> {
        let tag = format!("appforge-batch:{}", Uuid::new_v4().simple());

        // Tar assembly is blocking filesystem work
        let tar_context = context.clone();
        let tar_bytes = tokio::task::spawn_blocking(move || build_context_tar(&tar_context))
            .await
            .map_err(|e| BuildError::ImageBuild(format!("context task panicked: {e}")))??;

        info!(
            tag = %tag,
            context = %context.source_root.display(),
            bytes = tar_bytes.len(),
            "Building batch image"
        );

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.clone(),
            rm: true,
            ..Default::default()
        };

        let mut stream = self
            .docker
            .build_image(options, None, Some(tar_bytes.into()));
        while let Some(result) = stream.next().await {
            let build_info =
                result.map_err(|e| BuildError::ImageBuild(format!("build stream: {e}")))?;
            if let Some(err) = build_info.error {
                return Err(BuildError::ImageBuild(err));
            }
            if let Some(line) = build_info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!(tag = %tag, "{line}");
                }
            }
        }

        // Mounts are applied after the base image is built: resolve symlinks,
        // skip missing optional mounts, fail on missing required ones.
        let mut binds = Vec::new();
        for mount in &context.mounts {
            if let Some(bind) = mount.resolve()? {
                binds.push(bind);
            }
        }

        Ok(ImageHandle {
            image_id: tag,
            env: context.collect_env(),
            binds,
            cache_binds: Vec::new(),
            user: self.config.user.clone(),
            working_dir: self.config.workspace_dir.clone(),
        })
    }

    async fn run_in_container(
        &self,
        image: &ImageHandle,
        task_name: &str,
        cmd: Vec<String>,
    ) -> Result<ContainerRun, ContainerError> {
        let name = container_name(task_name);

        let mut all_binds = image.binds.clone();
        all_binds.extend(image.cache_binds.iter().cloned());

        let host_config = HostConfig {
            binds: if all_binds.is_empty() {
                None
            } else {
                Some(all_binds)
            },
            ..Default::default()
        };

        let container_config = Config {
            image: Some(image.image_id.clone()),
            cmd: Some(cmd),
            env: if image.env.is_empty() {
                None
            } else {
                Some(image.env.clone())
            },
            working_dir: Some(image.working_dir.clone()),
            user: image.user.clone(),
            host_config: Some(host_config),
            tty: Some(false),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        let created = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| ContainerError::StartFailed(format!("create: {e}")))?;
        let id = created.id;

        // The container exists from here on; every error return below must
        // remove it or it leaks on the daemon.
        if let Err(e) = self
            .docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
        {
            self.remove_container(&id).await;
            return Err(ContainerError::StartFailed(format!("start: {e}")));
        }

        debug!(task = %task_name, container = %id, "Container started");

        // Synchronize: force full execution and collect the final status
        let exit_code = match tokio::time::timeout(
            self.config.task_timeout,
            self.wait_for_exit(&id),
        )
        .await
        {
            Ok(Ok(code)) => code,
            Ok(Err(e)) => {
                self.remove_container(&id).await;
                return Err(e);
            }
            Err(_) => {
                let seconds = self.config.task_timeout.as_secs();
                warn!(task = %task_name, container = %id, seconds, "Task timed out, removing container");
                self.remove_container(&id).await;
                return Err(ContainerError::Timeout { seconds });
            }
        };

        // Capture streams even on non-zero exit; if capture itself fails,
        // keep whatever we have and note the capture failure.
        let (stdout, stderr) = match self.collect_logs(&id).await {
            Ok(streams) => streams,
            Err(e) => (
                String::new(),
                format!("failed to capture container logs: {e}"),
            ),
        };

        Ok(ContainerRun {
            id,
            output: ExecOutput {
                exit_code,
                stdout,
                stderr,
            },
        })
    }

    async fn export_directory(
        &self,
        run: &ContainerRun,
        container_path: &str,
        host_dest: &Path,
    ) -> Result<(), ContainerError> {
        let options = DownloadFromContainerOptions {
            path: container_path.to_string(),
        };

        let mut stream = self.docker.download_from_container(&run.id, Some(options));
        let mut bytes = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(data) => bytes.extend_from_slice(&data),
                Err(e) if is_not_found(&e) => {
                    return Err(ContainerError::ExportNotFound(container_path.to_string()));
                }
                Err(e) => {
                    return Err(ContainerError::ExportFailed {
                        path: container_path.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let dest = host_dest.to_path_buf();
        tokio::task::spawn_blocking(move || unpack_exported_tar(&bytes, &dest))
            .await
            .map_err(|e| ContainerError::ExportFailed {
                path: container_path.to_string(),
                reason: format!("unpack task panicked: {e}"),
            })?
            .map_err(|e| ContainerError::ExportFailed {
                path: container_path.to_string(),
                reason: e.to_string(),
            })?;

        debug!(container = %run.id, path = container_path, dest = %host_dest.display(), "Exported directory");
        Ok(())
    }

    async fn cleanup(&self, run: &ContainerRun) {
        self.remove_container(&run.id).await;
    }

    async fn release_image(&self, image: &ImageHandle) {
        let options = RemoveImageOptions {
            force: false,
            ..Default::default()
        };
        if let Err(e) = self
            .docker
            .remove_image(&image.image_id, Some(options), None)
            .await
        {
            debug!(image = %image.image_id, error = %e, "Failed to remove batch image");
        }
    }
}

impl DockerRuntime {
    /// Waits for the container to exit and returns its exit code.
    async fn wait_for_exit(&self, id: &str) -> Result<i64, ContainerError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as a wait error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(ContainerError::SessionClosed(format!("wait: {e}"))),
            None => Err(ContainerError::SessionClosed(
                "container wait stream ended without a status".to_string(),
            )),
        }
    }

    /// Collects the container's stdout and stderr separately.
    async fn collect_logs(&self, id: &str) -> Result<(String, String), ContainerError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            timestamps: false,
            ..Default::default()
        };

        let mut logs = self.docker.logs(id, Some(options));
        let mut stdout = String::new();
        let mut stderr = String::new();

        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) => {
                    stdout.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(LogOutput::StdErr { message }) => {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(ContainerError::SessionClosed(format!("logs: {e}")));
                }
            }
        }

        Ok((stdout, stderr))
    }

    /// Force-removes a container. Best-effort; failures are logged.
    async fn remove_container(&self, id: &str) {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(id, Some(options)).await {
            debug!(container = %id, error = %e, "Failed to remove container");
        }
    }
}

/// Builds the gzipped tar of the build context, honoring exclusions.
fn build_context_tar(context: &BuildContext) -> Result<Vec<u8>, BuildError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for entry in walkdir::WalkDir::new(&context.source_root)
        .follow_links(false)
        .min_depth(1)
    {
        let entry = entry.map_err(|e| BuildError::ContextFailed {
            path: context.source_root.clone(),
            reason: e.to_string(),
        })?;
        let relative = entry
            .path()
            .strip_prefix(&context.source_root)
            .map_err(|e| BuildError::ContextFailed {
                path: context.source_root.clone(),
                reason: e.to_string(),
            })?;

        if context.is_excluded(relative) {
            continue;
        }

        let file_type = entry.file_type();
        if file_type.is_dir() {
            builder.append_dir(relative, entry.path())?;
        } else if file_type.is_file() {
            builder.append_path_with_name(entry.path(), relative)?;
        } else {
            // Symlinks inside the context are rare and not portable into the
            // build; their targets are picked up by the walk when in-tree.
            debug!(path = %entry.path().display(), "Skipping symlink in build context");
        }
    }

    let encoder = builder.into_inner().map_err(BuildError::Io)?;
    encoder.finish().map_err(BuildError::Io)
}

/// Unpacks a container export tar into `dest`, stripping the leading
/// component (Docker archives the requested path under its own basename).
fn unpack_exported_tar(bytes: &[u8], dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(bytes);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let stripped: std::path::PathBuf = entry.path()?.components().skip(1).collect();
        if stripped.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(stripped);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(target)?;
    }
    Ok(())
}

/// Unique, Docker-safe container name for a task.
fn container_name(task_name: &str) -> String {
    let safe: String = task_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("appforge-{}-{}", safe, Uuid::new_v4().simple())
}

/// Whether a Docker API error means "path not found in container".
fn is_not_found(err: &bollard::errors::Error) -> bool {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => true,
        other => other
            .to_string()
            .to_lowercase()
            .contains("no such file or directory"),
    }
}
