//! Build context for the batch execution image.
//!
//! Describes what goes into the image build: the source tree (minus excluded
//! run artifacts), host mounts applied at container-create time, and the set
//! of host environment variables passed through to the containers.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::BuildError;

/// Path prefixes excluded from the build context by default.
///
/// Generated-app output, version-control metadata, and virtual environments
/// are mutable run artifacts: including them would pollute the build cache
/// and trigger rebuilds between batches.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "app",
    "app-eval",
    "results",
    ".git",
    ".venv",
    "__pycache__",
    "node_modules",
    "target",
];

/// How a host path is attached to task containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    /// A single regular file.
    File,
    /// A directory tree.
    Directory,
    /// A credentials file, mounted read-only.
    SecretFile,
}

/// One host path attached to every task container in the batch.
#[derive(Debug, Clone)]
pub struct Mount {
    /// Source path on the host.
    pub host_path: PathBuf,
    /// Destination path inside the container.
    pub container_path: String,
    /// Optional `user:group` ownership note for the mounted path.
    pub owner: Option<String>,
    /// What kind of path this is.
    pub mode: MountMode,
    /// Whether a missing host path fails the build instead of being skipped.
    pub required: bool,
}

impl Mount {
    /// Creates an optional mount (missing host path is skipped with a warning).
    pub fn new(
        host_path: impl Into<PathBuf>,
        container_path: impl Into<String>,
        mode: MountMode,
    ) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            owner: None,
            mode,
            required: false,
        }
    }

    /// Marks the mount as required: a missing host path fails the build.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Sets the `user:group` owner note.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Resolves this mount into a Docker bind spec, or `None` if skipped.
    ///
    /// Symlinked host paths are canonicalized to their real target first,
    /// because container mount boundaries do not traverse host symlinks.
    /// Executable `File` mounts are probed for a container-compatible binary
    /// format before being accepted.
    pub fn resolve(&self) -> Result<Option<String>, BuildError> {
        if !self.host_path.exists() {
            if self.required {
                return Err(BuildError::MissingRequiredMount(self.host_path.clone()));
            }
            warn!(
                host_path = %self.host_path.display(),
                container_path = %self.container_path,
                "Optional mount source missing on host, skipping"
            );
            return Ok(None);
        }

        let resolved = fs::canonicalize(&self.host_path)?;
        if resolved != self.host_path {
            debug!(
                from = %self.host_path.display(),
                to = %resolved.display(),
                "Resolved mount symlink"
            );
        }

        if self.mode == MountMode::File && is_executable(&resolved) {
            probe_binary_format(&resolved)?;
        }

        let bind = match self.mode {
            MountMode::SecretFile => {
                format!("{}:{}:ro", resolved.display(), self.container_path)
            }
            MountMode::File | MountMode::Directory => {
                format!("{}:{}", resolved.display(), self.container_path)
            }
        };
        Ok(Some(bind))
    }
}

/// Everything needed to build the batch image and wire up its containers.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Root of the build context (must contain a `Dockerfile`).
    pub source_root: PathBuf,
    /// Relative path prefixes excluded from the context tar.
    pub excluded_paths: Vec<String>,
    /// Host mounts applied to every task container.
    pub mounts: Vec<Mount>,
    /// Host env var names copied into the image environment when set.
    pub env_passthrough: Vec<String>,
}

impl BuildContext {
    /// Creates a build context rooted at `source_root` with default excludes.
    pub fn new(source_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            excluded_paths: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
            mounts: Vec::new(),
            env_passthrough: Vec::new(),
        }
    }

    /// Replaces the excluded path prefixes.
    pub fn with_excluded_paths(mut self, excluded: Vec<String>) -> Self {
        self.excluded_paths = excluded;
        self
    }

    /// Adds a mount.
    pub fn with_mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    /// Adds host env var names to pass through into containers.
    pub fn with_env_passthrough(mut self, names: Vec<String>) -> Self {
        self.env_passthrough = names;
        self
    }

    /// Whether a context-relative path falls under an excluded prefix.
    pub fn is_excluded(&self, relative: &Path) -> bool {
        let Some(first) = relative.components().next() else {
            return false;
        };
        let first = first.as_os_str().to_string_lossy();
        self.excluded_paths.iter().any(|ex| {
            let ex = ex.trim_end_matches('/');
            first == ex
        })
    }

    /// Collects `KEY=VALUE` entries for the passthrough vars set on the host.
    pub fn collect_env(&self) -> Vec<String> {
        self.env_passthrough
            .iter()
            .filter_map(|name| {
                std::env::var(name)
                    .ok()
                    .filter(|v| !v.is_empty())
                    .map(|v| format!("{name}={v}"))
            })
            .collect()
    }
}

/// Verifies that a binary is a container-compatible (Linux ELF) executable.
///
/// A Mach-O binary fails fast with a remediation message instead of letting
/// every task die individually with a cryptic "exec format error". Files
/// whose format is inconclusive (scripts, unknown magic) only log a warning,
/// matching how an inconclusive `file(1)` probe is treated.
pub fn probe_binary_format(path: &Path) -> Result<(), BuildError> {
    let mut magic = [0u8; 4];
    let mut file = fs::File::open(path)?;
    let read = file.read(&mut magic)?;
    if read < 4 {
        warn!(path = %path.display(), "Binary too short to probe, skipping format check");
        return Ok(());
    }

    const MACH_O_MAGICS: &[[u8; 4]] = &[
        [0xfe, 0xed, 0xfa, 0xce], // 32-bit
        [0xfe, 0xed, 0xfa, 0xcf], // 64-bit
        [0xce, 0xfa, 0xed, 0xfe], // 32-bit, swapped
        [0xcf, 0xfa, 0xed, 0xfe], // 64-bit, swapped
        [0xca, 0xfe, 0xba, 0xbe], // universal/fat
    ];

    if MACH_O_MAGICS.contains(&magic) {
        return Err(BuildError::IncompatibleBinary {
            path: path.to_path_buf(),
            format: "macOS Mach-O".to_string(),
        });
    }

    if magic != [0x7f, b'E', b'L', b'F'] {
        warn!(
            path = %path.display(),
            "Binary may not be Linux-compatible (not an ELF executable)"
        );
    }

    Ok(())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}
