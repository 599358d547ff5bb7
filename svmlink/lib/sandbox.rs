//! Allocation of read-write sandbox disks.
//!
//! Sandbox disks are created on the host by an external tool rather than by the service VM. The
//! provisioner is a black box that either produces `<folder>/sandbox.vhdx` or fails.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::{SvmLinkError, SvmLinkResult, SANDBOX_DISK_NAME};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default size of a sandbox disk (16 GiB).
pub const DEFAULT_SANDBOX_SIZE: u64 = 16 * 1024 * 1024 * 1024;

/// Placeholder replaced by the disk path in provisioner arguments.
pub const PATH_PLACEHOLDER: &str = "{path}";

/// Placeholder replaced by the disk size in bytes in provisioner arguments.
pub const SIZE_PLACEHOLDER: &str = "{size}";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The command used to allocate a sandbox disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandboxSpec {
    /// The program to run.
    #[serde(default = "default_program")]
    pub program: String,

    /// Arguments, with `{path}` and `{size}` substituted.
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// The virtual size of the disk in bytes.
    #[serde(default = "default_size")]
    pub size_bytes: u64,
}

/// Allocates sandbox disks by running an external command.
#[derive(Debug, Clone)]
pub struct CommandProvisioner {
    spec: SandboxSpec,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Allocates a fresh read-write virtual disk for a container sandbox.
#[async_trait]
pub trait SandboxProvisioner: Send + Sync {
    /// Creates `sandbox.vhdx` inside `folder` and returns its path.
    async fn create_sandbox(&self, folder: &Path) -> SvmLinkResult<PathBuf>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CommandProvisioner {
    /// Creates a provisioner that runs the given command.
    pub fn new(spec: SandboxSpec) -> Self {
        Self { spec }
    }

    /// Returns the arguments the provisioner would pass for a disk at `path`.
    pub fn render_args(&self, path: &Path) -> Vec<String> {
        let path = path.to_string_lossy();
        let size = self.spec.size_bytes.to_string();
        self.spec
            .args
            .iter()
            .map(|arg| {
                arg.replace(PATH_PLACEHOLDER, &path)
                    .replace(SIZE_PLACEHOLDER, &size)
            })
            .collect()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for SandboxSpec {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            size_bytes: default_size(),
        }
    }
}

#[async_trait]
impl SandboxProvisioner for CommandProvisioner {
    async fn create_sandbox(&self, folder: &Path) -> SvmLinkResult<PathBuf> {
        let path = folder.join(SANDBOX_DISK_NAME);
        let args = self.render_args(&path);

        tracing::info!("creating sandbox disk: {}", path.display());
        tracing::debug!("running {} {:?}", self.spec.program, args);

        let output = Command::new(&self.spec.program)
            .args(&args)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(SvmLinkError::ProvisionFailed {
                path,
                message: if stderr.is_empty() {
                    output.status.to_string()
                } else {
                    stderr
                },
            });
        }

        Ok(path)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn default_program() -> String {
    "qemu-img".to_string()
}

fn default_args() -> Vec<String> {
    [
        "create",
        "-f",
        "vhdx",
        "-o",
        "subformat=dynamic,block_size=1M",
        PATH_PLACEHOLDER,
        SIZE_PLACEHOLDER,
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_size() -> u64 {
    DEFAULT_SANDBOX_SIZE
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
