//! Store configuration.
//!
//! The configuration lives in `<home>/config.toml`, where `<home>` is `$GRAPHSTORE_HOME` or
//! `~/.graphstore`. Every field is optional:
//!
//! ```toml
//! root = "/var/lib/graphstore/graph"
//! driver_root = "/var/lib/graphstore/vfs"
//! diff = "service-vm"
//!
//! [service_vm]
//! endpoint = "unix:/run/svm/transfer.sock"
//! controller_index = 0
//! disk_index = 1
//!
//! [service_vm.sandbox]
//! size_bytes = 21474836480
//! ```

use std::{
    io,
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
};

use getset::Getters;
use serde::{Deserialize, Serialize};
use svmlink::{CommandProvisioner, SandboxSpec, ServiceVmConfig};
use typed_builder::TypedBuilder;

use crate::{
    utils::{CONFIG_FILENAME, DRIVER_SUBDIR, GRAPHSTORE_HOME_DIR, GRAPH_SUBDIR},
    DiffApplier, GraphStoreError, GraphStoreResult, LayerGraph, ServiceVmDiffApplier,
    TarDiffApplier, VfsDriver,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The graphstore home used when `GRAPHSTORE_HOME` is not set.
pub static DEFAULT_GRAPHSTORE_HOME: LazyLock<PathBuf> = LazyLock::new(|| {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(GRAPHSTORE_HOME_DIR)
});

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How layer payloads are applied.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DiffKind {
    /// Payloads are tarballs unpacked on the host.
    #[default]
    Tar,

    /// Payloads are shipped to the service VM and stored as virtual disks.
    ServiceVm,
}

/// The configuration of a layer store.
#[derive(Debug, Clone, Default, Serialize, Deserialize, TypedBuilder, Getters, PartialEq)]
#[getset(get = "pub with_prefix")]
pub struct GraphConfig {
    /// Where layer directories live. Defaults to `<home>/graph`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option, into))]
    root: Option<PathBuf>,

    /// Where the storage driver keeps its data. Defaults to `<home>/vfs`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option, into))]
    driver_root: Option<PathBuf>,

    /// How layer payloads are applied.
    #[serde(default)]
    #[builder(default)]
    diff: DiffKind,

    /// The service VM, required when `diff` is `service-vm`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option))]
    service_vm: Option<ServiceVmConfig>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl GraphConfig {
    /// Reads the configuration file at `path`.
    pub async fn load(path: impl AsRef<Path>) -> GraphStoreResult<Self> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path).await?;
        toml::from_str(&contents).map_err(|e| GraphStoreError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Reads `<home>/config.toml`, falling back to the defaults when the file does not exist.
    pub async fn load_or_default(home: impl AsRef<Path>) -> GraphStoreResult<Self> {
        let path = home.as_ref().join(CONFIG_FILENAME);
        match Self::load(&path).await {
            Err(GraphStoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("no configuration at {}, using defaults", path.display());
                Ok(Self::default())
            }
            result => result,
        }
    }

    /// Returns the configuration with the graph root replaced.
    pub fn with_root(self, root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            ..self
        }
    }

    /// Returns the graph root, relative to `home` unless configured.
    pub fn resolve_root(&self, home: &Path) -> PathBuf {
        self.root.clone().unwrap_or_else(|| home.join(GRAPH_SUBDIR))
    }

    /// Returns the driver root, relative to `home` unless configured.
    pub fn resolve_driver_root(&self, home: &Path) -> PathBuf {
        self.driver_root
            .clone()
            .unwrap_or_else(|| home.join(DRIVER_SUBDIR))
    }

    /// Builds the configured diff applier.
    ///
    /// ## Errors
    /// - [`GraphStoreError::Unsupported`] if `diff` is `service-vm` but no service VM is configured
    pub fn applier(&self) -> GraphStoreResult<Arc<dyn DiffApplier>> {
        match (self.diff, &self.service_vm) {
            (DiffKind::Tar, _) => Ok(Arc::new(TarDiffApplier::new())),
            (DiffKind::ServiceVm, Some(config)) => {
                Ok(Arc::new(ServiceVmDiffApplier::from_config(config)))
            }
            (DiffKind::ServiceVm, None) => Err(GraphStoreError::Unsupported(
                "diff = \"service-vm\" needs a [service_vm] table".to_string(),
            )),
        }
    }

    /// Builds the provisioner used for sandbox disks.
    pub fn provisioner(&self) -> CommandProvisioner {
        let spec = self
            .service_vm
            .as_ref()
            .map(|config| config.get_sandbox().clone())
            .unwrap_or_else(SandboxSpec::default);
        CommandProvisioner::new(spec)
    }

    /// Opens the layer graph this configuration describes.
    pub async fn open_graph(&self, home: &Path) -> GraphStoreResult<LayerGraph> {
        let driver = Arc::new(VfsDriver::new(self.resolve_driver_root(home)));
        LayerGraph::open(self.resolve_root(home), driver, self.applier()?).await
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_config_load_full() -> anyhow::Result<()> {
        let home = tempdir()?;
        tokio::fs::write(
            home.path().join(CONFIG_FILENAME),
            r#"
            root = "/srv/graph"
            diff = "service-vm"

            [service_vm]
            endpoint = "tcp:svm.local:5000"
            disk_index = 2

            [service_vm.sandbox]
            program = "vhdtool"
            args = ["new", "{path}"]
            "#,
        )
        .await?;

        let config = GraphConfig::load_or_default(home.path()).await?;

        assert_eq!(config.get_diff(), &DiffKind::ServiceVm);
        assert_eq!(config.resolve_root(home.path()), PathBuf::from("/srv/graph"));
        assert_eq!(
            config.resolve_driver_root(home.path()),
            home.path().join(DRIVER_SUBDIR)
        );

        let service_vm = config
            .get_service_vm()
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("missing service vm"))?;
        assert_eq!(service_vm.get_disk_index(), &2);
        assert_eq!(service_vm.get_sandbox().program, "vhdtool");
        assert_eq!(config.applier()?.name(), "service-vm");

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_config_defaults_without_file() -> anyhow::Result<()> {
        let home = tempdir()?;

        let config = GraphConfig::load_or_default(home.path()).await?;

        assert_eq!(config, GraphConfig::default());
        assert_eq!(config.resolve_root(home.path()), home.path().join(GRAPH_SUBDIR));
        assert_eq!(config.applier()?.name(), "tar");
        assert_eq!(
            config.provisioner().render_args(Path::new("/d/sandbox.vhdx"))[5],
            "/d/sandbox.vhdx"
        );

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_config_rejects_malformed_file() -> anyhow::Result<()> {
        let home = tempdir()?;
        tokio::fs::write(home.path().join(CONFIG_FILENAME), "diff = \"zip\"").await?;

        match GraphConfig::load_or_default(home.path()).await {
            Err(GraphStoreError::Config { path, .. }) => {
                assert_eq!(path, home.path().join(CONFIG_FILENAME));
            }
            other => panic!("expected config error, got {:?}", other),
        }

        Ok(())
    }

    #[test]
    fn test_config_service_vm_diff_needs_table() {
        let config = GraphConfig::builder().diff(DiffKind::ServiceVm).build();
        assert!(matches!(
            config.applier(),
            Err(GraphStoreError::Unsupported(_))
        ));
    }

    #[test_log::test(tokio::test)]
    async fn test_config_open_graph() -> anyhow::Result<()> {
        let home = tempdir()?;
        let config = GraphConfig::builder()
            .root(home.path().join("elsewhere"))
            .build()
            .with_root(home.path().join("layers"));

        let graph = config.open_graph(home.path()).await?;

        assert_eq!(graph.root(), home.path().join("layers"));
        assert_eq!(graph.driver().name(), "vfs");
        Ok(())
    }
}
