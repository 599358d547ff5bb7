//! The layer graph and its commit sequence.
//!
//! Every registered layer lives in `<root>/<id>` next to a `_tmp` directory used for staging:
//!
//! ```text
//! <root>/
//! ├── _tmp/                  # in-flight registrations and deletions
//! ├── <id>/
//! │   ├── layer.json         # the layer record
//! │   ├── layersize          # the materialized size
//! │   └── ...                # whatever the diff applier wrote
//! └── ...
//! ```
//!
//! A directory under the root that holds a readable `layer.json` is a committed layer. The
//! committed index is rebuilt from these directories when the graph is opened.

use std::{
    fmt, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use svmlink::SandboxProvisioner;
use tempfile::TempDir;

use crate::{
    utils::{LAYER_METADATA_FILENAME, STAGING_SUBDIR},
    DiffApplier, GraphStoreError, GraphStoreResult, IdIndex, LayerId, LayerRecord, LayerStream,
    StorageDriver,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A store of layers that commits each registration atomically.
///
/// The graph is the source of truth for which layers exist: an id is in the index if and only if
/// `<root>/<id>` holds a committed layer. Storage held by the driver for ids the graph does not
/// know about is treated as debris and discarded when the id is registered again.
pub struct LayerGraph {
    root: PathBuf,
    driver: Arc<dyn StorageDriver>,
    applier: Arc<dyn DiffApplier>,
    index: IdIndex,
}

/// The stages a registration passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterStage {
    /// The id is well formed and not registered.
    Validated,

    /// A private staging directory exists for the layer.
    Staged,

    /// The driver holds the layer and the staging directory holds its content and metadata.
    Materialized,

    /// The staging directory was promoted and the id indexed.
    Committed,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LayerGraph {
    /// Opens the graph rooted at `root`, creating it if needed.
    ///
    /// Leftovers of interrupted registrations in `_tmp` are purged and the committed index is
    /// rebuilt from the layer directories found under the root.
    pub async fn open(
        root: impl Into<PathBuf>,
        driver: Arc<dyn StorageDriver>,
        applier: Arc<dyn DiffApplier>,
    ) -> GraphStoreResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;

        let staging = root.join(STAGING_SUBDIR);
        match tokio::fs::remove_dir_all(&staging).await {
            Ok(()) => tracing::debug!("purged staging directory: {}", staging.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&staging).await?;

        let index = IdIndex::from_ids(restore_ids(&root).await?);
        tracing::info!(
            "opened layer graph at {} with {} layers (driver: {}, applier: {})",
            root.display(),
            index.len(),
            driver.name(),
            applier.name()
        );

        Ok(Self {
            root,
            driver,
            applier,
            index,
        })
    }

    /// Returns the graph root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the storage driver.
    pub fn driver(&self) -> &Arc<dyn StorageDriver> {
        &self.driver
    }

    /// Returns the diff applier.
    pub fn applier(&self) -> &Arc<dyn DiffApplier> {
        &self.applier
    }

    /// Returns the committed index.
    pub fn index(&self) -> &IdIndex {
        &self.index
    }

    /// Returns the directory of the layer `id`.
    pub fn layer_root(&self, id: &LayerId) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// Returns true if `id` is registered.
    pub fn exists(&self, id: &str) -> bool {
        self.index.contains(id)
    }

    /// Resolves a full id or a unique prefix of one.
    pub fn resolve(&self, id: &str) -> GraphStoreResult<LayerId> {
        self.index.get(id)
    }

    /// Loads the record of the layer matching `id` or a unique prefix of it.
    pub async fn get(&self, id: &str) -> GraphStoreResult<LayerRecord> {
        let id = self.resolve(id)?;
        LayerRecord::load(self.layer_root(&id)).await
    }

    /// Loads the records of all registered layers, ordered by id.
    pub async fn list(&self) -> GraphStoreResult<Vec<LayerRecord>> {
        let mut records = Vec::with_capacity(self.index.len());
        for id in self.index.list() {
            records.push(LayerRecord::load(self.layer_root(&id)).await?);
        }

        Ok(records)
    }

    /// Returns `id` followed by its ancestors, nearest first.
    ///
    /// ## Errors
    /// - [`GraphStoreError::LayerNotFound`] if `id` or one of its ancestors is not registered
    pub async fn parent_chain(&self, id: &LayerId) -> GraphStoreResult<Vec<LayerId>> {
        let mut chain: Vec<LayerId> = Vec::new();
        let mut next = Some(id.clone());

        while let Some(id) = next {
            if !self.index.contains(id.as_str()) {
                return Err(GraphStoreError::LayerNotFound(id.to_string()));
            }

            if chain.contains(&id) {
                return Err(GraphStoreError::custom(anyhow::anyhow!(
                    "layer {} is its own ancestor",
                    id
                )));
            }

            let record = LayerRecord::load(self.layer_root(&id)).await?;
            next = record.get_parent().clone();
            chain.push(id);
        }

        Ok(chain)
    }

    /// Registers a layer and commits it atomically.
    ///
    /// When the driver can copy live containers, the record names a container and no payload is
    /// given, the layer is copied straight from the container. Otherwise the driver creates the
    /// layer on top of its parent and the payload, if any, is applied into the staging directory.
    ///
    /// On failure nothing is committed: the staging directory is removed, the driver is asked to
    /// discard whatever it built, and the id stays free so the registration can be retried.
    ///
    /// Returns the stored record, carrying the materialized size.
    ///
    /// ## Errors
    /// - [`GraphStoreError::AlreadyExists`] if the id is registered or being registered. Nothing
    ///   on disk is touched in this case.
    /// - [`GraphStoreError::LayerNotFound`] if the live copy path cannot resolve the parent chain
    /// - [`GraphStoreError::Backend`] if the storage driver fails
    /// - [`GraphStoreError::Transfer`] if the service VM transfer fails
    pub async fn register(
        &self,
        record: &LayerRecord,
        payload: Option<LayerStream>,
    ) -> GraphStoreResult<LayerRecord> {
        let id = record.get_id();
        let reservation = self.index.reserve(id)?;
        log_stage(id, RegisterStage::Validated);

        let final_dir = self.layer_root(id);
        remove_stray(&final_dir).await?;

        if let Err(e) = self.driver.remove(id).await {
            tracing::debug!("ignoring driver cleanup error for {}: {}", id, e);
        }

        let staging = match self.create_staging(id).await {
            Ok(staging) => staging,
            Err(e) => {
                self.discard_driver_state(id).await;
                return Err(e);
            }
        };
        log_stage(id, RegisterStage::Staged);

        let stored = match self.materialize(record, payload, staging.path()).await {
            Ok(stored) => stored,
            Err(e) => {
                self.discard_driver_state(id).await;
                return Err(e);
            }
        };
        log_stage(id, RegisterStage::Materialized);

        if let Err(e) = tokio::fs::rename(staging.path(), &final_dir).await {
            self.discard_driver_state(id).await;
            return Err(e.into());
        }

        reservation.commit();
        log_stage(id, RegisterStage::Committed);
        tracing::info!(
            "registered layer {} ({} bytes)",
            id,
            stored.get_size().unwrap_or_default()
        );

        Ok(stored)
    }

    /// Unregisters the layer matching `id` and removes its storage.
    ///
    /// The layer directory is first moved into `_tmp` so a crash part way through never leaves a
    /// half-deleted layer that looks committed.
    pub async fn delete(&self, id: &str) -> GraphStoreResult<()> {
        let id = self.resolve(id)?;
        let staging = self.create_staging(&id).await?;

        tokio::fs::rename(self.layer_root(&id), staging.path().join(id.as_str())).await?;
        self.index.remove(&id);

        self.driver
            .remove(&id)
            .await
            .map_err(|e| self.backend_error("remove", &id, e))?;

        tracing::info!("deleted layer {}", id);
        Ok(())
    }

    /// Streams the content of the layer matching `id` back out through the diff applier.
    pub async fn export(&self, id: &str) -> GraphStoreResult<LayerStream> {
        let id = self.resolve(id)?;
        tracing::info!("exporting layer {}", id);
        self.applier.export_diff(&self.layer_root(&id)).await
    }

    /// Allocates a read-write sandbox disk inside the directory of the layer matching `id`.
    pub async fn create_sandbox(
        &self,
        id: &str,
        provisioner: &dyn SandboxProvisioner,
    ) -> GraphStoreResult<PathBuf> {
        let id = self.resolve(id)?;
        Ok(provisioner.create_sandbox(&self.layer_root(&id)).await?)
    }

    async fn create_staging(&self, id: &LayerId) -> GraphStoreResult<TempDir> {
        let staging_root = self.root.join(STAGING_SUBDIR);
        tokio::fs::create_dir_all(&staging_root).await?;

        let staging = tempfile::Builder::new()
            .prefix(&format!("{}-", id))
            .tempdir_in(&staging_root)?;
        tracing::debug!("created staging directory: {}", staging.path().display());

        Ok(staging)
    }

    async fn materialize(
        &self,
        record: &LayerRecord,
        payload: Option<LayerStream>,
        staging: &Path,
    ) -> GraphStoreResult<LayerRecord> {
        let id = record.get_id();
        let live_copy = self.driver.as_live_copy();

        let size = match (live_copy, record.get_container().as_deref(), payload) {
            (Some(live_copy), Some(container), None) => {
                tracing::debug!("copying layer {} from container {}", id, container);

                let ancestors = match record.get_parent() {
                    Some(parent) => self.parent_chain(parent).await?,
                    None => Vec::new(),
                };
                let paths = live_copy
                    .layer_paths(&ancestors)
                    .await
                    .map_err(|e| self.backend_error("copy", id, e))?;

                live_copy
                    .copy_from_live_source(container, id, &paths)
                    .await
                    .map_err(|e| self.backend_error("copy", id, e))?
            }
            (_, _, payload) => {
                self.driver
                    .create(id, record.get_parent().as_ref())
                    .await
                    .map_err(|e| self.backend_error("create", id, e))?;

                match payload {
                    Some(payload) => {
                        tracing::debug!("applying diff for {} with {}", id, self.applier.name());
                        self.applier.apply_diff(staging, payload).await?
                    }
                    None => 0,
                }
            }
        };

        let stored = record.with_size(size);
        stored.store(staging).await?;
        Ok(stored)
    }

    async fn discard_driver_state(&self, id: &LayerId) {
        if let Err(e) = self.driver.remove(id).await {
            tracing::warn!("failed to discard driver state for {}: {}", id, e);
        }
    }

    fn backend_error(
        &self,
        action: &'static str,
        id: &LayerId,
        error: GraphStoreError,
    ) -> GraphStoreError {
        match error {
            GraphStoreError::Backend { .. } | GraphStoreError::LayerNotFound(_) => error,
            error => GraphStoreError::backend(self.driver.name(), action, id.as_str(), error),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Debug for LayerGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerGraph")
            .field("root", &self.root)
            .field("driver", &self.driver.name())
            .field("applier", &self.applier.name())
            .field("layers", &self.index.len())
            .finish()
    }
}

impl fmt::Display for RegisterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterStage::Validated => write!(f, "validated"),
            RegisterStage::Staged => write!(f, "staged"),
            RegisterStage::Materialized => write!(f, "materialized"),
            RegisterStage::Committed => write!(f, "committed"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn log_stage(id: &LayerId, stage: RegisterStage) {
    tracing::debug!("register {}: {}", id, stage);
}

/// Removes whatever an interrupted run left at `path`, be it a directory, a file or a symlink.
async fn remove_stray(path: &Path) -> io::Result<()> {
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => {
            tracing::debug!("removed stray layer entry: {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Finds the committed layers under `root`.
async fn restore_ids(root: &Path) -> GraphStoreResult<Vec<LayerId>> {
    let mut ids = Vec::new();
    let mut entries = tokio::fs::read_dir(root).await?;

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }

        let name = entry.file_name();
        let Some(id) = name.to_str().and_then(|name| name.parse::<LayerId>().ok()) else {
            if name != STAGING_SUBDIR {
                tracing::debug!("skipping foreign directory: {}", entry.path().display());
            }
            continue;
        };

        match LayerRecord::load(entry.path()).await {
            Ok(record) if record.get_id() == &id => ids.push(id),
            Ok(record) => tracing::warn!(
                "skipping {}: {} belongs to layer {}",
                entry.path().display(),
                LAYER_METADATA_FILENAME,
                record.get_id()
            ),
            Err(e) => tracing::warn!("skipping {}: {}", entry.path().display(), e),
        }
    }

    Ok(ids)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
