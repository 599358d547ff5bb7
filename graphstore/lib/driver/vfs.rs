use std::{
    fs, io,
    path::{Path, PathBuf},
};

use walkdir::WalkDir;

use crate::{
    validate_id, GraphStoreError, GraphStoreResult, LayerId, StorageDriver, SupportsLiveCopy,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The directory under the driver root holding one directory per layer.
pub const VFS_LAYERS_SUBDIR: &str = "dir";

/// The directory under the driver root holding the root filesystems of live containers.
pub const VFS_CONTAINERS_SUBDIR: &str = "containers";

const VFS_DRIVER_NAME: &str = "vfs";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A storage driver that keeps every layer as a plain directory holding its full root filesystem.
///
/// Creating a layer copies its parent's tree. Layers can also be copied straight from a live
/// container's root filesystem under `<root>/containers/<container>`.
///
/// ## Layout
///
/// ```text
/// <root>/
/// ├── dir/<layer id>/...
/// └── containers/<container id>/...
/// ```
#[derive(Debug, Clone)]
pub struct VfsDriver {
    root: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VfsDriver {
    /// Creates a driver rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the driver root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the directory holding the layer `id`.
    pub fn layer_dir(&self, id: &LayerId) -> PathBuf {
        self.root.join(VFS_LAYERS_SUBDIR).join(id.as_str())
    }

    /// Returns the root filesystem of the live container `container`.
    ///
    /// `container` is joined as is; live copies only accept names that are valid layer ids.
    pub fn container_dir(&self, container: &str) -> PathBuf {
        self.root.join(VFS_CONTAINERS_SUBDIR).join(container)
    }

    fn error(
        &self,
        action: &'static str,
        id: &LayerId,
        error: impl std::fmt::Display,
    ) -> GraphStoreError {
        GraphStoreError::backend(VFS_DRIVER_NAME, action, id.as_str(), error)
    }

    async fn prepare_dest(&self, id: &LayerId, action: &'static str) -> GraphStoreResult<PathBuf> {
        let dest = self.layer_dir(id);
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            return Err(self.error(action, id, "layer directory already exists"));
        }

        tokio::fs::create_dir_all(self.root.join(VFS_LAYERS_SUBDIR))
            .await
            .map_err(|e| self.error(action, id, e))?;

        Ok(dest)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait::async_trait]
impl StorageDriver for VfsDriver {
    fn name(&self) -> &str {
        VFS_DRIVER_NAME
    }

    async fn create(&self, id: &LayerId, parent: Option<&LayerId>) -> GraphStoreResult<()> {
        let dest = self.prepare_dest(id, "create").await?;

        let Some(parent) = parent else {
            tracing::debug!("creating empty layer directory: {}", dest.display());
            return tokio::fs::create_dir(&dest)
                .await
                .map_err(|e| self.error("create", id, e));
        };

        let source = self.layer_dir(parent);
        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            let message = format!("parent layer {} does not exist", parent);
            return Err(self.error("create", id, message));
        }

        tracing::debug!(
            "copying parent layer {} into {}",
            source.display(),
            dest.display()
        );
        run_blocking(move || copy_tree(&source, &dest, &[]))
            .await
            .map_err(|e| self.error("create", id, e))?;

        Ok(())
    }

    async fn remove(&self, id: &LayerId) -> GraphStoreResult<()> {
        match tokio::fs::remove_dir_all(self.layer_dir(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.error("remove", id, e)),
        }
    }

    async fn get(&self, id: &LayerId) -> GraphStoreResult<PathBuf> {
        let dir = self.layer_dir(id);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(self.error("get", id, "no such layer directory"));
        }

        Ok(dir)
    }

    async fn exists(&self, id: &LayerId) -> bool {
        tokio::fs::try_exists(self.layer_dir(id))
            .await
            .unwrap_or(false)
    }

    fn as_live_copy(&self) -> Option<&dyn SupportsLiveCopy> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl SupportsLiveCopy for VfsDriver {
    async fn layer_paths(&self, ids: &[LayerId]) -> GraphStoreResult<Vec<PathBuf>> {
        Ok(ids.iter().map(|id| self.layer_dir(id)).collect())
    }

    async fn copy_from_live_source(
        &self,
        container: &str,
        dest: &LayerId,
        parent_paths: &[PathBuf],
    ) -> GraphStoreResult<u64> {
        if let Err(e) = validate_id(container) {
            return Err(self.error("copy", dest, format!("invalid container id: {}", e)));
        }

        let source = self.container_dir(container);
        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            return Err(self.error(
                "copy",
                dest,
                format!("container {} has no root filesystem", container),
            ));
        }

        let dest_dir = self.prepare_dest(dest, "copy").await?;
        let parents = parent_paths.to_vec();

        tracing::debug!(
            "copying container {} into {} over {} parent layers",
            container,
            dest_dir.display(),
            parents.len()
        );
        run_blocking(move || copy_tree(&source, &dest_dir, &parents))
            .await
            .map_err(|e| self.error("copy", dest, e))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn run_blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(io::Error::other)?
}

/// Copies the tree at `source` to `dest`, preserving permissions and symlinks.
///
/// Returns the size of the regular files that differ from their nearest counterpart in `parents`.
/// With no parents every file counts.
fn copy_tree(source: &Path, dest: &Path, parents: &[PathBuf]) -> io::Result<u64> {
    let mut changed = 0;

    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(io::Error::other)?;
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            let metadata = entry.metadata().map_err(io::Error::other)?;
            fs::set_permissions(&target, metadata.permissions())?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            let size = fs::copy(entry.path(), &target)?;
            if !unchanged_in_parents(entry.path(), relative, parents)? {
                changed += size;
            }
        }
    }

    Ok(changed)
}

fn unchanged_in_parents(path: &Path, relative: &Path, parents: &[PathBuf]) -> io::Result<bool> {
    let Some(previous) = parents
        .iter()
        .map(|parent| parent.join(relative))
        .find(|candidate| candidate.symlink_metadata().is_ok())
    else {
        return Ok(false);
    };

    let (current, previous_meta) = (fs::metadata(path)?, fs::symlink_metadata(&previous)?);
    if !previous_meta.is_file() || current.len() != previous_meta.len() {
        return Ok(false);
    }

    Ok(fs::read(path)? == fs::read(&previous)?)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
