use std::path::PathBuf;

use crate::{GraphStoreResult, LayerId};

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// A backend that materializes the root filesystem of each layer.
///
/// The layer graph is the source of truth for which layers exist. A driver may hold storage for
/// ids the graph does not know about, left behind by an earlier failed registration, and must
/// accept being asked to remove them.
#[async_trait::async_trait]
pub trait StorageDriver: Send + Sync {
    /// The name of the driver, used in error messages.
    fn name(&self) -> &str;

    /// Creates the storage for `id`, stacked on `parent` when given.
    async fn create(&self, id: &LayerId, parent: Option<&LayerId>) -> GraphStoreResult<()>;

    /// Removes the storage for `id`. Removing an id the driver does not hold is not an error.
    async fn remove(&self, id: &LayerId) -> GraphStoreResult<()>;

    /// Returns the location of the storage for `id`.
    async fn get(&self, id: &LayerId) -> GraphStoreResult<PathBuf>;

    /// Returns true if the driver holds storage for `id`.
    async fn exists(&self, id: &LayerId) -> bool;

    /// Returns the live copy capability if the driver has one.
    fn as_live_copy(&self) -> Option<&dyn SupportsLiveCopy> {
        None
    }
}

/// A driver capability for building a layer straight from a running container's filesystem.
#[async_trait::async_trait]
pub trait SupportsLiveCopy: Send + Sync {
    /// Maps layer ids to the driver's on-disk paths, in the same order.
    async fn layer_paths(&self, ids: &[LayerId]) -> GraphStoreResult<Vec<PathBuf>>;

    /// Copies the changes a container made on top of `parent_paths` into the storage for `dest`.
    ///
    /// `parent_paths` lists the container's parent chain, nearest layer first. Returns the number
    /// of bytes copied.
    async fn copy_from_live_source(
        &self,
        container: &str,
        dest: &LayerId,
        parent_paths: &[PathBuf],
    ) -> GraphStoreResult<u64>;
}

