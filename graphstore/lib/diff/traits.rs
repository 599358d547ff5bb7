use std::{path::Path, pin::Pin};

use tokio::io::AsyncRead;

use crate::GraphStoreResult;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A layer payload read as a byte stream.
pub type LayerStream = Pin<Box<dyn AsyncRead + Send>>;

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Writes layer payloads into layer directories and reads them back out.
///
/// Each applier owns the layout it writes inside the layer directory.
#[async_trait::async_trait]
pub trait DiffApplier: Send + Sync {
    /// The name of the applier, used in logs.
    fn name(&self) -> &str;

    /// Applies `payload` into `layer_dir` and returns the size of what was materialized.
    async fn apply_diff(&self, layer_dir: &Path, payload: LayerStream) -> GraphStoreResult<u64>;

    /// Reads the layer in `layer_dir` back out as a payload stream.
    async fn export_diff(&self, layer_dir: &Path) -> GraphStoreResult<LayerStream>;
}
