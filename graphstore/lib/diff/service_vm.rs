use std::path::Path;

use svmlink::{ServiceVmClient, ServiceVmConfig, SocketTransport, TransportProvider};

use crate::{DiffApplier, GraphStoreResult, LayerStream};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Applies layers by shipping them to the service VM, which answers with a virtual disk image.
///
/// The disk image is written as `layer.vhd` into the layer directory. Exports ship the stored disk
/// image back and stream the service VM's reply.
#[derive(Debug, Clone)]
pub struct ServiceVmDiffApplier<T = SocketTransport> {
    client: ServiceVmClient<T>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ServiceVmDiffApplier<SocketTransport> {
    /// Creates an applier for the service VM described by `config`.
    pub fn from_config(config: &ServiceVmConfig) -> Self {
        Self::new(ServiceVmClient::from_config(config))
    }
}

impl<T> ServiceVmDiffApplier<T>
where
    T: TransportProvider,
{
    /// Creates an applier using `client`.
    pub fn new(client: ServiceVmClient<T>) -> Self {
        Self { client }
    }

    /// Returns the underlying client.
    pub fn client(&self) -> &ServiceVmClient<T> {
        &self.client
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait::async_trait]
impl<T> DiffApplier for ServiceVmDiffApplier<T>
where
    T: TransportProvider + 'static,
{
    fn name(&self) -> &str {
        "service-vm"
    }

    async fn apply_diff(&self, layer_dir: &Path, payload: LayerStream) -> GraphStoreResult<u64> {
        Ok(self.client.import_layer(layer_dir, payload).await?)
    }

    async fn export_diff(&self, layer_dir: &Path) -> GraphStoreResult<LayerStream> {
        let stream = self.client.export_layer(layer_dir).await?;
        tracing::debug!(
            "exporting {} bytes from {}",
            stream.declared_size(),
            layer_dir.display()
        );
        Ok(Box::pin(stream))
    }
}
