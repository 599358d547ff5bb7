use std::path::Path;

use chrono::{DateTime, Utc};
use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    utils::{LAYER_METADATA_FILENAME, LAYER_SIZE_FILENAME},
    GraphStoreResult, LayerId,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The metadata of a layer.
///
/// A record is handed to [`LayerGraph::register`](crate::LayerGraph::register) to describe the
/// layer being committed and is persisted as `layer.json` inside the layer's directory.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, Getters, PartialEq)]
#[getset(get = "pub with_prefix")]
pub struct LayerRecord {
    /// The id of the layer.
    id: LayerId,

    /// The layer this one is stacked on, `None` for a base layer.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option))]
    parent: Option<LayerId>,

    /// The container whose filesystem this layer was produced from.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option, into))]
    container: Option<String>,

    /// When the layer was created.
    #[builder(default = Utc::now())]
    created: DateTime<Utc>,

    /// A free-form description.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option, into))]
    comment: Option<String>,

    /// The materialized size of the layer in bytes, known once the layer is registered.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option))]
    size: Option<u64>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LayerRecord {
    /// Creates a record for a layer created now.
    pub fn new(
        id: LayerId,
        parent: Option<LayerId>,
        container: Option<String>,
        comment: Option<String>,
    ) -> Self {
        Self {
            id,
            parent,
            container,
            created: Utc::now(),
            comment,
            size: None,
        }
    }

    /// Returns a copy of the record carrying the materialized size.
    pub fn with_size(&self, size: u64) -> Self {
        Self {
            size: Some(size),
            ..self.clone()
        }
    }

    /// Writes `layer.json` and `layersize` into `dir`.
    pub async fn store(&self, dir: impl AsRef<Path>) -> GraphStoreResult<()> {
        let dir = dir.as_ref();
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(dir.join(LAYER_METADATA_FILENAME), json).await?;
        tokio::fs::write(
            dir.join(LAYER_SIZE_FILENAME),
            self.size.unwrap_or_default().to_string(),
        )
        .await?;
        Ok(())
    }

    /// Reads the record stored in `dir`.
    ///
    /// When `layer.json` lacks a size, the one in `layersize` is used.
    pub async fn load(dir: impl AsRef<Path>) -> GraphStoreResult<Self> {
        let dir = dir.as_ref();
        let json = tokio::fs::read(dir.join(LAYER_METADATA_FILENAME)).await?;
        let mut record: LayerRecord = serde_json::from_slice(&json)?;

        if record.size.is_none() {
            if let Ok(size) = tokio::fs::read_to_string(dir.join(LAYER_SIZE_FILENAME)).await {
                record.size = size.trim().parse().ok();
            }
        }

        Ok(record)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
