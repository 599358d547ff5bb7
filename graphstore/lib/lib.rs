//! `graphstore` is a store of container filesystem layers with atomic registration.
//!
//! # Overview
//!
//! A layer graph keeps every registered layer in its own directory under the store root. A layer
//! becomes visible only once it is fully materialized: registration builds the layer in a private
//! staging directory, promotes it with a single rename and only then records its id in the
//! committed index. A registration that fails at any step leaves neither an index entry nor a
//! final directory behind, so it can simply be retried.
//!
//! The graph delegates the actual work to two collaborators:
//!
//! - a [`StorageDriver`] that owns the per-layer backend storage and may expose a fast path for
//!   copying a live container's filesystem
//! - a [`DiffApplier`] that turns a layer payload into files, either by unpacking a tar locally
//!   ([`TarDiffApplier`]) or by shipping it to an isolated service VM ([`ServiceVmDiffApplier`])
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use graphstore::{LayerGraph, LayerRecord, TarDiffApplier, VfsDriver};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let driver = Arc::new(VfsDriver::new("/var/lib/graphstore/vfs"));
//!     let applier = Arc::new(TarDiffApplier::new());
//!     let graph = LayerGraph::open("/var/lib/graphstore/graph", driver, applier).await?;
//!
//!     let record = LayerRecord::builder().id("abc123".parse()?).build();
//!     let layer = tokio::fs::File::open("layer.tar").await?;
//!     graph.register(&record, Some(Box::pin(layer))).await?;
//!
//!     assert!(graph.exists("abc123"));
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`cli`] - Command-line interface and argument parsing
//! - [`config`] - Store configuration
//! - [`diff`] - Layer payload appliers
//! - [`driver`] - Storage drivers
//! - [`graph`] - The layer graph and its commit sequence
//! - [`utils`] - Path constants and helpers

#![warn(missing_docs)]

mod error;
mod id;
mod index;
mod record;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod cli;
pub mod config;
pub mod diff;
pub mod driver;
pub mod graph;
pub mod utils;

pub use config::*;
pub use diff::*;
pub use driver::*;
pub use error::*;
pub use graph::*;
pub use id::*;
pub use index::*;
pub use record::*;
