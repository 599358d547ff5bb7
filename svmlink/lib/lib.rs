//! `svmlink` ships container layer streams to and from an isolated service VM.
//!
//! # Overview
//!
//! The service VM is only reachable over a socket channel that the hypervisor exposes on the
//! host. `svmlink` speaks a small length-framed, half-duplex protocol over that channel:
//!
//! 1. The host sends a fixed 16-byte [`TransferHeader`].
//! 2. The host streams the payload and half-closes its write side.
//! 3. The VM answers with a 12-byte [`ResponseHeader`] carrying a status and a payload size.
//! 4. The VM streams the result back and closes the channel.
//!
//! Imports buffer the incoming layer into a temporary file, ship it and write the returned
//! virtual disk into the layer directory. Exports ship an existing disk image and hand the
//! VM's reply back to the caller as a lazily consumed [`ExportStream`].
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use svmlink::{ServiceVmClient, ServiceVmConfig};
//!
//! # async fn example() -> svmlink::SvmLinkResult<()> {
//! let config = ServiceVmConfig::builder()
//!     .endpoint("unix:/run/svm/transfer.sock".parse()?)
//!     .build();
//!
//! let client = ServiceVmClient::from_config(&config);
//! let layer = tokio::fs::File::open("/tmp/layer.tar").await?;
//! let size = client.import_layer("/var/lib/graph/_tmp/abc123", layer).await?;
//! println!("imported {} bytes", size);
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`header`] - Wire encoding of transfer and response headers
//! - [`channel`] - Socket channels with explicit half-close
//! - [`transfer`] - Import and export state machines
//! - [`sandbox`] - Allocation of read-write sandbox disks

#![warn(missing_docs)]

mod config;
mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod channel;
pub mod header;
pub mod sandbox;
pub mod transfer;

pub use channel::*;
pub use config::*;
pub use error::*;
pub use header::*;
pub use sandbox::*;
pub use transfer::*;
