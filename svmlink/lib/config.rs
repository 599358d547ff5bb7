use std::{path::PathBuf, time::Duration};

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{Endpoint, SandboxSpec, SocketTransport};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default number of result chunks an export buffers ahead of its reader.
pub const DEFAULT_EXPORT_BUFFER: usize = 16;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Settings for reaching and talking to the service VM.
///
/// The endpoint is resolved once when the configuration is built, so a missing or malformed
/// address fails early instead of surfacing as an empty identifier at dial time.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, PartialEq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ServiceVmConfig {
    /// The host-side address of the service VM's transfer port.
    endpoint: Endpoint,

    /// The SCSI controller the disk is attached to inside the service VM.
    #[serde(default)]
    #[builder(default)]
    controller_index: u32,

    /// The disk slot on the controller.
    #[serde(default)]
    #[builder(default)]
    disk_index: u32,

    /// The protocol version written into transfer headers.
    #[serde(default)]
    #[builder(default)]
    protocol_version: u32,

    /// Where imports buffer their input. Defaults to the system temp directory.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option))]
    temp_dir: Option<PathBuf>,

    /// How long dialing may take, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default, setter(strip_option))]
    connect_timeout_ms: Option<u64>,

    /// How many result chunks an export may queue before the copy task waits for the reader.
    #[serde(default = "default_export_buffer")]
    #[builder(default = DEFAULT_EXPORT_BUFFER)]
    export_buffer: usize,

    /// How read-write sandbox disks are allocated.
    #[serde(default)]
    #[builder(default)]
    sandbox: SandboxSpec,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ServiceVmConfig {
    /// Builds the socket transport described by this configuration.
    pub fn transport(&self) -> SocketTransport {
        let transport = SocketTransport::new(self.endpoint.clone());
        match self.connect_timeout_ms {
            Some(ms) => transport.with_connect_timeout(Duration::from_millis(ms)),
            None => transport,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn default_export_buffer() -> usize {
    DEFAULT_EXPORT_BUFFER
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
