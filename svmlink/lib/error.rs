use std::{
    error::Error,
    fmt::{self, Display},
    path::PathBuf,
};
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a svmlink-related operation.
pub type SvmLinkResult<T> = Result<T, SvmLinkError>;

/// An error that occurred while talking to the service VM.
#[derive(pretty_error_debug::Debug, Error)]
pub enum SvmLinkError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The channel to the service VM could not be established.
    #[error("failed to connect to service vm at {endpoint}: {source}")]
    Connect {
        /// The endpoint that was dialed.
        endpoint: String,

        /// The underlying connection error.
        #[source]
        source: std::io::Error,
    },

    /// The peer closed the channel before a full header arrived.
    #[error("short read on {what}: expected {expected} bytes, got {got}")]
    ShortRead {
        /// The header that was being read.
        what: &'static str,

        /// The number of bytes the header requires.
        expected: usize,

        /// The number of bytes that were available.
        got: usize,
    },

    /// A transfer header carried a command id this side does not know.
    #[error("unknown transfer command: {0}")]
    UnknownCommand(i32),

    /// The service VM reported a failure status.
    #[error("service vm failed with status {status:#04x}")]
    RemoteFailure {
        /// The raw status byte from the response header.
        status: u8,
    },

    /// The number of bytes received differs from the size the service VM declared.
    #[error("channel closed before reading all data: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// The size declared in the response header.
        expected: u64,

        /// The number of bytes actually written.
        actual: u64,
    },

    /// No virtual disk image exists for a layer that is being exported.
    #[error("no virtual disk image found in {0}")]
    NotFound(PathBuf),

    /// An endpoint descriptor could not be parsed.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// The sandbox provisioner exited unsuccessfully.
    #[error("failed to provision sandbox at {path}: {message}")]
    ProvisionFailed {
        /// The disk that was being allocated.
        path: PathBuf,

        /// The provisioner's diagnostic output.
        message: String,
    },

    /// Custom error.
    #[error(transparent)]
    Custom(#[from] AnyError),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SvmLinkError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> SvmLinkError {
        SvmLinkError::Custom(AnyError {
            error: error.into(),
        })
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `SvmLinkResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> SvmLinkResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}
