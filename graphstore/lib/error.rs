use std::{
    error::Error,
    fmt::{self, Display},
    path::PathBuf,
};
use svmlink::SvmLinkError;
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a graphstore-related operation.
pub type GraphStoreResult<T> = Result<T, GraphStoreError>;

/// An error that occurred while managing the layer store.
#[derive(pretty_error_debug::Debug, Error)]
pub enum GraphStoreError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A layer id failed validation.
    #[error("invalid layer id {id:?}: {reason}")]
    InvalidId {
        /// The rejected id.
        id: String,

        /// Why it was rejected.
        reason: String,
    },

    /// A layer with this id is already registered.
    #[error("layer {0} already exists")]
    AlreadyExists(String),

    /// No registered layer matches the id.
    #[error("layer {0} not found")]
    LayerNotFound(String),

    /// A short id prefix matches more than one layer.
    #[error("layer id prefix {0} is ambiguous")]
    AmbiguousId(String),

    /// The storage driver failed.
    #[error("driver {driver} failed to {action} layer {id}: {message}")]
    Backend {
        /// The name of the storage driver.
        driver: String,

        /// What the driver was asked to do.
        action: &'static str,

        /// The layer the driver was working on.
        id: String,

        /// The driver's error message.
        message: String,
    },

    /// A transfer with the service VM failed.
    #[error("service vm transfer error: {0}")]
    Transfer(#[from] SvmLinkError),

    /// Layer metadata could not be encoded or decoded.
    #[error("layer metadata error: {0}")]
    Json(#[from] serde_json::Error),

    /// The configuration file could not be parsed.
    #[error("invalid configuration in {path}: {message}")]
    Config {
        /// The configuration file.
        path: PathBuf,

        /// The parser's message.
        message: String,
    },

    /// An operation is not supported by the configured collaborators.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// An error that can represent any error.
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

impl GraphStoreError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> GraphStoreError {
        GraphStoreError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Wraps a storage driver failure with the driver's identity.
    pub fn backend(
        driver: impl Into<String>,
        action: &'static str,
        id: impl Into<String>,
        error: impl Display,
    ) -> GraphStoreError {
        GraphStoreError::Backend {
            driver: driver.into(),
            action,
            id: id.into(),
            message: error.to_string(),
        }
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

/// Creates an `Ok` `GraphStoreResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> GraphStoreResult<T> {
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
