use std::{borrow::Borrow, fmt, str::FromStr, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{GraphStoreError, GraphStoreResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The longest accepted layer id.
pub const MAX_ID_LEN: usize = 128;

static ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9_.-]*$").expect("layer id pattern is valid")
});

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A validated layer identifier.
///
/// Ids are 1 to 128 characters of lowercase ASCII letters, digits, `_`, `.` and `-`, starting
/// with a letter or digit, so an id never collides with the store's `_tmp` directory. Content
/// digests like `sha256` hex strings and short names like `abc123` are both valid. The same id
/// names the layer in the store index and in the storage driver.
///
/// ## Examples
///
/// ```
/// use graphstore::LayerId;
///
/// let id = "abc123".parse::<LayerId>().unwrap();
/// assert_eq!(id.as_str(), "abc123");
///
/// assert!("ABC".parse::<LayerId>().is_err());
/// assert!("../escape".parse::<LayerId>().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(String);

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LayerId {
    /// Validates `id` and wraps it.
    pub fn new(id: impl Into<String>) -> GraphStoreResult<Self> {
        let id = id.into();
        validate_id(&id)?;
        Ok(Self(id))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Checks that `id` is a well-formed layer id.
pub fn validate_id(id: &str) -> GraphStoreResult<()> {
    let invalid = |reason: &str| GraphStoreError::InvalidId {
        id: id.to_string(),
        reason: reason.to_string(),
    };

    if id.is_empty() {
        return Err(invalid("id cannot be empty"));
    }

    if id.len() > MAX_ID_LEN {
        return Err(invalid("id is longer than 128 characters"));
    }

    if !ID_PATTERN.is_match(id) {
        return Err(invalid(
            "id must be lowercase alphanumerics, '_', '.' or '-' and start with an alphanumeric",
        ));
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for LayerId {
    type Err = GraphStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for LayerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for LayerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for LayerId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for LayerId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(serde::de::Error::custom)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
