use std::{env, path::PathBuf};

use crate::config::DEFAULT_GRAPHSTORE_HOME;

use super::GRAPHSTORE_HOME_ENV_VAR;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the graphstore home directory.
///
/// `GRAPHSTORE_HOME` wins when it is set and non-empty; otherwise the default
/// `~/.graphstore` is used.
pub fn graphstore_home() -> PathBuf {
    match env::var_os(GRAPHSTORE_HOME_ENV_VAR) {
        Some(home) if !home.is_empty() => PathBuf::from(home),
        _ => {
            tracing::debug!(
                "{} is not set, using default: {}",
                GRAPHSTORE_HOME_ENV_VAR,
                DEFAULT_GRAPHSTORE_HOME.display()
            );
            DEFAULT_GRAPHSTORE_HOME.clone()
        }
    }
}
