//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The directory under the store root where registrations are staged.
pub const STAGING_SUBDIR: &str = "_tmp";

/// The file holding a layer's record inside its directory.
pub const LAYER_METADATA_FILENAME: &str = "layer.json";

/// The file holding a layer's materialized size inside its directory.
pub const LAYER_SIZE_FILENAME: &str = "layersize";

/// The directory inside a layer directory that receives the unpacked filesystem.
pub const ROOTFS_SUBDIR: &str = "fs";

/// The sub directory of the graphstore home holding the layer directories.
pub const GRAPH_SUBDIR: &str = "graph";

/// The sub directory of the graphstore home owned by the storage driver.
pub const DRIVER_SUBDIR: &str = "vfs";

/// The name of the configuration file in the graphstore home.
pub const CONFIG_FILENAME: &str = "config.toml";

/// The hidden directory in the user's home used when `GRAPHSTORE_HOME` is not set.
pub const GRAPHSTORE_HOME_DIR: &str = ".graphstore";

/// The environment variable that overrides the graphstore home.
pub const GRAPHSTORE_HOME_ENV_VAR: &str = "GRAPHSTORE_HOME";
