use std::path::PathBuf;

use clap::Parser;

use super::styles;

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// graphstore - A store of container filesystem layers with atomic registration
#[derive(Debug, Parser)]
#[command(name = "graphstore", author, about, version, styles=styles::styles())]
pub struct GraphStoreArgs {
    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: Option<GraphStoreSubcommand>,

    /// Path to the configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the layers, overriding the configuration
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available subcommands for managing layers
#[derive(Debug, Parser)]
pub enum GraphStoreSubcommand {
    /// Register a new layer
    #[command(name = "register")]
    Register {
        /// Id of the new layer
        #[arg(required = true)]
        id: String,

        /// Layer the new one is stacked on
        #[arg(short, long)]
        parent: Option<String>,

        /// Container to copy the layer from
        #[arg(long)]
        container: Option<String>,

        /// Layer payload to apply, `-` for stdin
        #[arg(short, long, value_name = "FILE")]
        input: Option<PathBuf>,

        /// Description of the layer
        #[arg(short = 'm', long)]
        comment: Option<String>,
    },

    /// List registered layers
    #[command(name = "ls")]
    List,

    /// Show the record of a layer
    #[command(name = "inspect")]
    Inspect {
        /// Id or unique id prefix of the layer
        #[arg(required = true)]
        id: String,
    },

    /// Delete a layer
    #[command(name = "rm")]
    Remove {
        /// Id or unique id prefix of the layer
        #[arg(required = true)]
        id: String,
    },

    /// Write the content of a layer
    #[command(name = "export")]
    Export {
        /// Id or unique id prefix of the layer
        #[arg(required = true)]
        id: String,

        /// File to write to instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Allocate a read-write sandbox disk for a layer
    #[command(name = "sandbox")]
    Sandbox {
        /// Id or unique id prefix of the layer
        #[arg(required = true)]
        id: String,
    },
}

//-------------------------------------------------------------------------------------------------
// Tests
//-------------------------------------------------------------------------------------------------
