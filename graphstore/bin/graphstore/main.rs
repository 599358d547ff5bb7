mod handlers;

use clap::{CommandFactory, Parser};
use graphstore::{
    cli::{GraphStoreArgs, GraphStoreSubcommand},
    GraphStoreResult,
};
use tracing_subscriber::EnvFilter;

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> GraphStoreResult<()> {
    let args = GraphStoreArgs::parse();
    init_logging(args.verbose);

    let Some(subcommand) = args.subcommand else {
        GraphStoreArgs::command().print_help()?;
        return Ok(());
    };

    let store = handlers::Store::open(args.config, args.root).await?;
    match subcommand {
        GraphStoreSubcommand::Register {
            id,
            parent,
            container,
            input,
            comment,
        } => {
            handlers::register_subcommand(&store, id, parent, container, input, comment).await?;
        }
        GraphStoreSubcommand::List => {
            handlers::list_subcommand(&store).await?;
        }
        GraphStoreSubcommand::Inspect { id } => {
            handlers::inspect_subcommand(&store, id).await?;
        }
        GraphStoreSubcommand::Remove { id } => {
            handlers::remove_subcommand(&store, id).await?;
        }
        GraphStoreSubcommand::Export { id, output } => {
            handlers::export_subcommand(&store, id, output).await?;
        }
        GraphStoreSubcommand::Sandbox { id } => {
            handlers::sandbox_subcommand(&store, id).await?;
        }
    }

    Ok(())
}

// Logs go to stderr so `export` can stream a layer through stdout.
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
