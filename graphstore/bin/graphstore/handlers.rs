use std::path::PathBuf;

use graphstore::{
    cli::AnsiStyles, utils, GraphConfig, GraphStoreResult, LayerGraph, LayerId, LayerRecord,
    LayerStream,
};
use tokio::io::AsyncWriteExt;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const STDIO_PATH: &str = "-";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The opened layer graph together with the configuration it was opened from.
pub struct Store {
    config: GraphConfig,
    graph: LayerGraph,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Store {
    /// Loads the configuration and opens the layer graph.
    pub async fn open(config: Option<PathBuf>, root: Option<PathBuf>) -> GraphStoreResult<Self> {
        let home = utils::graphstore_home();
        let config = match config {
            Some(path) => GraphConfig::load(path).await?,
            None => GraphConfig::load_or_default(&home).await?,
        };
        let config = match root {
            Some(root) => config.with_root(root),
            None => config,
        };

        let graph = config.open_graph(&home).await?;
        Ok(Self { config, graph })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Handlers
//--------------------------------------------------------------------------------------------------

pub async fn register_subcommand(
    store: &Store,
    id: String,
    parent: Option<String>,
    container: Option<String>,
    input: Option<PathBuf>,
    comment: Option<String>,
) -> GraphStoreResult<()> {
    let id: LayerId = id.parse()?;
    let parent = parent.map(|parent| parent.parse::<LayerId>()).transpose()?;
    let record = LayerRecord::new(id, parent, container, comment);

    let payload: Option<LayerStream> = match input {
        Some(path) if path.as_os_str() == STDIO_PATH => Some(Box::pin(tokio::io::stdin())),
        Some(path) => Some(Box::pin(tokio::fs::File::open(path).await?)),
        None => None,
    };

    let stored = store.graph.register(&record, payload).await?;
    println!(
        "{} {}",
        stored.get_id(),
        format!("({} bytes)", stored.get_size().unwrap_or_default()).placeholder()
    );

    Ok(())
}

pub async fn list_subcommand(store: &Store) -> GraphStoreResult<()> {
    let records = store.graph.list().await?;

    println!(
        "{}",
        format!("{:<24} {:<24} {:>12}  {}", "ID", "PARENT", "SIZE", "CREATED").header()
    );
    for record in records {
        println!(
            "{:<24} {:<24} {:>12}  {}",
            record.get_id().as_str(),
            record
                .get_parent()
                .as_ref()
                .map(LayerId::as_str)
                .unwrap_or("-"),
            record.get_size().unwrap_or_default(),
            record.get_created().format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

pub async fn inspect_subcommand(store: &Store, id: String) -> GraphStoreResult<()> {
    let record = store.graph.get(&id).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

pub async fn remove_subcommand(store: &Store, id: String) -> GraphStoreResult<()> {
    let resolved = store.graph.resolve(&id)?;
    store.graph.delete(resolved.as_str()).await?;
    println!("{}", resolved);
    Ok(())
}

pub async fn export_subcommand(
    store: &Store,
    id: String,
    output: Option<PathBuf>,
) -> GraphStoreResult<()> {
    let mut stream = store.graph.export(&id).await?;

    match output {
        Some(path) if path.as_os_str() != STDIO_PATH => {
            let mut file = tokio::fs::File::create(&path).await?;
            let written = tokio::io::copy(&mut stream, &mut file).await?;
            file.flush().await?;
            tracing::info!("wrote {} bytes to {}", written, path.display());
        }
        _ => {
            let mut stdout = tokio::io::stdout();
            tokio::io::copy(&mut stream, &mut stdout).await?;
            stdout.flush().await?;
        }
    }

    Ok(())
}

pub async fn sandbox_subcommand(store: &Store, id: String) -> GraphStoreResult<()> {
    let provisioner = store.config.provisioner();
    match store.graph.create_sandbox(&id, &provisioner).await {
        Ok(path) => {
            println!("{}", path.display().to_string().literal());
            Ok(())
        }
        Err(e) => {
            eprintln!("{} {}", "sandbox creation failed:".error(), e);
            Err(e)
        }
    }
}
