use anyhow::Context;
use clap::Parser;
use entity_patch::config::AppConfig;
use entity_patch::seed::{catalog_registry, seed_store};
use entity_patch::store::MemoryStore;
use entity_patch::UnitOfWork;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::AsyncReadExt;

#[derive(Parser, Debug)]
#[command(name = "entity-patch")]
#[command(about = "Merge an update document into the demo catalog and show the resulting changes")]
struct Args {
    /// Path to the update document, or `-` to read it from stdin
    document: String,

    /// Entity type of the document root
    #[arg(short = 't', long = "type", default_value = "Item")]
    entity_type: String,

    /// Root id overriding the document's `id`; 0 creates a new row
    #[arg(long)]
    root_id: Option<i64>,

    /// Write the changes to the store and print the flush report
    #[arg(long)]
    apply: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let config = AppConfig::load()?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.filter.as_str()),
    )
    .init();

    let document = read_document(&args.document).await?;

    let registry = Arc::new(catalog_registry()?);
    let store = Arc::new(MemoryStore::new(registry.clone()));
    seed_store(&store)?;
    let surface = config.restricted_surface();

    let mut uow = UnitOfWork::new(registry.as_ref(), store.as_ref(), &surface, store.session());
    let root = uow
        .apply_document(&args.entity_type, &document, args.root_id)
        .await?;

    let changes: Vec<Value> = uow
        .session()
        .changes()
        .into_iter()
        .map(|(node, state)| {
            let entity = uow.graph().node(node);
            json!({
                "node": node.index(),
                "type": entity.entity_type,
                "key": entity.key.to_string(),
                "state": state,
            })
        })
        .collect();

    let mut output = json!({
        "unit_of_work": uow.id(),
        "document": uow.document(root),
        "changes": changes,
    });

    if args.apply {
        let report = uow.save_changes().await?;
        output["flush"] = serde_json::to_value(&report)?;
    }

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn read_document(source: &str) -> anyhow::Result<Value> {
    let raw = if source == "-" {
        let mut raw = String::new();
        tokio::io::stdin()
            .read_to_string(&mut raw)
            .await
            .context("reading document from stdin")?;
        raw
    } else {
        tokio::fs::read_to_string(source)
            .await
            .with_context(|| format!("reading document {}", source))?
    };

    serde_json::from_str(&raw).context("document is not valid JSON")
}
