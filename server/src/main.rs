use anyhow::{Context, Result};
use axum::Router;
use clap::Parser;
use indexer::manifest::load_manifest;
use search_core::{open_store, Keys, StoreSpec};
use server::build_app;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
struct Args {
    /// Coordination store holding the index (redis:// URL, or sled:<dir> when no indexer is running)
    #[arg(long, env = "INDEXER_STORE", default_value = "sled:./index-store")]
    store: String,
    /// Key namespace inside the store
    #[arg(long, env = "INDEXER_PREFIX", default_value = "indexer")]
    prefix: String,
    /// Manifest mapping document ids to URLs
    #[arg(long)]
    manifest: Option<PathBuf>,
    /// Host to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// Port to bind
    #[arg(long, default_value_t = 8080)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();
    let spec: StoreSpec = args.store.parse()?;
    let store = open_store(&spec, Keys::new(args.prefix.clone())).await.context("opening coordination store")?;
    let urls: HashMap<String, String> = match &args.manifest {
        Some(path) => load_manifest(path)?,
        None => HashMap::new(),
    };
    let app: Router = build_app(store, urls);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
