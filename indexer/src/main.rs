use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indexer::manifest::{load_manifest, resolve_manifest};
use indexer::{CorpusTokenizer, Indexer, PoolConfig, WorkerPool};
use search_core::tokenizer::tokenize;
use search_core::{open_store, CoordStore, JobQueue, Keys, StoreSpec, TokenStore};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "indexer")]
#[command(about = "Distributed crawl indexer with TF-IDF search", long_about = None)]
struct Cli {
    /// Coordination store: sled:<dir> (single process) or redis://host:port/db
    #[arg(long, env = "INDEXER_STORE", default_value = "sled:./index-store", global = true)]
    store: String,
    /// Key namespace inside the store
    #[arg(long, env = "INDEXER_PREFIX", default_value = "indexer", global = true)]
    prefix: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct ServerArgs {
    /// Manifest mapping document paths to URLs (defaults to <corpus>/bookkeeping.json)
    #[arg(long)]
    manifest: Option<PathBuf>,
    /// Supervisor poll interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    poll_ms: u64,
}

#[derive(Args, Clone)]
struct ClientArgs {
    /// Number of concurrent workers
    #[arg(long, default_value_t = 4)]
    workers: usize,
}

#[derive(Subcommand)]
enum Commands {
    /// Bootstrap the queue and supervise connected clients
    Server {
        /// Corpus directory holding the pre-fetched pages
        #[arg(long, default_value = "./WEBPAGES_RAW")]
        corpus: PathBuf,
        #[command(flatten)]
        server: ServerArgs,
    },
    /// Pull jobs and index pages until the queue is drained
    Client {
        #[arg(long, default_value = "./WEBPAGES_RAW")]
        corpus: PathBuf,
        #[command(flatten)]
        client: ClientArgs,
    },
    /// Server and client in one process (required for the sled store)
    Run {
        #[arg(long, default_value = "./WEBPAGES_RAW")]
        corpus: PathBuf,
        #[command(flatten)]
        server: ServerArgs,
        #[command(flatten)]
        client: ClientArgs,
    },
    /// Print queue depth, connected clients and document count
    Status,
    /// Rank documents for a keyword query
    Search {
        /// Query terms
        #[arg(required = true)]
        terms: Vec<String>,
        /// Maximum results to print
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Manifest used to show source URLs
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let cli = Cli::parse();
    let spec: StoreSpec = cli.store.parse()?;
    let store = open_store(&spec, Keys::new(cli.prefix.clone())).await.context("opening coordination store")?;

    match cli.command {
        Commands::Server { corpus, server } => {
            let pool = server_pool(store, &corpus, &server)?;
            pool.run_until_signal().await
        }
        Commands::Client { corpus, client } => {
            let pool = client_pool(store, corpus, &client);
            pool.run_until_signal().await
        }
        Commands::Run { corpus, server, client } => run_local(store, corpus, &server, &client).await,
        Commands::Status => status(store).await,
        Commands::Search { terms, limit, manifest } => search(store, &terms, limit, manifest).await,
    }
}

fn server_pool(store: Arc<dyn CoordStore>, corpus: &Path, args: &ServerArgs) -> Result<Arc<WorkerPool>> {
    let manifest = resolve_manifest(args.manifest.as_deref(), corpus)?;
    let config = PoolConfig { poll_interval: Duration::from_millis(args.poll_ms), ..PoolConfig::default() };
    Ok(WorkerPool::server(store, manifest, config))
}

fn client_pool(store: Arc<dyn CoordStore>, corpus: PathBuf, args: &ClientArgs) -> Arc<WorkerPool> {
    let indexer = Indexer::new(TokenStore::new(store.clone()), Arc::new(CorpusTokenizer::new(corpus)));
    WorkerPool::client(store, indexer, PoolConfig { workers: args.workers, ..PoolConfig::default() })
}

async fn run_local(store: Arc<dyn CoordStore>, corpus: PathBuf, server_args: &ServerArgs, client_args: &ClientArgs) -> Result<()> {
    let server = server_pool(store.clone(), &corpus, server_args)?;
    let client = client_pool(store, corpus, client_args);
    server.execute().await?;
    client.execute().await?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("listening for ctrl-c")?;
            tracing::warn!("interrupt received");
        }
        _ = client.finished() => tracing::info!("queue drained"),
    }
    client.safe_terminate().await?;
    server.safe_terminate().await
}

async fn status(store: Arc<dyn CoordStore>) -> Result<()> {
    let queue = JobQueue::new(store.clone());
    let tokens = TokenStore::new(store.clone());
    let clients = store.subscriber_count(&store.keys().client_registration()).await?;
    println!("idle jobs:      {}", queue.idle_len().await?);
    println!("active jobs:    {}", queue.active_len().await?);
    println!("exhausted:      {}", queue.is_exhausted().await?);
    println!("clients:        {}", clients);
    println!("documents:      {}", tokens.document_count().await?);
    Ok(())
}

async fn search(store: Arc<dyn CoordStore>, terms: &[String], limit: usize, manifest: Option<PathBuf>) -> Result<()> {
    let urls: HashMap<String, String> = match manifest {
        Some(path) => load_manifest(&path)?,
        None => HashMap::new(),
    };
    let query: Vec<String> = tokenize(&terms.join(" ")).into_iter().map(|(t, _)| t).collect();
    if query.is_empty() {
        println!("no searchable terms in query");
        return Ok(());
    }
    let ranked = TokenStore::new(store).rank(&query, limit).await?;
    if ranked.is_empty() {
        println!("no results");
    }
    for (i, hit) in ranked.iter().enumerate() {
        let url = urls.get(&hit.doc_id).map(String::as_str).unwrap_or("");
        println!("{:>3}. {:<12} {:>8.4}  {}", i + 1, hit.doc_id, hit.score, url);
    }
    Ok(())
}
