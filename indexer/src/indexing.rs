use search_core::tokenizer::{tokenize_page, TokenMeta};
use search_core::{Error, Job, Result, TokenStore};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

/// Turns a document path into weighted tokens.
pub trait PageTokenizer: Send + Sync + 'static {
    fn tokenize(&self, path: &str) -> io::Result<Vec<TokenMeta>>;
}

/// Reads pages from a corpus directory on disk.
pub struct CorpusTokenizer {
    root: PathBuf,
}

impl CorpusTokenizer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PageTokenizer for CorpusTokenizer {
    fn tokenize(&self, path: &str) -> io::Result<Vec<TokenMeta>> {
        tokenize_page(&self.root, path)
    }
}

/// Writes one job's weighted tokens into the index.
#[derive(Clone)]
pub struct Indexer {
    tokens: TokenStore,
    tokenizer: Arc<dyn PageTokenizer>,
}

impl Indexer {
    pub fn new(tokens: TokenStore, tokenizer: Arc<dyn PageTokenizer>) -> Self {
        Self { tokens, tokenizer }
    }

    /// Adds every token weight of the page. The document itself was counted
    /// when the job was claimed. Returns the number of distinct tokens.
    pub async fn run(&self, job: &Job) -> Result<usize> {
        let tokenizer = Arc::clone(&self.tokenizer);
        let path = job.path.clone();
        let metas = match tokio::task::spawn_blocking(move || tokenizer.tokenize(&path)).await {
            Ok(Ok(metas)) => metas,
            Ok(Err(e)) => {
                tracing::warn!(path = %job.path, error = %e, "unreadable page indexed as empty document");
                Vec::new()
            }
            Err(e) => return Err(Error::Backend(format!("tokenizer task failed: {e}"))),
        };

        for meta in &metas {
            self.tokens.add_weight(&meta.token, &job.path, meta.weight).await?;
        }
        tracing::debug!(path = %job.path, url = %job.url, tokens = metas.len(), "indexed document");
        Ok(metas.len())
    }

    /// Flushes pending index writes; called once a worker stops pulling.
    pub async fn safe_terminate(&self) -> Result<()> {
        self.tokens.flush().await
    }
}
