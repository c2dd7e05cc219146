//! Coordination store: the single source of truth for the job queue and the
//! inverted index.
//!
//! Every operation that must look atomic to concurrent workers (pull, requeue,
//! deduplicate, weight increment) is one method here, and each backend
//! implements it as one indivisible operation. Callers never lock.

pub mod redis_store;
pub mod sled_store;

use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;

pub use redis_store::RedisStore;
pub use sled_store::SledStore;

/// Key names for one deployment. Everything lives under `prefix` so several
/// indexes can share a backend.
#[derive(Debug, Clone)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }
    pub fn prefix(&self) -> &str { &self.prefix }
    pub fn idle(&self) -> String { format!("{}:idle", self.prefix) }
    pub fn active(&self) -> String { format!("{}:active", self.prefix) }
    pub fn jobs_completed(&self) -> String { format!("{}:jobs:completed", self.prefix) }
    pub fn document_count(&self) -> String { format!("{}:document_count", self.prefix) }
    pub fn postings_prefix(&self) -> String { format!("{}:t:", self.prefix) }
    pub fn postings(&self, token: &str) -> String { format!("{}{}", self.postings_prefix(), token) }
    pub fn document_tokens_prefix(&self) -> String { format!("{}:d:", self.prefix) }
    pub fn document_tokens(&self, document: &str) -> String { format!("{}{}", self.document_tokens_prefix(), document) }
    pub fn client_registration(&self) -> String { format!("{}:client-registration", self.prefix) }
    pub fn terminate_broadcast(&self) -> String { format!("{}:terminate-broadcast", self.prefix) }
}

impl Default for Keys {
    fn default() -> Self { Self::new("indexer") }
}

/// Which list an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum List {
    Idle,
    Active,
}

impl List {
    pub fn key(self, keys: &Keys) -> String {
        match self {
            List::Idle => keys.idle(),
            List::Active => keys.active(),
        }
    }
}

/// A live subscription to one topic. The subscriber counts as connected
/// until this value is dropped.
pub struct Subscription {
    messages: BoxStream<'static, String>,
}

impl Subscription {
    pub fn new(messages: BoxStream<'static, String>) -> Self {
        Self { messages }
    }

    /// Waits for the next message; `None` once the channel is closed.
    pub async fn next(&mut self) -> Option<String> {
        self.messages.next().await
    }
}

#[async_trait]
pub trait CoordStore: Send + Sync {
    fn keys(&self) -> &Keys;

    /// Appends all entries to the tail of `list` in one write.
    async fn push_all(&self, list: List, entries: &[String]) -> Result<()>;
    /// Pops the head of idle onto the tail of active and counts one more
    /// document, in one atomic step. Every active entry therefore carries
    /// exactly one count, which `requeue_active` takes back.
    async fn claim_next(&self) -> Result<Option<String>>;
    /// Drops one active entry and its document count atomically; returns
    /// whether the entry was found.
    async fn release_claim(&self, entry: &str) -> Result<bool>;
    /// Removes one instance of `entry`; returns whether one was found.
    async fn remove_one(&self, list: List, entry: &str) -> Result<bool>;
    async fn range(&self, list: List) -> Result<Vec<String>>;
    async fn len(&self, list: List) -> Result<usize>;

    /// Moves every active entry to the tail of idle, decrements the document
    /// count once per entry and, when `strip_postings` is set, removes the
    /// postings of each moved document. All in one atomic step; returns the
    /// number of entries moved.
    async fn requeue_active(&self, strip_postings: bool) -> Result<usize>;

    async fn flag(&self, key: &str) -> Result<bool>;
    async fn set_flag(&self, key: &str, value: bool) -> Result<()>;
    async fn counter(&self, key: &str) -> Result<i64>;
    async fn incr_counter(&self, key: &str, delta: i64) -> Result<i64>;

    /// Adds `amount` to the weight of `document` under `token` and returns
    /// the new weight.
    async fn incr_posting(&self, token: &str, document: &str, amount: i64) -> Result<i64>;
    /// Postings of `token` ordered by weight (ascending unless `descending`).
    async fn postings(&self, token: &str, descending: bool) -> Result<Vec<(String, i64)>>;
    async fn posting_count(&self, token: &str) -> Result<usize>;
    async fn posting(&self, token: &str, document: &str) -> Result<Option<i64>>;
    async fn tokens(&self) -> Result<Vec<String>>;
    async fn tokens_for_document(&self, document: &str) -> Result<Vec<String>>;
    /// Removes every posting of the given documents in one atomic batch.
    /// Returns the number of postings removed; safe to repeat.
    async fn remove_documents(&self, documents: &[String]) -> Result<usize>;

    /// Returns the number of subscribers that received the message.
    async fn publish(&self, topic: &str, message: &str) -> Result<usize>;
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;
    async fn subscriber_count(&self, topic: &str) -> Result<usize>;

    /// Makes prior writes durable.
    async fn flush(&self) -> Result<()>;
}

/// Where the coordination store lives, parsed from `sled:<dir>` or a
/// `redis://` / `rediss://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreSpec {
    Sled(PathBuf),
    Redis(String),
}

impl std::str::FromStr for StoreSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.starts_with("redis://") || s.starts_with("rediss://") {
            Ok(StoreSpec::Redis(s.to_string()))
        } else if let Some(dir) = s.strip_prefix("sled:") {
            if dir.is_empty() {
                return Err(Error::Backend("sled store needs a directory, e.g. sled:./store".into()));
            }
            Ok(StoreSpec::Sled(PathBuf::from(dir)))
        } else {
            Err(Error::Backend(format!("unrecognised store location '{s}' (expected sled:<dir> or redis://...)")))
        }
    }
}

pub async fn open_store(spec: &StoreSpec, keys: Keys) -> Result<Arc<dyn CoordStore>> {
    let store: Arc<dyn CoordStore> = match spec {
        StoreSpec::Sled(dir) => Arc::new(SledStore::open(dir, keys)?),
        StoreSpec::Redis(url) => Arc::new(RedisStore::connect(url, keys).await?),
    };
    tracing::info!(?spec, "opened coordination store");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_store_locations() {
        assert_eq!("sled:./data".parse::<StoreSpec>().unwrap(), StoreSpec::Sled(PathBuf::from("./data")));
        assert_eq!(
            "redis://127.0.0.1:6379/0".parse::<StoreSpec>().unwrap(),
            StoreSpec::Redis("redis://127.0.0.1:6379/0".into())
        );
        assert!("sled:".parse::<StoreSpec>().is_err());
        assert!("postgres://x".parse::<StoreSpec>().is_err());
    }

    #[test]
    fn keys_are_namespaced() {
        let keys = Keys::new("ix");
        assert_eq!(keys.idle(), "ix:idle");
        assert_eq!(keys.postings("foo"), "ix:t:foo");
        assert_eq!(keys.document_tokens("0/0"), "ix:d:0/0");
        assert_eq!(List::Active.key(&keys), "ix:active");
    }
}
