pub mod indexing;
pub mod manifest;
pub mod pool;

pub use indexing::{CorpusTokenizer, Indexer, PageTokenizer};
pub use pool::{Mode, PoolConfig, PoolState, WorkerPool, TERMINATE};
