pub mod error;
pub mod index;
pub mod job;
pub mod queue;
pub mod store;
pub mod tokenizer;

pub use error::{Error, Result};
pub use index::{DocId, Posting, ScoredDoc, TokenStore};
pub use job::Job;
pub use queue::JobQueue;
pub use store::{open_store, CoordStore, Keys, List, SledStore, StoreSpec, Subscription};
