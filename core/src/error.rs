use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// An atomic store operation was not acknowledged. Never retried here:
    /// re-issuing an increment could double count.
    #[error("store write not acknowledged: {0}")]
    StoreWrite(String),

    #[error("no documents known for token '{0}'")]
    UnknownToken(String),

    #[error("document count {documents} is below the {document_frequency} documents holding '{token}'")]
    InconsistentCount { token: String, documents: i64, document_frequency: usize },

    #[error("token '{token}' does not occur in document '{document}'")]
    ZeroTermFrequency { token: String, document: String },

    #[error("malformed job entry {entry:?}: {reason}")]
    MalformedJob { entry: String, reason: String },

    #[error("bootstrap skipped: queue already holds work (idle={idle}, active={active}, completed={completed})")]
    BootstrapConflict { idle: usize, active: usize, completed: bool },

    #[error("pub/sub channel unavailable: {0}")]
    Channel(String),

    #[error("store backend failure: {0}")]
    Backend(String),
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Error::Backend(e.to_string())
    }
}

impl From<deadpool_redis::redis::RedisError> for Error {
    fn from(e: deadpool_redis::redis::RedisError) -> Self {
        Error::Backend(e.to_string())
    }
}

impl From<deadpool_redis::PoolError> for Error {
    fn from(e: deadpool_redis::PoolError) -> Self {
        Error::Backend(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
