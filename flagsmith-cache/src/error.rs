use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache io error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted data could not be decoded. Stores downgrade this to a miss.
    #[error("Corrupt cache data: {0}")]
    Corrupt(String),

    #[error("Cache record too large to encode: {0}")]
    TooLarge(String),

    #[error("Cache lock poisoned: {0}")]
    Lock(String),
}
