use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The identity extractor could not derive a key.
    #[error("Malformed Message - {0}")]
    MalformedMessage(String),

    #[error("Stale Message - {0}")]
    StaleMessage(String),

    #[error("Duplicate Message - {0}")]
    DuplicateMessage(String),

    /// An inline primary store operation failed or did not finish within its deadline. This is
    /// fatal for the current batch, dedup is never skipped.
    #[error("Primary Store Unavailable - {0}")]
    PrimaryStoreUnavailable(String),

    /// Witness-local. Never returned from the inline path outside of a rehydration gap.
    #[error("Secondary Store Unavailable - {0}")]
    SecondaryStoreUnavailable(String),

    /// The primary store came up without history and the secondary store could not be consulted.
    #[error("Rehydration Gap - {0}")]
    RehydrationGap(String),

    #[error("Changelog Error - {0}")]
    Changelog(String),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Processing Error - {0}")]
    Processing(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Changelog(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Changelog(format!("encoding: {err}"))
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::SecondaryStoreUnavailable(format!("redis: {err}"))
    }
}
