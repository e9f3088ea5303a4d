use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("poll not found: {0}")]
    PollNotFound(String),

    #[error("poll has duplicate option: {0}")]
    DuplicateOption(String),

    #[error("poll must have at least one option")]
    NoOptions,

    #[error("failed to parse stored value: {0}")]
    Parse(String),
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential variable {0} is not set")]
    Missing(String),

    #[error("credential variable {0} is empty")]
    Empty(String),
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("no keywords to track")]
    NoKeywords,

    #[error("invalid feed url: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Credentials(#[from] CredentialError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("feed returned status {0}")]
    Status(u16),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("malformed record: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to connect to broker: {0}")]
    Connect(String),

    #[error("failed to publish to {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("failed to subscribe to {topic}: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("failed to flush producer: {0}")]
    Flush(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },

    #[error("unknown run mode {0:?}, expected stream, count or all")]
    UnknownMode(String),
}
