use crate::error::ConfigError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_DATABASE_URL: &str = "sqlite:trusty_tally.db";
const DEFAULT_NATS_URL: &str = "nats://localhost:4222";
const DEFAULT_FEED_URL: &str = "https://stream.twitter.com/1.1/statuses/filter.json";

/// Which half of the pipeline this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Read the feed and publish votes.
    Stream,
    /// Consume votes and persist counts.
    Count,
    /// Both, in one process.
    All,
}

impl FromStr for RunMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stream" => Ok(RunMode::Stream),
            "count" => Ok(RunMode::Count),
            "all" => Ok(RunMode::All),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub nats_url: String,
    pub votes_topic: String,
    pub counter_group: String,
    pub feed_url: String,
    pub feed_token_var: String,
    pub reconnect_backoff: Duration,
    pub refresh_interval: Duration,
    pub flush_interval: Duration,
    pub connect_timeout: Duration,
    pub drain_window: Duration,
    pub vote_channel_capacity: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    // Split out so tests don't have to touch the process environment
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let secs = |key: &str, default: u64| -> Result<Duration, ConfigError> {
            parse_or(&lookup, key, default).map(Duration::from_secs)
        };

        Ok(Self {
            database_url: string("DATABASE_URL", DEFAULT_DATABASE_URL),
            nats_url: string("NATS_URL", DEFAULT_NATS_URL),
            votes_topic: string("VOTES_TOPIC", "votes"),
            counter_group: string("COUNTER_GROUP", "counter"),
            feed_url: string("FEED_URL", DEFAULT_FEED_URL),
            feed_token_var: string("FEED_TOKEN_VAR", "FEED_BEARER_TOKEN"),
            reconnect_backoff: secs("RECONNECT_BACKOFF_SECS", 10)?,
            refresh_interval: secs("REFRESH_INTERVAL_SECS", 60)?,
            flush_interval: secs("FLUSH_INTERVAL_SECS", 1)?,
            connect_timeout: secs("CONNECT_TIMEOUT_SECS", 5)?,
            drain_window: parse_or(&lookup, "DRAIN_WINDOW_MILLIS", 500).map(Duration::from_millis)?,
            vote_channel_capacity: match parse_or(&lookup, "VOTE_CHANNEL_CAPACITY", 256)? {
                0 => {
                    return Err(ConfigError::Invalid {
                        key: "VOTE_CHANNEL_CAPACITY".to_string(),
                        value: "0".to_string(),
                    })
                }
                n => n,
            },
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value: raw,
        }),
    }
}
