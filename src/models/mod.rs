use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Poll {
    pub id: String,
    pub title: String,
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub results: HashMap<String, i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Poll {
    pub fn new(title: String, options: Vec<String>, api_key: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title,
            options,
            results: HashMap::new(),
            api_key,
            created_at: Utc::now(),
        }
    }

    // Votes recorded so far for one option, zero if none landed yet
    pub fn votes_for(&self, option: &str) -> i64 {
        self.results.get(option).copied().unwrap_or(0)
    }
}

/// One matched vote: the option string that appeared in a feed record.
pub type VoteEvent = String;

/// A single record from the streaming feed. Only `text` matters for voting;
/// control messages without it decode with empty text.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedRecord {
    #[serde(default)]
    pub text: String,
}
