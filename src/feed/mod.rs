pub mod connection;
pub mod credentials;
pub mod reader;

use crate::models::FeedRecord;

/// The tracked options, with a lowercased copy kept alongside for matching.
#[derive(Debug, Clone, Default)]
pub struct KeywordFilter {
    keywords: Vec<(String, String)>,
}

impl KeywordFilter {
    pub fn new(keywords: Vec<String>) -> Self {
        let keywords = keywords
            .into_iter()
            .map(|keyword| {
                let lowered = keyword.to_lowercase();
                (keyword, lowered)
            })
            .collect();
        Self { keywords }
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keywords.len()
    }

    /// Value of the `track` parameter sent to the feed.
    pub fn track_param(&self) -> String {
        self.keywords
            .iter()
            .map(|(keyword, _)| keyword.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Every keyword contained in `text`, ignoring case, in filter order.
    /// Each keyword matches at most once per text.
    pub fn matches<'a>(&'a self, text: &str) -> Vec<&'a str> {
        if text.is_empty() {
            return Vec::new();
        }
        let text = text.to_lowercase();
        self.keywords
            .iter()
            .filter(|(_, lowered)| text.contains(lowered.as_str()))
            .map(|(keyword, _)| keyword.as_str())
            .collect()
    }
}

/// Incremental decoder for a stream of concatenated JSON records. Chunk
/// boundaries may fall anywhere, including inside a record.
#[derive(Debug, Default)]
pub struct RecordDecoder {
    buf: Vec<u8>,
}

impl RecordDecoder {
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// The next complete record, or `None` until more bytes arrive.
    pub fn next_record(&mut self) -> Result<Option<FeedRecord>, serde_json::Error> {
        let (next, consumed) = {
            let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<FeedRecord>();
            let next = stream.next();
            (next, stream.byte_offset())
        };

        match next {
            None => {
                // Only whitespace (keep-alive newlines) left
                self.buf.clear();
                Ok(None)
            }
            Some(Ok(record)) => {
                self.buf.drain(..consumed);
                Ok(Some(record))
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(e),
        }
    }
}
