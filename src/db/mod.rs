use crate::error::StoreError;
use crate::models::Poll;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use log::info;
use sqlx::{migrate::MigrateDatabase, sqlite::{SqlitePool, SqlitePoolOptions}, Row, Sqlite};
use std::collections::{HashMap, HashSet};

/// The two store operations the vote pipeline depends on.
#[async_trait]
pub trait PollStore: Send + Sync {
    /// Distinct union of every option across all polls, in poll creation and
    /// option order.
    async fn load_options(&self) -> Result<Vec<String>, StoreError>;

    /// Add `count` to `results[option]` of every poll offering `option`.
    /// Returns how many polls were touched.
    async fn increment_results(&self, option: &str, count: i64) -> Result<u64, StoreError>;
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(db_url: &str) -> Result<Self, StoreError> {
        // Create database if it doesn't exist
        if !Sqlite::database_exists(db_url).await.unwrap_or(false) {
            Sqlite::create_database(db_url).await?;
        }

        // Connect to the database
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?;

        // Initialize schema
        Self::init_schema(&pool).await?;
        info!("Connected to poll store at {}", db_url);

        Ok(Self { pool })
    }

    // Single connection: every sqlite::memory: connection is its own database
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        Self::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    // Close the pool, waiting for checked-out connections
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Closed poll store connection");
    }

    // Initialize the database schema
    async fn init_schema(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS polls (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                api_key TEXT,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS poll_options (
                poll_id TEXT NOT NULL,
                text TEXT NOT NULL,
                position INTEGER NOT NULL,
                votes INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (poll_id, text),
                FOREIGN KEY (poll_id) REFERENCES polls(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(pool)
        .await?;

        // Increments look options up by text alone
        sqlx::query("CREATE INDEX IF NOT EXISTS poll_options_text ON poll_options (text);")
            .execute(pool)
            .await?;

        Ok(())
    }

    // Create a new poll in the database
    pub async fn create_poll(&self, poll: &Poll) -> Result<(), StoreError> {
        // Validate options before touching the store
        if poll.options.is_empty() {
            return Err(StoreError::NoOptions);
        }
        let mut seen = HashSet::new();
        for option in &poll.options {
            if !seen.insert(option.as_str()) {
                return Err(StoreError::DuplicateOption(option.clone()));
            }
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO polls (id, title, api_key, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&poll.id)
        .bind(&poll.title)
        .bind(&poll.api_key)
        .bind(poll.created_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .execute(&mut *tx)
        .await?;

        // Insert poll options
        for (i, option) in poll.options.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO poll_options (poll_id, text, position, votes)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(&poll.id)
            .bind(option)
            .bind(i as i64)
            .bind(poll.votes_for(option))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    // Get a poll by ID
    pub async fn get_poll(&self, poll_id: &str) -> Result<Poll, StoreError> {
        // Get the poll
        let poll_row = sqlx::query(
            r#"
            SELECT id, title, api_key, created_at
            FROM polls
            WHERE id = ?
            "#,
        )
        .bind(poll_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::PollNotFound(poll_id.to_string()))?;

        // Parse dates
        let created_at_str = poll_row.get::<String, _>("created_at");
        let created_at = DateTime::parse_from_rfc3339(&created_at_str)
            .map_err(|e| StoreError::Parse(format!("created_at: {}", e)))?
            .with_timezone(&Utc);

        // Get options
        let option_rows = sqlx::query(
            r#"
            SELECT text, votes
            FROM poll_options
            WHERE poll_id = ?
            ORDER BY position
            "#,
        )
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?;

        let mut options = Vec::with_capacity(option_rows.len());
        let mut results = HashMap::new();
        for row in option_rows {
            let text = row.get::<String, _>("text");
            let votes = row.get::<i64, _>("votes");
            // Mirror a document store: a result key only exists once voted on
            if votes != 0 {
                results.insert(text.clone(), votes);
            }
            options.push(text);
        }

        // Create poll object
        Ok(Poll {
            id: poll_row.get("id"),
            title: poll_row.get("title"),
            options,
            results,
            api_key: poll_row.get("api_key"),
            created_at,
        })
    }

    // Get every poll, oldest first
    pub async fn list_polls(&self) -> Result<Vec<Poll>, StoreError> {
        let ids: Vec<String> = sqlx::query("SELECT id FROM polls ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| row.get::<String, _>("id"))
            .collect();

        let mut polls = Vec::with_capacity(ids.len());
        for id in ids {
            polls.push(self.get_poll(&id).await?);
        }
        Ok(polls)
    }

    // Delete a poll and its options
    pub async fn delete_poll(&self, poll_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM poll_options WHERE poll_id = ?")
            .bind(poll_id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM polls WHERE id = ?")
            .bind(poll_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if deleted == 0 {
            // Dropping the transaction rolls it back
            return Err(StoreError::PollNotFound(poll_id.to_string()));
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl PollStore for Database {
    async fn load_options(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT o.text
            FROM poll_options o
            JOIN polls p ON p.id = o.poll_id
            ORDER BY p.created_at, p.id, o.position
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        // Keep the first occurrence of each option
        let mut seen = HashSet::new();
        let options = rows
            .into_iter()
            .map(|row| row.get::<String, _>("text"))
            .filter(|text| seen.insert(text.clone()))
            .collect();
        Ok(options)
    }

    async fn increment_results(&self, option: &str, count: i64) -> Result<u64, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE poll_options
            SET votes = votes + ?
            WHERE text = ?
            "#,
        )
        .bind(count)
        .bind(option)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated)
    }
}
