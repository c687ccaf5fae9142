//! # Storage Module - Message Persistence
//!
//! SQLite-backed persistence for the outbound queue and the inbound archive.
//! The dispatch engine consumes a small surface (insert, status update, load
//! pending, insert incoming); the reporting queries back external admin and
//! dashboard callers.
//!
//! All access goes through one connection pool in WAL mode; schema changes are
//! embedded migrations. Status codes are persisted as integers (`0` pending,
//! `1` processed, `2` error) because external reporting queries depend on
//! them.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use smsgate::storage::Storage;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let storage = Storage::open(std::path::Path::new("smsgate.db")).await?;
//!     let row = storage.insert_outgoing("u1", "+15551234567", "hello").await?;
//!     println!("queued message {}", row.id);
//!     Ok(())
//! }
//! ```

use std::path::Path;
use std::str::FromStr;

use chrono::Utc;
use log::info;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use thiserror::Error;

/// Attempt ceiling per message. Once a non-processed row reaches this count it
/// is never loaded again.
pub const MAX_RETRIES: i64 = 3;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("duplicate uuid")]
    DuplicateUuid,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db) = e {
            if db.is_unique_violation() {
                return StorageError::DuplicateUuid;
            }
        }
        StorageError::Query(e.to_string())
    }
}

/// Delivery state of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[repr(i32)]
pub enum MessageStatus {
    Pending = 0,
    Processed = 1,
    Error = 2,
}

/// The durable unit of outbound work.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutgoingMessage {
    pub id: i64,
    pub uuid: String,
    pub mobile: String,
    pub body: String,
    pub status: MessageStatus,
    pub retries: i64,
    pub device: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Append-only record of a received message.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IncomingMessage {
    pub id: i64,
    pub mobile: String,
    pub body: String,
    pub device: Option<String>,
    pub created_at: i64,
}

pub fn unix_timestamp() -> i64 {
    Utc::now().timestamp()
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::Io(e.to_string()))?;
            }
        }

        let options =
            SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))
                .map_err(|e| StorageError::Connection(e.to_string()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        info!("message store opened at {}", path.display());

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Migration(e.to_string()))?;
        Ok(())
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Persist a new outbound message as pending. A second insert with the
    /// same uuid fails with [`StorageError::DuplicateUuid`].
    pub async fn insert_outgoing(
        &self,
        uuid: &str,
        mobile: &str,
        body: &str,
    ) -> Result<OutgoingMessage, StorageError> {
        let now = unix_timestamp();

        sqlx::query(
            "INSERT INTO messages (uuid, mobile, body, status, retries, created_at, updated_at) \
             VALUES (?, ?, ?, 0, 0, ?, ?)",
        )
        .bind(uuid)
        .bind(mobile)
        .bind(body)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_outgoing(uuid).await
    }

    pub async fn get_outgoing(&self, uuid: &str) -> Result<OutgoingMessage, StorageError> {
        sqlx::query_as::<_, OutgoingMessage>("SELECT * FROM messages WHERE uuid = ?")
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("message {uuid}")))
    }

    /// Record the outcome of a delivery attempt.
    pub async fn update_outgoing_status(
        &self,
        uuid: &str,
        status: MessageStatus,
        retries: i64,
        device: &str,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE messages SET status = ?, retries = ?, device = ?, updated_at = ? \
             WHERE uuid = ?",
        )
        .bind(status)
        .bind(retries)
        .bind(device)
        .bind(unix_timestamp())
        .bind(uuid)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Up to `limit` messages still eligible for delivery, in insertion order.
    /// The ordering is stable: with no intervening writes, two calls return
    /// the same prefix.
    pub async fn load_pending(&self, limit: i64) -> Result<Vec<OutgoingMessage>, StorageError> {
        let rows = sqlx::query_as::<_, OutgoingMessage>(
            "SELECT * FROM messages WHERE status != ? AND retries < ? ORDER BY id LIMIT ?",
        )
        .bind(MessageStatus::Processed)
        .bind(MAX_RETRIES)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Persist a received message.
    pub async fn insert_incoming(
        &self,
        mobile: &str,
        body: &str,
        device: &str,
    ) -> Result<IncomingMessage, StorageError> {
        let result = sqlx::query(
            "INSERT INTO incoming (mobile, body, device, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(mobile)
        .bind(body)
        .bind(device)
        .bind(unix_timestamp())
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        sqlx::query_as::<_, IncomingMessage>("SELECT * FROM incoming WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("incoming {id}")))
    }

    // =========================================================================
    // Reporting queries
    // =========================================================================

    /// Recent outbound messages, newest first, optionally filtered by status.
    pub async fn outgoing_messages(
        &self,
        status: Option<MessageStatus>,
        limit: i64,
    ) -> Result<Vec<OutgoingMessage>, StorageError> {
        let rows = if let Some(status) = status {
            sqlx::query_as::<_, OutgoingMessage>(
                "SELECT * FROM messages WHERE status = ? ORDER BY id DESC LIMIT ?",
            )
            .bind(status)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, OutgoingMessage>(
                "SELECT * FROM messages ORDER BY id DESC LIMIT ?",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        Ok(rows)
    }

    /// Recent inbound messages, newest first.
    pub async fn incoming_messages(
        &self,
        limit: i64,
    ) -> Result<Vec<IncomingMessage>, StorageError> {
        let rows = sqlx::query_as::<_, IncomingMessage>(
            "SELECT * FROM incoming ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Outbound message counts per calendar day over the last seven days,
    /// newest day first.
    pub async fn last_seven_days_counts(&self) -> Result<Vec<(String, i64)>, StorageError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT strftime('%Y-%m-%d', created_at, 'unixepoch') AS day, COUNT(id) \
             FROM messages GROUP BY day ORDER BY day DESC LIMIT 7",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Outbound totals as `[pending, processed, error]`.
    pub async fn status_summary(&self) -> Result<[i64; 3], StorageError> {
        let rows = sqlx::query_as::<_, (i64, i64)>(
            "SELECT status, COUNT(id) FROM messages GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut summary = [0i64; 3];
        for (status, count) in rows {
            if (0..3).contains(&status) {
                summary[status as usize] = count;
            }
        }
        Ok(summary)
    }
}
