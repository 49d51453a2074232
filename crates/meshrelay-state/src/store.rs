//! SQLite-backed message identity store
//!
//! One row per relayed chat event:
//!
//! ```sql
//! message_map(radio_id INTEGER, chat_event_id TEXT PRIMARY KEY,
//!             chat_room_id TEXT, text TEXT, meshnet TEXT)
//! ```
//!
//! Rows are ordered by SQLite's implicit `rowid`, so "oldest" means
//! "inserted first". An upsert replaces the row and moves it to the end.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

use meshrelay_core::MessageMapping;

use crate::error::{Result, StateError};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS message_map (
    radio_id INTEGER,
    chat_event_id TEXT PRIMARY KEY,
    chat_room_id TEXT,
    text TEXT,
    meshnet TEXT
)";

const RADIO_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_message_map_radio_id ON message_map (radio_id)";

const SELECT: &str = "SELECT radio_id, chat_event_id, chat_room_id, text, meshnet FROM message_map";

/// Durable radio id ↔ chat event id mapping
#[derive(Debug, Clone)]
pub struct MessageIdentityStore {
    pool: SqlitePool,
}

impl MessageIdentityStore {
    /// Open (creating if missing) a database file
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!(path = %path.display(), "Opened message map");
        Ok(store)
    }

    /// Private in-memory database
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // Every connection to :memory: is a separate database, keep exactly one
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        sqlx::query(RADIO_INDEX).execute(&self.pool).await?;
        Ok(())
    }

    /// Insert or replace the mapping for `mapping.chat_event_id`
    pub async fn put(&self, mapping: &MessageMapping) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO message_map
                (radio_id, chat_event_id, chat_room_id, text, meshnet)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(i64::from(mapping.radio_id))
        .bind(&mapping.chat_event_id)
        .bind(&mapping.chat_room_id)
        .bind(&mapping.text)
        .bind(&mapping.meshnet)
        .execute(&self.pool)
        .await?;

        debug!(
            radio_id = mapping.radio_id,
            event_id = %mapping.chat_event_id,
            "Stored message mapping"
        );
        Ok(())
    }

    /// Most recent mapping for a radio packet id
    pub async fn get_by_radio_id(&self, radio_id: u32) -> Result<Option<MessageMapping>> {
        let row = sqlx::query(&format!("{SELECT} WHERE radio_id = ? ORDER BY rowid DESC LIMIT 1"))
            .bind(i64::from(radio_id))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|row| decode_logged(&row)))
    }

    /// Every mapping for a radio packet id, one per room it was relayed to
    pub async fn find_by_radio_id(&self, radio_id: u32) -> Result<Vec<MessageMapping>> {
        let rows = sqlx::query(&format!("{SELECT} WHERE radio_id = ? ORDER BY rowid"))
            .bind(i64::from(radio_id))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().filter_map(decode_logged).collect())
    }

    /// Mapping for a chat event id
    pub async fn get_by_chat_event_id(&self, event_id: &str) -> Result<Option<MessageMapping>> {
        let row = sqlx::query(&format!("{SELECT} WHERE chat_event_id = ?"))
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|row| decode_logged(&row)))
    }

    /// Delete all but the `keep` most recent rows; `keep <= 0` keeps everything
    ///
    /// Returns the number of rows deleted.
    pub async fn prune(&self, keep: i64) -> Result<u64> {
        if keep <= 0 {
            return Ok(0);
        }
        let deleted = sqlx::query(
            "DELETE FROM message_map WHERE rowid NOT IN
                (SELECT rowid FROM message_map ORDER BY rowid DESC LIMIT ?)",
        )
        .bind(keep)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if deleted > 0 {
            debug!(deleted, keep, "Pruned message map");
        }
        Ok(deleted)
    }

    /// Delete every row
    pub async fn wipe(&self) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM message_map")
            .execute(&self.pool)
            .await?
            .rows_affected();
        info!(deleted, "Wiped message map");
        Ok(deleted)
    }

    /// Number of stored rows
    pub async fn len(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM message_map")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Whether no rows are stored
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Close the pool
    pub async fn close(&self) {
        self.pool.close().await;
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn decode_logged(row: &SqliteRow) -> Option<MessageMapping> {
    match decode(row) {
        Ok(mapping) => Some(mapping),
        Err(e) => {
            warn!(error = %e, "Ignoring malformed message map row");
            None
        }
    }
}

fn decode(row: &SqliteRow) -> Result<MessageMapping> {
    let radio_id: i64 = row.try_get("radio_id")?;
    let radio_id = u32::try_from(radio_id)
        .map_err(|_| StateError::InvalidData(format!("radio_id {radio_id} out of range")))?;

    Ok(MessageMapping {
        radio_id,
        chat_event_id: row.try_get("chat_event_id")?,
        chat_room_id: row.try_get("chat_room_id")?,
        text: row.try_get("text")?,
        meshnet: row.try_get("meshnet")?,
    })
}
