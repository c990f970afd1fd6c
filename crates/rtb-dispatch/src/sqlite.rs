use async_trait::async_trait;
use chrono::Utc;
use rtb_common::EventRecord;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::sinks::EventStore;

/// SQLite-backed durable store, one row per event
pub struct SqliteEventStore {
    pool: Pool<Sqlite>,
}

impl SqliteEventStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Connect and make sure the schema exists.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new().max_connections(5).connect(url).await?;
        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                topic TEXT NOT NULL,
                bid_id TEXT NOT NULL,
                campaign_id INTEGER NOT NULL,
                creative_id INTEGER NOT NULL,
                exchange_id TEXT NOT NULL,
                win_price REAL,
                timestamp_bucket INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_events_topic_bucket
            ON events (topic, timestamp_bucket)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("SQLite event store schema initialized");
        Ok(())
    }

    pub async fn count(&self, topic: &str) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM events WHERE topic = ?")
            .bind(topic)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }

    /// Records of a topic in insertion order
    pub async fn records_for(&self, topic: &str) -> Result<Vec<EventRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT bid_id, campaign_id, creative_id, exchange_id, win_price, timestamp_bucket
            FROM events WHERE topic = ? ORDER BY id
            "#,
        )
        .bind(topic)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| EventRecord {
                bid_id: row.get("bid_id"),
                campaign_id: row.get::<i64, _>("campaign_id") as u64,
                creative_id: row.get::<i64, _>("creative_id") as u64,
                exchange_id: row.get("exchange_id"),
                win_price: row.get("win_price"),
                timestamp_bucket: row.get("timestamp_bucket"),
            })
            .collect())
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn insert(&self, topic: &str, record: &EventRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO events
                (topic, bid_id, campaign_id, creative_id, exchange_id, win_price, timestamp_bucket, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(topic)
        .bind(&record.bid_id)
        .bind(record.campaign_id as i64)
        .bind(record.creative_id as i64)
        .bind(&record.exchange_id)
        .bind(record.win_price)
        .bind(record.timestamp_bucket)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        debug!(topic = %topic, bid_id = %record.bid_id, "Event stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn create_test_store() -> SqliteEventStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteEventStore::new(pool);
        store.init_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_insert_and_read_back() {
        let store = create_test_store().await;
        let win = EventRecord {
            bid_id: "b1".to_string(),
            campaign_id: 7,
            creative_id: 3,
            exchange_id: "ex1".to_string(),
            win_price: Some(0.42),
            timestamp_bucket: 1000,
        };
        let click = EventRecord {
            win_price: None,
            ..win.clone()
        };

        store.insert("wins", &win).await.unwrap();
        store.insert("clicks", &click).await.unwrap();

        assert_eq!(store.count("wins").await.unwrap(), 1);
        assert_eq!(store.count("clicks").await.unwrap(), 1);
        assert_eq!(store.records_for("wins").await.unwrap(), vec![win]);
        assert_eq!(store.records_for("clicks").await.unwrap(), vec![click]);
    }
}
