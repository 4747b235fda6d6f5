use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, warn};

use fc_common::Message;
use crate::{QueueClient, QueueDepth, QueueError, RawMessage, Result};

/// Embedded single-node queue on SQLite.
///
/// Behaves like an SQS FIFO queue: at most one message per message group is
/// out at a time, and publishing the same message id twice is a no-op.
pub struct SqliteQueue {
    pool: Pool<Sqlite>,
    queue_name: String,
    visibility_timeout_seconds: u32,
}

impl SqliteQueue {
    pub fn new(pool: Pool<Sqlite>, queue_name: String, visibility_timeout_seconds: u32) -> Self {
        Self {
            pool,
            queue_name,
            visibility_timeout_seconds,
        }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_messages (
                id TEXT NOT NULL,
                queue_name TEXT NOT NULL,
                message_group_id TEXT,
                receipt_handle TEXT,
                visible_at INTEGER NOT NULL,
                payload TEXT NOT NULL,
                receive_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (queue_name, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_queue_visible
            ON queue_messages (queue_name, visible_at, message_group_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_queue_receipt ON queue_messages (receipt_handle)",
        )
        .execute(&self.pool)
        .await?;

        info!(queue = %self.queue_name, "SQLite queue schema initialized");
        Ok(())
    }

    /// Enqueue a message. Returns its id; a message id already present is skipped.
    pub async fn publish(&self, message: &Message) -> Result<String> {
        let payload = serde_json::to_string(message)?;
        let now = Utc::now();

        // rowid order is publish order, which drives FIFO within a group
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO queue_messages
                (id, queue_name, message_group_id, visible_at, payload)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&self.queue_name)
        .bind(message.group_id())
        .bind(now.timestamp())
        .bind(&payload)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(message_id = %message.id, queue = %self.queue_name, "Duplicate message id, skipping publish");
        } else {
            debug!(
                message_id = %message.id,
                queue = %self.queue_name,
                message_group = ?message.group_id(),
                "Message published to SQLite queue"
            );
        }

        Ok(message.id.clone())
    }

    async fn update_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<u64> {
        let visible_at = Utc::now().timestamp() + seconds as i64;
        let result = sqlx::query(
            "UPDATE queue_messages SET visible_at = ? WHERE receipt_handle = ? AND queue_name = ?",
        )
        .bind(visible_at)
        .bind(receipt_handle)
        .bind(&self.queue_name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl QueueClient for SqliteQueue {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn connect(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Connection {
                queue: self.queue_name.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn receive(&self, max_messages: u32) -> Result<Vec<RawMessage>> {
        let now = Utc::now().timestamp();
        let hidden_until = now + self.visibility_timeout_seconds as i64;

        // Rank across the whole group, not only visible rows, so a group whose
        // head is in flight yields nothing until the head is resolved.
        let rows = sqlx::query(
            r#"
            WITH ranked AS (
                SELECT id, payload, visible_at,
                       ROW_NUMBER() OVER (
                           PARTITION BY COALESCE(message_group_id, id)
                           ORDER BY rowid
                       ) AS rn
                FROM queue_messages
                WHERE queue_name = ?
            )
            SELECT id, payload FROM ranked
            WHERE rn = 1 AND visible_at <= ?
            LIMIT ?
            "#,
        )
        .bind(&self.queue_name)
        .bind(now)
        .bind(max_messages as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let payload: String = row.get("payload");
            let receipt_handle = uuid::Uuid::new_v4().to_string();

            let claimed = sqlx::query(
                r#"
                UPDATE queue_messages
                SET receipt_handle = ?, visible_at = ?, receive_count = receive_count + 1
                WHERE id = ? AND queue_name = ? AND visible_at <= ?
                "#,
            )
            .bind(&receipt_handle)
            .bind(hidden_until)
            .bind(&id)
            .bind(&self.queue_name)
            .bind(now)
            .execute(&self.pool)
            .await?;

            if claimed.rows_affected() == 0 {
                // Claimed by another poll loop in between
                continue;
            }

            messages.push(RawMessage {
                body: payload,
                receipt_handle,
                broker_message_id: Some(id),
            });
        }

        if !messages.is_empty() {
            debug!(queue = %self.queue_name, count = messages.len(), "Received messages from SQLite queue");
        }
        Ok(messages)
    }

    async fn delete(&self, receipt_handle: &str) -> Result<()> {
        let result = sqlx::query(
            "DELETE FROM queue_messages WHERE receipt_handle = ? AND queue_name = ?",
        )
        .bind(receipt_handle)
        .bind(&self.queue_name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(receipt_handle = %receipt_handle, queue = %self.queue_name, "Delete failed, receipt handle unknown");
            return Err(QueueError::NotFound(receipt_handle.to_string()));
        }
        Ok(())
    }

    async fn change_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()> {
        if self.update_visibility(receipt_handle, seconds).await? == 0 {
            warn!(receipt_handle = %receipt_handle, queue = %self.queue_name, "Visibility change failed, receipt handle unknown");
            return Err(QueueError::NotFound(receipt_handle.to_string()));
        }
        Ok(())
    }

    async fn depth(&self) -> Result<Option<QueueDepth>> {
        let now = Utc::now().timestamp();
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN visible_at <= ? THEN 1 ELSE 0 END), 0) AS pending,
                COALESCE(SUM(CASE WHEN visible_at > ? THEN 1 ELSE 0 END), 0) AS not_visible
            FROM queue_messages
            WHERE queue_name = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(&self.queue_name)
        .fetch_one(&self.pool)
        .await?;

        let pending: i64 = row.get("pending");
        let not_visible: i64 = row.get("not_visible");
        Ok(Some(QueueDepth {
            pending: pending as u64,
            not_visible: not_visible as u64,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fc_common::MediationType;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn create_test_queue() -> SqliteQueue {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let queue = SqliteQueue::new(pool, "test-queue".to_string(), 30);
        queue.init_schema().await.unwrap();
        queue
    }

    fn message(id: &str, group: Option<&str>) -> Message {
        Message {
            id: id.to_string(),
            pool_code: "TEST".to_string(),
            auth_token: None,
            signing_secret: None,
            mediation_type: MediationType::HTTP,
            mediation_target: "http://localhost:8080".to_string(),
            message_group_id: group.map(str::to_string),
        }
    }

    fn id_of(raw: &RawMessage) -> String {
        serde_json::from_str::<Message>(&raw.body).unwrap().id
    }

    async fn open_file_queue(path: &std::path::Path) -> SqliteQueue {
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect(&format!("sqlite://{}?mode=rwc", path.display()))
            .await
            .unwrap();
        let queue = SqliteQueue::new(pool, "test-queue".to_string(), 30);
        queue.init_schema().await.unwrap();
        queue
    }

    #[tokio::test]
    async fn test_file_backed_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");

        let queue = open_file_queue(&path).await;
        queue.publish(&message("msg-a", None)).await.unwrap();
        queue.publish(&message("msg-b", None)).await.unwrap();
        let received = queue.receive(1).await.unwrap();
        assert_eq!(id_of(&received[0]), "msg-a");
        queue.delete(&received[0].receipt_handle).await.unwrap();
        queue.pool.close().await;

        // Schema init is idempotent and undeleted messages are still there
        let reopened = open_file_queue(&path).await;
        let received = reopened.receive(10).await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(id_of(&received[0]), "msg-b");
    }

    #[tokio::test]
    async fn test_publish_receive_delete() {
        let queue = create_test_queue().await;
        queue.connect().await.unwrap();

        queue.publish(&message("msg-1", None)).await.unwrap();
        let received = queue.receive(10).await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(id_of(&received[0]), "msg-1");
        assert_eq!(received[0].broker_message_id.as_deref(), Some("msg-1"));

        queue.delete(&received[0].receipt_handle).await.unwrap();
        assert!(queue.receive(10).await.unwrap().is_empty());
        assert_eq!(queue.depth().await.unwrap(), Some(QueueDepth::default()));
    }

    #[tokio::test]
    async fn test_delayed_visibility_hides_message() {
        let queue = create_test_queue().await;
        queue.publish(&message("msg-2", None)).await.unwrap();

        let received = queue.receive(10).await.unwrap();
        queue.change_visibility(&received[0].receipt_handle, 60).await.unwrap();

        assert!(queue.receive(10).await.unwrap().is_empty());
        assert_eq!(
            queue.depth().await.unwrap(),
            Some(QueueDepth { pending: 0, not_visible: 1 })
        );
    }

    #[tokio::test]
    async fn test_group_head_blocks_followers_until_resolved() {
        let queue = create_test_queue().await;
        queue.publish(&message("g-1", Some("group-1"))).await.unwrap();
        queue.publish(&message("g-2", Some("group-1"))).await.unwrap();
        queue.publish(&message("solo", None)).await.unwrap();

        let first = queue.receive(10).await.unwrap();
        let ids: Vec<String> = first.iter().map(id_of).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"g-1".to_string()));
        assert!(ids.contains(&"solo".to_string()));

        // g-2 stays hidden while g-1 is in flight
        assert!(queue.receive(10).await.unwrap().is_empty());

        let head = first.iter().find(|r| id_of(r) == "g-1").unwrap();
        queue.delete(&head.receipt_handle).await.unwrap();

        let next = queue.receive(10).await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(id_of(&next[0]), "g-2");
    }

    #[tokio::test]
    async fn test_duplicate_publish_is_ignored() {
        let queue = create_test_queue().await;
        queue.publish(&message("dup", None)).await.unwrap();
        queue.publish(&message("dup", None)).await.unwrap();

        assert_eq!(queue.receive(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_receipt_handle() {
        let queue = create_test_queue().await;
        assert!(matches!(queue.delete("nope").await, Err(QueueError::NotFound(_))));
        assert!(matches!(
            queue.change_visibility("nope", 10).await,
            Err(QueueError::NotFound(_))
        ));
    }
}
