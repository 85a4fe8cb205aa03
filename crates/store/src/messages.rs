use anyhow::{Context, Result};
use govconnect_core::types::{ConversationKey, NewMessage, StoredMessage};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::rows::MessageRow;
use crate::Store;

/// Per-conversation cap; older messages beyond this are swept.
pub const MAX_CONVERSATION_MESSAGES: i64 = 30;

/// The FIFO sweep runs on every Nth insert per conversation, so the stored
/// count may briefly exceed the cap by N-1.
const FIFO_CHECK_INTERVAL: u64 = 5;

/// Result of an idempotent message insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The `message_id` already exists; nothing was written.
    Duplicate,
}

impl Store {
    /// Insert a message, treating an existing `message_id` as a no-op.
    /// Returns which of the two happened so callers can pattern-match
    /// instead of catching unique-violation errors.
    #[instrument(skip(self, msg), fields(message_id = %msg.message_id))]
    pub async fn insert_message(&self, msg: &NewMessage) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO messages
                (id, village_id, wa_user_id, channel, channel_identifier,
                 message_id, message_text, direction, source, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (message_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&msg.village_id)
        .bind(&msg.wa_user_id)
        .bind(msg.channel.as_str())
        .bind(&msg.channel_identifier)
        .bind(&msg.message_id)
        .bind(&msg.message_text)
        .bind(msg.direction.as_str())
        .bind(msg.source.as_str())
        .bind(msg.timestamp)
        .execute(&self.pool)
        .await
        .context("Failed to insert message")?;

        if result.rows_affected() == 0 {
            return Ok(InsertOutcome::Duplicate);
        }

        self.maybe_enforce_fifo(&msg.conversation_key()).await?;
        Ok(InsertOutcome::Inserted)
    }

    /// Amortized FIFO: only every `FIFO_CHECK_INTERVAL`th insertion per
    /// conversation pays for the sweep.
    async fn maybe_enforce_fifo(&self, key: &ConversationKey) -> Result<()> {
        let due = {
            let mut counters = self.fifo_counters.lock().await;
            let count = counters.entry(key.to_string()).or_insert(0);
            *count += 1;
            *count % FIFO_CHECK_INTERVAL == 0
        };

        if due {
            self.enforce_fifo(key).await?;
        }
        Ok(())
    }

    /// Delete everything beyond the newest `MAX_CONVERSATION_MESSAGES` in
    /// one statement bound to the conversation key. Never crosses
    /// conversations.
    pub async fn enforce_fifo(&self, key: &ConversationKey) -> Result<()> {
        let result = sqlx::query(
            r#"
            DELETE FROM messages
            WHERE id IN (
                SELECT id FROM messages
                WHERE village_id = $1 AND channel = $2 AND channel_identifier = $3
                ORDER BY timestamp DESC
                OFFSET $4
            )
            "#,
        )
        .bind(&key.village_id)
        .bind(key.channel.as_str())
        .bind(&key.channel_identifier)
        .bind(MAX_CONVERSATION_MESSAGES)
        .execute(&self.pool)
        .await
        .context("Failed to enforce conversation FIFO")?;

        if result.rows_affected() > 0 {
            debug!(
                conversation = %key,
                trimmed = result.rows_affected(),
                "FIFO truncation swept old messages"
            );
        }
        Ok(())
    }

    pub async fn message_exists(&self, message_id: &str) -> Result<bool> {
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM messages WHERE message_id = $1")
                .bind(message_id)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to check message existence")?;
        Ok(row.is_some())
    }

    /// Latest `limit` messages of a conversation, oldest first.
    pub async fn recent_messages(
        &self,
        key: &ConversationKey,
        limit: i64,
    ) -> Result<Vec<StoredMessage>> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            r#"
            SELECT id, village_id, wa_user_id, channel, channel_identifier,
                   message_id, message_text, direction, source, timestamp
            FROM messages
            WHERE village_id = $1 AND channel = $2 AND channel_identifier = $3
            ORDER BY timestamp DESC
            LIMIT $4
            "#,
        )
        .bind(&key.village_id)
        .bind(key.channel.as_str())
        .bind(&key.channel_identifier)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch conversation history")?;

        let mut messages: Vec<StoredMessage> =
            rows.into_iter().map(MessageRow::into_message).collect();
        messages.reverse();
        Ok(messages)
    }

    pub async fn conversation_message_count(&self, key: &ConversationKey) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM messages
            WHERE village_id = $1 AND channel = $2 AND channel_identifier = $3
            "#,
        )
        .bind(&key.village_id)
        .bind(key.channel.as_str())
        .bind(&key.channel_identifier)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count conversation messages")?;
        Ok(count)
    }

    /// Spam-rejected messages must not enter history; the row inserted
    /// before the guard decision is removed again.
    pub async fn delete_message(&self, message_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM messages WHERE message_id = $1")
            .bind(message_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete message")?;
        Ok(())
    }

    pub async fn delete_conversation_messages(&self, key: &ConversationKey) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM messages
            WHERE village_id = $1 AND channel = $2 AND channel_identifier = $3
            "#,
        )
        .bind(&key.village_id)
        .bind(key.channel.as_str())
        .bind(&key.channel_identifier)
        .execute(&self.pool)
        .await
        .context("Failed to delete conversation messages")?;
        Ok(result.rows_affected())
    }
}
