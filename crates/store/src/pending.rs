use anyhow::{Context, Result};
use govconnect_core::types::{ConversationKey, NewMessage, PendingMessage};
use tracing::{debug, instrument};

use crate::rows::PendingRow;
use crate::Store;

/// After this many delivery failures a pending row stops cycling back to
/// `pending` and parks as `failed`.
pub const MAX_PENDING_RETRIES: i32 = 5;

const PENDING_COLUMNS: &str = r#"
    village_id, wa_user_id, channel, channel_identifier, message_id,
    message_text, status, retry_count, error_msg, created_at, updated_at
"#;

impl Store {
    /// Queue a freshly ingested message for AI processing.
    pub async fn create_pending(&self, msg: &NewMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pending_messages
                (village_id, wa_user_id, channel, channel_identifier,
                 message_id, message_text, status)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending')
            ON CONFLICT (message_id) DO NOTHING
            "#,
        )
        .bind(&msg.village_id)
        .bind(&msg.wa_user_id)
        .bind(msg.channel.as_str())
        .bind(&msg.channel_identifier)
        .bind(&msg.message_id)
        .bind(&msg.message_text)
        .execute(&self.pool)
        .await
        .context("Failed to create pending message")?;
        Ok(())
    }

    pub async fn get_pending(&self, message_id: &str) -> Result<Option<PendingMessage>> {
        let row: Option<PendingRow> = sqlx::query_as(&format!(
            "SELECT {PENDING_COLUMNS} FROM pending_messages WHERE message_id = $1"
        ))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch pending message")?;
        Ok(row.map(PendingRow::into_pending))
    }

    pub async fn mark_pending_processing(&self, message_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE pending_messages
            SET status = 'processing', updated_at = now()
            WHERE message_id = $1
            "#,
        )
        .bind(message_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark pending processing")?;
        Ok(())
    }

    /// Park superseded bubbles as `completed` (kept until the janitor
    /// sweeps them) so a late AI reply can be recognized and suppressed.
    #[instrument(skip(self))]
    pub async fn mark_pending_completed(&self, message_ids: &[String]) -> Result<()> {
        if message_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE pending_messages
            SET status = 'completed', updated_at = now()
            WHERE message_id = ANY($1)
            "#,
        )
        .bind(message_ids)
        .execute(&self.pool)
        .await
        .context("Failed to complete pending messages")?;
        Ok(())
    }

    /// A successfully delivered reply removes its pending rows outright.
    pub async fn delete_pending(&self, message_ids: &[String]) -> Result<()> {
        if message_ids.is_empty() {
            return Ok(());
        }
        sqlx::query("DELETE FROM pending_messages WHERE message_id = ANY($1)")
            .bind(message_ids)
            .execute(&self.pool)
            .await
            .context("Failed to delete pending messages")?;
        Ok(())
    }

    /// Retriable failure: bump the retry counter and either cycle back to
    /// `pending` or park as `failed` at the cap.
    pub async fn mark_pending_failed(
        &self,
        message_ids: &[String],
        error_msg: &str,
    ) -> Result<()> {
        if message_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE pending_messages
            SET retry_count = retry_count + 1,
                status = CASE
                    WHEN retry_count + 1 >= $3 THEN 'failed'
                    ELSE 'pending'
                END,
                error_msg = $2,
                updated_at = now()
            WHERE message_id = ANY($1) AND status <> 'failed'
            "#,
        )
        .bind(message_ids)
        .bind(error_msg)
        .bind(MAX_PENDING_RETRIES)
        .execute(&self.pool)
        .await
        .context("Failed to mark pending failed")?;
        Ok(())
    }

    /// Most recent pending row of a conversation; the AI-retry entry point.
    pub async fn latest_pending_for_conversation(
        &self,
        key: &ConversationKey,
    ) -> Result<Option<PendingMessage>> {
        let row: Option<PendingRow> = sqlx::query_as(&format!(
            r#"
            SELECT {PENDING_COLUMNS} FROM pending_messages
            WHERE village_id = $1 AND channel = $2 AND channel_identifier = $3
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(&key.village_id)
        .bind(key.channel.as_str())
        .bind(&key.channel_identifier)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch latest pending message")?;
        Ok(row.map(PendingRow::into_pending))
    }

    /// Janitor sweep: drop finished rows older than the retention window.
    pub async fn sweep_finished_pending(&self, older_than_hours: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM pending_messages
            WHERE status IN ('completed', 'failed')
              AND updated_at < now() - ($1 * interval '1 hour')
            "#,
        )
        .bind(older_than_hours)
        .execute(&self.pool)
        .await
        .context("Failed to sweep pending messages")?;

        if result.rows_affected() > 0 {
            debug!(swept = result.rows_affected(), "janitor removed finished pending rows");
        }
        Ok(result.rows_affected())
    }
}
