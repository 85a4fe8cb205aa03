use anyhow::{Context, Result};
use chrono::Utc;
use govconnect_core::types::{ConversationKey, TakeoverSession};
use tracing::instrument;
use uuid::Uuid;

use crate::rows::TakeoverRow;
use crate::Store;

impl Store {
    pub async fn active_takeover(&self, key: &ConversationKey) -> Result<Option<TakeoverSession>> {
        let row: Option<TakeoverRow> = sqlx::query_as(
            r#"
            SELECT id, village_id, channel, channel_identifier, admin_id,
                   admin_name, reason, started_at, ended_at
            FROM takeover_sessions
            WHERE village_id = $1 AND channel = $2 AND channel_identifier = $3
              AND ended_at IS NULL
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(&key.village_id)
        .bind(key.channel.as_str())
        .bind(&key.channel_identifier)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch active takeover")?;
        Ok(row.map(TakeoverRow::into_takeover))
    }

    /// Idempotent start: any active row for the conversation is ended first,
    /// and the conversation flag moves in the same transaction so the
    /// "one active row ⇔ is_takeover" invariant cannot be observed broken.
    #[instrument(skip(self, admin_name, reason), fields(conversation = %key))]
    pub async fn start_takeover(
        &self,
        key: &ConversationKey,
        admin_id: &str,
        admin_name: Option<&str>,
        reason: Option<&str>,
    ) -> Result<TakeoverSession> {
        let mut tx = self.pool.begin().await.context("Failed to open transaction")?;

        sqlx::query(
            r#"
            UPDATE takeover_sessions
            SET ended_at = now()
            WHERE village_id = $1 AND channel = $2 AND channel_identifier = $3
              AND ended_at IS NULL
            "#,
        )
        .bind(&key.village_id)
        .bind(key.channel.as_str())
        .bind(&key.channel_identifier)
        .execute(&mut *tx)
        .await
        .context("Failed to end previous takeover")?;

        let id = Uuid::new_v4();
        let started_at = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO takeover_sessions
                (id, village_id, channel, channel_identifier, admin_id,
                 admin_name, reason, started_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(id)
        .bind(&key.village_id)
        .bind(key.channel.as_str())
        .bind(&key.channel_identifier)
        .bind(admin_id)
        .bind(admin_name)
        .bind(reason)
        .bind(started_at)
        .execute(&mut *tx)
        .await
        .context("Failed to insert takeover")?;

        sqlx::query(
            r#"
            INSERT INTO conversations (village_id, channel, channel_identifier, is_takeover)
            VALUES ($1, $2, $3, TRUE)
            ON CONFLICT (village_id, channel, channel_identifier) DO UPDATE SET
                is_takeover = TRUE
            "#,
        )
        .bind(&key.village_id)
        .bind(key.channel.as_str())
        .bind(&key.channel_identifier)
        .execute(&mut *tx)
        .await
        .context("Failed to flag conversation takeover")?;

        tx.commit().await.context("Failed to commit takeover")?;

        Ok(TakeoverSession {
            id,
            village_id: key.village_id.clone(),
            channel: key.channel,
            channel_identifier: key.channel_identifier.clone(),
            admin_id: admin_id.to_string(),
            admin_name: admin_name.map(str::to_string),
            reason: reason.map(str::to_string),
            started_at,
            ended_at: None,
        })
    }

    /// End the active takeover, dropping the conversation back to the AI.
    pub async fn end_takeover(&self, key: &ConversationKey) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("Failed to open transaction")?;

        let result = sqlx::query(
            r#"
            UPDATE takeover_sessions
            SET ended_at = now()
            WHERE village_id = $1 AND channel = $2 AND channel_identifier = $3
              AND ended_at IS NULL
            "#,
        )
        .bind(&key.village_id)
        .bind(key.channel.as_str())
        .bind(&key.channel_identifier)
        .execute(&mut *tx)
        .await
        .context("Failed to end takeover")?;

        sqlx::query(
            r#"
            UPDATE conversations
            SET is_takeover = FALSE
            WHERE village_id = $1 AND channel = $2 AND channel_identifier = $3
            "#,
        )
        .bind(&key.village_id)
        .bind(key.channel.as_str())
        .bind(&key.channel_identifier)
        .execute(&mut *tx)
        .await
        .context("Failed to clear conversation takeover flag")?;

        tx.commit().await.context("Failed to commit takeover end")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_takeovers(&self, key: &ConversationKey) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM takeover_sessions
            WHERE village_id = $1 AND channel = $2 AND channel_identifier = $3
            "#,
        )
        .bind(&key.village_id)
        .bind(key.channel.as_str())
        .bind(&key.channel_identifier)
        .execute(&self.pool)
        .await
        .context("Failed to delete takeover history")?;
        Ok(())
    }
}
