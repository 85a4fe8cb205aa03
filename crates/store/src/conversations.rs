use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use govconnect_core::types::{AiStatus, Conversation, ConversationKey, Direction};
use tracing::instrument;

use crate::rows::ConversationRow;
use crate::Store;

/// Dashboard listing filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationFilter {
    All,
    Takeover,
    Bot,
}

impl ConversationFilter {
    pub fn parse(s: &str) -> ConversationFilter {
        match s {
            "takeover" => ConversationFilter::Takeover,
            "bot" => ConversationFilter::Bot,
            _ => ConversationFilter::All,
        }
    }
}

impl Store {
    /// Upsert driven by a stored message: refreshes the preview and either
    /// bumps (IN) or resets (OUT) the unread counter in one statement.
    #[instrument(skip(self, last_message), fields(conversation = %key))]
    pub async fn apply_message_to_conversation(
        &self,
        key: &ConversationKey,
        wa_user_id: Option<&str>,
        last_message: &str,
        at: DateTime<Utc>,
        direction: Direction,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conversations
                (village_id, channel, channel_identifier, wa_user_id,
                 last_message, last_message_at, unread_count)
            VALUES ($1, $2, $3, $4, $5, $6, CASE WHEN $7 = 'IN' THEN 1 ELSE 0 END)
            ON CONFLICT (village_id, channel, channel_identifier) DO UPDATE SET
                wa_user_id = COALESCE(EXCLUDED.wa_user_id, conversations.wa_user_id),
                last_message = EXCLUDED.last_message,
                last_message_at = EXCLUDED.last_message_at,
                unread_count = CASE
                    WHEN $7 = 'IN' THEN conversations.unread_count + 1
                    ELSE 0
                END
            "#,
        )
        .bind(&key.village_id)
        .bind(key.channel.as_str())
        .bind(&key.channel_identifier)
        .bind(wa_user_id)
        .bind(last_message)
        .bind(at)
        .bind(direction.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to upsert conversation")?;
        Ok(())
    }

    pub async fn set_ai_status(
        &self,
        key: &ConversationKey,
        status: Option<AiStatus>,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE conversations
            SET ai_status = $4, ai_error_message = $5
            WHERE village_id = $1 AND channel = $2 AND channel_identifier = $3
            "#,
        )
        .bind(&key.village_id)
        .bind(key.channel.as_str())
        .bind(&key.channel_identifier)
        .bind(status.map(|s| s.as_str()))
        .bind(error_message)
        .execute(&self.pool)
        .await
        .context("Failed to update conversation AI status")?;
        Ok(())
    }

    pub async fn set_pending_message_id(
        &self,
        key: &ConversationKey,
        pending_message_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE conversations
            SET pending_message_id = $4
            WHERE village_id = $1 AND channel = $2 AND channel_identifier = $3
            "#,
        )
        .bind(&key.village_id)
        .bind(key.channel.as_str())
        .bind(&key.channel_identifier)
        .bind(pending_message_id)
        .execute(&self.pool)
        .await
        .context("Failed to update conversation pending message")?;
        Ok(())
    }

    /// Name/phone pushed by the AI orchestrator or extracted from webhook
    /// profile data. Creates the conversation when it does not exist yet.
    pub async fn update_conversation_profile(
        &self,
        key: &ConversationKey,
        user_name: Option<&str>,
        user_phone: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conversations
                (village_id, channel, channel_identifier, user_name, user_phone)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (village_id, channel, channel_identifier) DO UPDATE SET
                user_name = COALESCE(EXCLUDED.user_name, conversations.user_name),
                user_phone = COALESCE(EXCLUDED.user_phone, conversations.user_phone)
            "#,
        )
        .bind(&key.village_id)
        .bind(key.channel.as_str())
        .bind(&key.channel_identifier)
        .bind(user_name)
        .bind(user_phone)
        .execute(&self.pool)
        .await
        .context("Failed to update conversation profile")?;
        Ok(())
    }

    pub async fn mark_conversation_read(&self, key: &ConversationKey) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE conversations
            SET unread_count = 0
            WHERE village_id = $1 AND channel = $2 AND channel_identifier = $3
            "#,
        )
        .bind(&key.village_id)
        .bind(key.channel.as_str())
        .bind(&key.channel_identifier)
        .execute(&self.pool)
        .await
        .context("Failed to mark conversation read")?;
        Ok(())
    }

    pub async fn get_conversation(&self, key: &ConversationKey) -> Result<Option<Conversation>> {
        let row: Option<ConversationRow> = sqlx::query_as(
            r#"
            SELECT village_id, channel, channel_identifier, wa_user_id, user_name,
                   user_phone, last_message, last_message_at, unread_count,
                   is_takeover, ai_status, ai_error_message, pending_message_id
            FROM conversations
            WHERE village_id = $1 AND channel = $2 AND channel_identifier = $3
            "#,
        )
        .bind(&key.village_id)
        .bind(key.channel.as_str())
        .bind(&key.channel_identifier)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch conversation")?;
        Ok(row.map(ConversationRow::into_conversation))
    }

    pub async fn list_conversations(
        &self,
        village_id: &str,
        filter: ConversationFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Conversation>> {
        let rows: Vec<ConversationRow> = sqlx::query_as(
            r#"
            SELECT village_id, channel, channel_identifier, wa_user_id, user_name,
                   user_phone, last_message, last_message_at, unread_count,
                   is_takeover, ai_status, ai_error_message, pending_message_id
            FROM conversations
            WHERE village_id = $1
              AND ($2 = 'all' OR ($2 = 'takeover') = is_takeover)
            ORDER BY last_message_at DESC NULLS LAST
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(village_id)
        .bind(match filter {
            ConversationFilter::All => "all",
            ConversationFilter::Takeover => "takeover",
            ConversationFilter::Bot => "bot",
        })
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list conversations")?;

        Ok(rows
            .into_iter()
            .map(ConversationRow::into_conversation)
            .collect())
    }

    pub async fn delete_conversation(&self, key: &ConversationKey) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM conversations
            WHERE village_id = $1 AND channel = $2 AND channel_identifier = $3
            "#,
        )
        .bind(&key.village_id)
        .bind(key.channel.as_str())
        .bind(&key.channel_identifier)
        .execute(&self.pool)
        .await
        .context("Failed to delete conversation")?;
        Ok(())
    }
}
