use anyhow::{Context, Result};
use govconnect_core::types::ConversationKey;

use crate::Store;

impl Store {
    /// Append-only audit of outbound attempts; failures are recorded even
    /// when the message row itself is not created.
    pub async fn record_send(
        &self,
        key: &ConversationKey,
        message_text: Option<&str>,
        status: &str,
        error_text: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO send_logs
                (village_id, channel, channel_identifier, message_text, status, error_text)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&key.village_id)
        .bind(key.channel.as_str())
        .bind(&key.channel_identifier)
        .bind(message_text)
        .bind(status)
        .bind(error_text)
        .execute(&self.pool)
        .await
        .context("Failed to record send log")?;
        Ok(())
    }
}
