use anyhow::{Context, Result};
use govconnect_core::types::ChannelAccount;

use crate::rows::AccountRow;
use crate::Store;

impl Store {
    pub async fn get_channel_account(&self, village_id: &str) -> Result<Option<ChannelAccount>> {
        let row: Option<AccountRow> = sqlx::query_as(
            r#"
            SELECT village_id, wa_number, wa_token, webhook_url, enabled_wa, enabled_webchat
            FROM channel_accounts
            WHERE village_id = $1
            "#,
        )
        .bind(village_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch channel account")?;
        Ok(row.map(AccountRow::into_account))
    }

    pub async fn list_channel_accounts(&self) -> Result<Vec<ChannelAccount>> {
        let rows: Vec<AccountRow> = sqlx::query_as(
            r#"
            SELECT village_id, wa_number, wa_token, webhook_url, enabled_wa, enabled_webchat
            FROM channel_accounts
            ORDER BY village_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list channel accounts")?;
        Ok(rows.into_iter().map(AccountRow::into_account).collect())
    }

    pub async fn upsert_channel_account(&self, account: &ChannelAccount) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO channel_accounts
                (village_id, wa_number, wa_token, webhook_url, enabled_wa, enabled_webchat, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, now())
            ON CONFLICT (village_id) DO UPDATE SET
                wa_number = EXCLUDED.wa_number,
                wa_token = EXCLUDED.wa_token,
                webhook_url = EXCLUDED.webhook_url,
                enabled_wa = EXCLUDED.enabled_wa,
                enabled_webchat = EXCLUDED.enabled_webchat,
                updated_at = now()
            "#,
        )
        .bind(&account.village_id)
        .bind(&account.wa_number)
        .bind(&account.wa_token)
        .bind(&account.webhook_url)
        .bind(account.enabled_wa)
        .bind(account.enabled_webchat)
        .execute(&self.pool)
        .await
        .context("Failed to upsert channel account")?;
        Ok(())
    }

    /// Session teardown disables outbound WhatsApp for the tenant without
    /// touching the rest of the account row.
    pub async fn set_account_wa_enabled(&self, village_id: &str, enabled: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO channel_accounts (village_id, enabled_wa, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (village_id) DO UPDATE SET
                enabled_wa = EXCLUDED.enabled_wa,
                updated_at = now()
            "#,
        )
        .bind(village_id)
        .bind(enabled)
        .execute(&self.pool)
        .await
        .context("Failed to toggle channel account")?;
        Ok(())
    }

    /// Status sync mirrors the connected number onto the account row.
    pub async fn set_account_wa_number(&self, village_id: &str, wa_number: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO channel_accounts (village_id, wa_number, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (village_id) DO UPDATE SET
                wa_number = EXCLUDED.wa_number,
                updated_at = now()
            "#,
        )
        .bind(village_id)
        .bind(wa_number)
        .execute(&self.pool)
        .await
        .context("Failed to update channel account number")?;
        Ok(())
    }
}
