use anyhow::{Context, Result};
use govconnect_core::types::Settings;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::rows::SettingsRow;
use crate::Store;

/// Read-mostly cache over the single settings row. Writers replace the
/// whole struct; `mark_as_read` reloads before honoring the toggle so
/// dashboard changes are observed without a restart.
#[derive(Clone)]
pub struct SettingsCache {
    inner: Arc<RwLock<Settings>>,
}

impl SettingsCache {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Settings::default())),
        }
    }

    pub async fn cached(&self) -> Settings {
        *self.inner.read().await
    }

    pub(crate) async fn replace(&self, settings: Settings) {
        *self.inner.write().await = settings;
    }
}

impl Store {
    pub async fn fetch_settings(&self) -> Result<Settings> {
        let row: Option<SettingsRow> = sqlx::query_as(
            "SELECT auto_read_messages, typing_indicator FROM settings WHERE id = 'default'",
        )
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch settings")?;
        Ok(row.map(SettingsRow::into_settings).unwrap_or_default())
    }

    /// Re-read the row and refresh the cache; returns the fresh value.
    pub async fn reload_settings(&self) -> Result<Settings> {
        let settings = self.fetch_settings().await?;
        self.settings.replace(settings).await;
        Ok(settings)
    }

    pub async fn update_settings(&self, settings: Settings) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (id, auto_read_messages, typing_indicator, updated_at)
            VALUES ('default', $1, $2, now())
            ON CONFLICT (id) DO UPDATE SET
                auto_read_messages = EXCLUDED.auto_read_messages,
                typing_indicator = EXCLUDED.typing_indicator,
                updated_at = now()
            "#,
        )
        .bind(settings.auto_read_messages)
        .bind(settings.typing_indicator)
        .execute(&self.pool)
        .await
        .context("Failed to update settings")?;
        self.settings.replace(settings).await;
        Ok(())
    }
}
