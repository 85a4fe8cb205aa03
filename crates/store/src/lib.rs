use anyhow::{Context, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

mod accounts;
mod conversations;
mod messages;
mod pending;
mod rows;
mod send_log;
mod sessions;
mod settings;
mod takeover;

pub use conversations::ConversationFilter;
pub use messages::InsertOutcome;
pub use settings::SettingsCache;

/// Relational store for the channel gateway. All tables are keyed by
/// `village_id`; upserts go through composite unique keys so concurrent
/// handlers serialize at the database.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    /// Per-conversation insert counters driving the amortized FIFO sweep.
    fifo_counters: Arc<Mutex<HashMap<String, u64>>>,
    settings: SettingsCache,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("Failed to connect to Postgres")?;

        // Run migrations
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        info!("Store initialized");
        Ok(Self {
            settings: SettingsCache::new(),
            fifo_counters: Arc::new(Mutex::new(HashMap::new())),
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn settings_cache(&self) -> &SettingsCache {
        &self.settings
    }

    /// Close the connection pool; part of graceful shutdown.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
