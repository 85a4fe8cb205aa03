use anyhow::{Context, Result};
use govconnect_core::types::{Session, SessionStatus};
use tracing::instrument;

use crate::rows::SessionRow;
use crate::Store;

const SESSION_COLUMNS: &str = r#"
    village_id, instance_name, admin_id, provider_token, status, wa_number,
    support_user_id, support_api_key, support_session_id, last_connected_at
"#;

impl Store {
    pub async fn get_session(&self, village_id: &str) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE village_id = $1"
        ))
        .bind(village_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch session by village")?;
        Ok(row.map(SessionRow::into_session))
    }

    /// Webhooks carry the provider slug rather than the tenant id; this is
    /// the reverse mapping.
    pub async fn get_session_by_instance(&self, instance_name: &str) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE instance_name = $1"
        ))
        .bind(instance_name)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch session by instance name")?;
        Ok(row.map(SessionRow::into_session))
    }

    /// Persist the outcome of a provisioning run. At most one row per
    /// village; re-provisioning replaces the provider-side identifiers.
    #[instrument(skip(self, session), fields(village_id = %session.village_id))]
    pub async fn upsert_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions
                (village_id, instance_name, admin_id, provider_token, status,
                 wa_number, support_user_id, support_api_key, support_session_id,
                 last_connected_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, now())
            ON CONFLICT (village_id) DO UPDATE SET
                instance_name = EXCLUDED.instance_name,
                admin_id = COALESCE(EXCLUDED.admin_id, sessions.admin_id),
                provider_token = EXCLUDED.provider_token,
                status = EXCLUDED.status,
                wa_number = COALESCE(EXCLUDED.wa_number, sessions.wa_number),
                support_user_id = EXCLUDED.support_user_id,
                support_api_key = EXCLUDED.support_api_key,
                support_session_id = EXCLUDED.support_session_id,
                last_connected_at = COALESCE(EXCLUDED.last_connected_at, sessions.last_connected_at),
                updated_at = now()
            "#,
        )
        .bind(&session.village_id)
        .bind(&session.instance_name)
        .bind(&session.admin_id)
        .bind(&session.provider_token)
        .bind(session.status.map(|s| s.as_str()))
        .bind(&session.wa_number)
        .bind(&session.support_user_id)
        .bind(&session.support_api_key)
        .bind(&session.support_session_id)
        .bind(session.last_connected_at)
        .execute(&self.pool)
        .await
        .context("Failed to upsert session")?;
        Ok(())
    }

    /// Reconcile provider-reported status into the row. A `connected`
    /// transition also stamps `last_connected_at`.
    pub async fn update_session_status(
        &self,
        village_id: &str,
        status: Option<SessionStatus>,
        wa_number: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sessions
            SET status = $2,
                wa_number = COALESCE($3, wa_number),
                last_connected_at = CASE
                    WHEN $2 = 'connected' THEN now()
                    ELSE last_connected_at
                END,
                updated_at = now()
            WHERE village_id = $1
            "#,
        )
        .bind(village_id)
        .bind(status.map(|s| s.as_str()))
        .bind(wa_number)
        .execute(&self.pool)
        .await
        .context("Failed to update session status")?;
        Ok(())
    }

    pub async fn delete_session(&self, village_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE village_id = $1")
            .bind(village_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete session")?;
        Ok(())
    }

    /// Cross-tenant probe: is this number already connected elsewhere?
    /// One of the two sanctioned cross-tenant reads.
    pub async fn find_connected_duplicate(
        &self,
        wa_number: &str,
        exclude_village: &str,
    ) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SESSION_COLUMNS} FROM sessions
            WHERE wa_number = $1 AND village_id <> $2 AND status = 'connected'
            LIMIT 1
            "#
        ))
        .bind(wa_number)
        .bind(exclude_village)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to probe duplicate number")?;
        Ok(row.map(SessionRow::into_session))
    }
}
