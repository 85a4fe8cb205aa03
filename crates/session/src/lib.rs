//! Tenant-keyed provisioning and lifecycle of provider sessions: one
//! WhatsApp session per village, customer-api-key provisioning through the
//! support plane, status reconciliation, and the duplicate-number guard
//! that keeps a number from being silently hijacked by another tenant.

use std::sync::Arc;

use anyhow::{Context, Result};
use govconnect_core::config::AppConfig;
use govconnect_core::types::{Session, SessionStatus};
use govconnect_provider::{CreateSessionRequest, ProviderClient, ProviderError};
use govconnect_store::Store;
use serde::Serialize;
use tracing::{info, warn};

mod tokens;

pub use tokens::StoreTokenResolver;

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub village_id: String,
    pub connected: bool,
    pub logged_in: bool,
    pub status: Option<SessionStatus>,
    pub wa_number: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateCheck {
    pub is_duplicate: bool,
    pub existing_village_id: Option<String>,
}

pub struct SessionManager {
    store: Store,
    provider: Arc<ProviderClient>,
    public_base_url: Option<String>,
}

impl SessionManager {
    pub fn new(store: Store, provider: Arc<ProviderClient>, config: &AppConfig) -> Self {
        Self {
            store,
            provider,
            public_base_url: config.public_channel_base_url.clone(),
        }
    }

    /// Provision (or re-provision) the tenant's session.
    ///
    /// Legacy rows without a support user are logged out and dropped first.
    /// The support user upsert is idempotent; when the provider withholds
    /// the api key (existing user) it is rotated. Without a support plane
    /// the manager degrades to the channel account's reserved token.
    pub async fn create(
        &self,
        village_id: &str,
        admin_id: Option<&str>,
        slug: Option<&str>,
    ) -> Result<Session> {
        let existing = self.store.get_session(village_id).await?;
        if let Some(ref old) = existing {
            if old.support_user_id.is_none() {
                info!(village_id, "replacing legacy session without support user");
                if let Some(token) = old.provider_token.as_deref() {
                    if let Err(e) = self.provider.logout_with_token(token).await {
                        warn!(village_id, error = %e, "legacy session logout failed");
                    }
                }
                self.store.delete_session(village_id).await?;
            }
        }

        let instance_name = slug
            .map(str::to_string)
            .or_else(|| existing.as_ref().and_then(|s| s.instance_name.clone()))
            .unwrap_or_else(|| village_id.to_string());

        let mut session = Session {
            village_id: village_id.to_string(),
            instance_name: Some(instance_name.clone()),
            admin_id: admin_id.map(str::to_string),
            provider_token: None,
            status: None,
            wa_number: None,
            support_user_id: None,
            support_api_key: None,
            support_session_id: None,
            last_connected_at: None,
        };

        if self.provider.has_support_plane() {
            let webhook_url = self
                .public_base_url
                .as_deref()
                .map(|base| format!("{}/webhook", base.trim_end_matches('/')))
                .context("PUBLIC_CHANNEL_BASE_URL is required to provision a session")?;

            let user = self.provider.provision_user(village_id).await?;
            let api_key = match user.api_key {
                Some(key) => key,
                // Existing user: the key is only shown once, so mint a new one.
                None => self.provider.rotate_user_key(&user.id).await?,
            };

            let request = CreateSessionRequest::new(&instance_name, &webhook_url);
            let created = self.provider.create_session(&api_key, &request).await?;

            session.provider_token = Some(created.token);
            session.support_user_id = Some(user.id);
            session.support_api_key = Some(api_key);
            session.support_session_id = Some(created.id);
        } else {
            // Degraded mode: no support plane configured. The gateway token
            // must come from the channel account's reserve.
            warn!(
                village_id,
                "WA_SUPPORT_URL unset; creating session in degraded direct mode"
            );
            let account = self.store.get_channel_account(village_id).await?;
            session.provider_token = account.and_then(|a| a.wa_token);
        }

        self.store.upsert_session(&session).await?;
        info!(village_id, instance = %instance_name, "session provisioned");
        Ok(session)
    }

    /// Fetch provider status and reconcile the connected number into both
    /// the session and the channel account.
    pub async fn status(&self, village_id: &str) -> Result<StatusReport> {
        let status = self.provider.session_status(village_id).await?;
        let wa_number = status.wa_number();

        let session_status = if status.connected {
            SessionStatus::Connected
        } else {
            SessionStatus::Disconnected
        };
        self.store
            .update_session_status(village_id, Some(session_status), wa_number.as_deref())
            .await?;
        if let Some(ref number) = wa_number {
            self.store.set_account_wa_number(village_id, number).await?;
        }

        Ok(StatusReport {
            village_id: village_id.to_string(),
            connected: status.connected,
            logged_in: status.logged_in,
            status: Some(session_status),
            wa_number,
        })
    }

    /// Connect the session upstream. Refuses when the number is already
    /// connected on another village; the admin resolves that explicitly via
    /// `force_disconnect_other`.
    pub async fn connect(&self, village_id: &str) -> Result<StatusReport> {
        if let Some(session) = self.store.get_session(village_id).await? {
            if let Some(ref number) = session.wa_number {
                let check = self.check_duplicate(village_id, number).await?;
                if check.is_duplicate {
                    return Err(ProviderError::validation(format!(
                        "number {number} is already connected on village {}",
                        check.existing_village_id.unwrap_or_default()
                    ))
                    .into());
                }
            }
        }

        self.provider.connect(village_id).await?;
        self.resync_status(village_id).await
    }

    pub async fn disconnect(&self, village_id: &str) -> Result<StatusReport> {
        self.provider.disconnect(village_id).await?;
        self.resync_status(village_id).await
    }

    pub async fn logout(&self, village_id: &str) -> Result<StatusReport> {
        self.provider.logout(village_id).await?;
        self.resync_status(village_id).await
    }

    /// Best-effort status refresh after a lifecycle call; upstream lag must
    /// not fail the operation itself.
    async fn resync_status(&self, village_id: &str) -> Result<StatusReport> {
        match self.status(village_id).await {
            Ok(report) => Ok(report),
            Err(e) => {
                warn!(village_id, error = %e, "status resync failed after lifecycle call");
                Ok(StatusReport {
                    village_id: village_id.to_string(),
                    connected: false,
                    logged_in: false,
                    status: None,
                    wa_number: None,
                })
            }
        }
    }

    /// Tear the tenant's session down: logout upstream and delete the
    /// support-side session best-effort, then drop the local row and
    /// disable outbound WhatsApp for the account.
    pub async fn delete(&self, village_id: &str) -> Result<()> {
        let session = self.store.get_session(village_id).await?;

        if let Some(ref session) = session {
            if let Some(token) = session.provider_token.as_deref() {
                if let Err(e) = self.provider.logout_with_token(token).await {
                    warn!(village_id, error = %e, "upstream logout failed during delete");
                }
            }
            if let (Some(api_key), Some(session_id)) = (
                session.support_api_key.as_deref(),
                session.support_session_id.as_deref(),
            ) {
                if let Err(e) = self
                    .provider
                    .delete_support_session(api_key, session_id)
                    .await
                {
                    warn!(village_id, error = %e, "support session delete failed");
                }
            }
        }

        self.store.delete_session(village_id).await?;
        self.store.set_account_wa_enabled(village_id, false).await?;
        info!(village_id, "session deleted");
        Ok(())
    }

    /// Is `wa_number` connected on a different village right now?
    pub async fn check_duplicate(
        &self,
        village_id: &str,
        wa_number: &str,
    ) -> Result<DuplicateCheck> {
        let other = self
            .store
            .find_connected_duplicate(wa_number, village_id)
            .await?;
        Ok(DuplicateCheck {
            is_duplicate: other.is_some(),
            existing_village_id: other.map(|s| s.village_id),
        })
    }

    /// Explicit admin override: disconnect and delete another tenant's
    /// session so this tenant can claim the number. Never called implicitly.
    pub async fn force_disconnect_other(
        &self,
        current_village: &str,
        target_village: &str,
    ) -> Result<()> {
        let target = self
            .store
            .get_session(target_village)
            .await?
            .with_context(|| format!("village {target_village} has no session"))?;

        warn!(
            admin_village = current_village,
            target_village = %target.village_id,
            "forced disconnect of another tenant's session"
        );

        if let Err(e) = self.provider.disconnect(target_village).await {
            warn!(target_village, error = %e, "forced disconnect call failed");
        }
        self.delete(target_village).await
    }
}
