use async_trait::async_trait;
use govconnect_provider::{ProviderError, ProviderErrorKind, TokenResolver};
use govconnect_store::Store;

/// Token resolution against the store, in the fixed order: session by
/// village id, session by instance slug, then the channel account's
/// reserved token. No process-wide fallback exists on purpose — a missing
/// token is a tenant-configuration fault, not something to paper over.
pub struct StoreTokenResolver {
    store: Store,
}

impl StoreTokenResolver {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TokenResolver for StoreTokenResolver {
    async fn resolve_token(&self, village_id: &str) -> Result<String, ProviderError> {
        let lookup_err = |e: anyhow::Error| {
            ProviderError::new(ProviderErrorKind::ServerError, format!("token lookup failed: {e}"))
        };

        if let Some(session) = self.store.get_session(village_id).await.map_err(lookup_err)? {
            if let Some(token) = session.provider_token.filter(|t| !t.is_empty()) {
                return Ok(token);
            }
        }

        if let Some(session) = self
            .store
            .get_session_by_instance(village_id)
            .await
            .map_err(lookup_err)?
        {
            if let Some(token) = session.provider_token.filter(|t| !t.is_empty()) {
                return Ok(token);
            }
        }

        if let Some(account) = self
            .store
            .get_channel_account(village_id)
            .await
            .map_err(lookup_err)?
        {
            if let Some(token) = account.wa_token.filter(|t| !t.is_empty()) {
                return Ok(token);
            }
        }

        Err(ProviderError::config(format!(
            "no provider token configured for tenant {village_id}"
        )))
    }
}
