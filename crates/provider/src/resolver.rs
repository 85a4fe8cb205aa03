use async_trait::async_trait;

use crate::error::ProviderError;

/// Looks up the gateway token for a tenant on every outbound call.
///
/// Resolution order is fixed: session by `village_id`, then session by
/// `instance_name`, then the channel account's reserved token. There is no
/// process-wide fallback token; exhaustion is a `CONFIG_ERROR`.
#[async_trait]
pub trait TokenResolver: Send + Sync {
    async fn resolve_token(&self, village_id: &str) -> Result<String, ProviderError>;
}

/// Fixed-token resolver for tests and single-tenant tooling.
pub struct StaticTokenResolver(pub String);

#[async_trait]
impl TokenResolver for StaticTokenResolver {
    async fn resolve_token(&self, _village_id: &str) -> Result<String, ProviderError> {
        Ok(self.0.clone())
    }
}
