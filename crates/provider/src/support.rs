use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument};

use crate::error::ProviderError;
use crate::ProviderClient;

/// Tenant user on the provider's multi-customer control plane.
#[derive(Debug, Clone, Deserialize)]
pub struct SupportUser {
    #[serde(rename = "Id")]
    pub id: String,
    /// Only returned on first provisioning; existing users need a rotate.
    #[serde(rename = "ApiKey", default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupportSession {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Token")]
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupportSessionInfo {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name", default)]
    pub name: Option<String>,
}

/// Customer session creation payload; the support plane speaks snake_case.
#[derive(Debug, Clone, Serialize)]
pub struct CreateSessionRequest {
    pub name: String,
    pub webhook_url: String,
    pub auto_read_enabled: bool,
    pub typing_enabled: bool,
    pub events: String,
}

impl CreateSessionRequest {
    pub fn new(name: &str, webhook_url: &str) -> Self {
        Self {
            name: name.to_string(),
            webhook_url: webhook_url.to_string(),
            auto_read_enabled: true,
            typing_enabled: true,
            events: "All".to_string(),
        }
    }
}

#[derive(Deserialize)]
struct ApiKeyData {
    #[serde(rename = "ApiKey")]
    api_key: String,
}

impl ProviderClient {
    /// Idempotent upsert of the tenant user. The provider returns the same
    /// user on repeat calls, without the api key.
    #[instrument(skip(self))]
    pub async fn provision_user(&self, village_id: &str) -> Result<SupportUser, ProviderError> {
        let base = self.support_base()?.to_string();
        let key = self.support_key()?.to_string();
        let payload = json!({ "Name": village_id });

        let resp = self
            .session_http
            .send(|c| {
                c.post(format!("{base}/admin/users"))
                    .header("Authorization", &key)
                    .json(&payload)
            })
            .await?;

        let user: SupportUser = Self::parse(resp).await?;
        info!(village_id, user_id = %user.id, fresh_key = user.api_key.is_some(), "support user provisioned");
        Ok(user)
    }

    /// Mint a fresh customer api key for an already-provisioned user.
    pub async fn rotate_user_key(&self, user_id: &str) -> Result<String, ProviderError> {
        let base = self.support_base()?.to_string();
        let key = self.support_key()?.to_string();

        let resp = self
            .session_http
            .send(|c| {
                c.post(format!("{base}/admin/users/{user_id}/rotate-key"))
                    .header("Authorization", &key)
            })
            .await?;

        let data: ApiKeyData = Self::parse(resp).await?;
        Ok(data.api_key)
    }

    pub async fn create_session(
        &self,
        user_api_key: &str,
        request: &CreateSessionRequest,
    ) -> Result<SupportSession, ProviderError> {
        let base = self.support_base()?.to_string();
        let key = user_api_key.to_string();

        let resp = self
            .session_http
            .send(|c| {
                c.post(format!("{base}/customer/sessions"))
                    .header("Authorization", &key)
                    .json(request)
            })
            .await?;

        Self::parse(resp).await
    }

    pub async fn list_sessions(
        &self,
        user_api_key: &str,
    ) -> Result<Vec<SupportSessionInfo>, ProviderError> {
        let base = self.support_base()?.to_string();
        let key = user_api_key.to_string();

        let resp = self
            .session_http
            .send(|c| {
                c.get(format!("{base}/customer/sessions"))
                    .header("Authorization", &key)
            })
            .await?;

        Self::parse(resp).await
    }

    pub async fn delete_support_session(
        &self,
        user_api_key: &str,
        session_id: &str,
    ) -> Result<(), ProviderError> {
        let base = self.support_base()?.to_string();
        let key = user_api_key.to_string();

        self.session_http
            .send(|c| {
                c.delete(format!("{base}/customer/sessions/{session_id}"))
                    .header("Authorization", &key)
            })
            .await?;
        Ok(())
    }

    pub async fn session_settings(
        &self,
        user_api_key: &str,
        session_id: &str,
    ) -> Result<serde_json::Value, ProviderError> {
        let base = self.support_base()?.to_string();
        let key = user_api_key.to_string();

        let resp = self
            .session_http
            .send(|c| {
                c.get(format!("{base}/customer/sessions/{session_id}/settings"))
                    .header("Authorization", &key)
            })
            .await?;

        Self::parse(resp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StaticTokenResolver;
    use govconnect_core::config::AppConfig;
    use std::sync::Arc;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn support_client(support_url: &str) -> ProviderClient {
        let cfg: AppConfig = serde_json::from_value(serde_json::json!({
            "database_url": "postgres://localhost/test",
            "rabbitmq_url": "amqp://localhost",
            "internal_api_key": "k",
            "wa_support_url": support_url,
            "wa_support_internal_api_key": "dashboard:admin-key",
        }))
        .unwrap();
        ProviderClient::new(&cfg, Arc::new(StaticTokenResolver("tok".into())))
    }

    #[tokio::test]
    async fn provision_sends_stripped_admin_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/admin/users"))
            .and(header("Authorization", "admin-key"))
            .and(body_partial_json(serde_json::json!({ "Name": "V1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "Id": "u-1", "ApiKey": "customer-key" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let user = support_client(&server.uri()).provision_user("V1").await.unwrap();
        assert_eq!(user.id, "u-1");
        assert_eq!(user.api_key.as_deref(), Some("customer-key"));
    }

    #[tokio::test]
    async fn existing_user_omits_api_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/admin/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "Id": "u-1" }
            })))
            .mount(&server)
            .await;

        let user = support_client(&server.uri()).provision_user("V1").await.unwrap();
        assert!(user.api_key.is_none());
    }

    #[tokio::test]
    async fn create_session_uses_customer_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/customer/sessions"))
            .and(header("Authorization", "customer-key"))
            .and(body_partial_json(serde_json::json!({
                "auto_read_enabled": true,
                "typing_enabled": true,
                "events": "All",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "Id": "s-1", "Token": "sess-token" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let request = CreateSessionRequest::new("desa-a", "https://channel.example/webhook");
        let session = support_client(&server.uri())
            .create_session("customer-key", &request)
            .await
            .unwrap();
        assert_eq!(session.token, "sess-token");
    }
}
