use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ProviderError, ProviderErrorKind};
use crate::phone::{build_vcard, normalize_phone, strip_jid};
use crate::ProviderClient;

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub message_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayStatus {
    #[serde(rename = "Connected", default)]
    pub connected: bool,
    #[serde(rename = "LoggedIn", default)]
    pub logged_in: bool,
    #[serde(rename = "Jid", default)]
    pub jid: Option<String>,
}

impl GatewayStatus {
    /// Provider JIDs carry the `@s.whatsapp.net` domain; the bare number is
    /// what gets reconciled into session and account rows.
    pub fn wa_number(&self) -> Option<String> {
        self.jid.as_deref().map(|jid| strip_jid(jid).to_string())
    }
}

#[derive(Deserialize)]
struct SendData {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Deserialize)]
struct QrData {
    #[serde(rename = "QRCode")]
    qr_code: String,
}

#[derive(Deserialize)]
struct PairData {
    #[serde(rename = "LinkingCode")]
    linking_code: String,
}

impl ProviderClient {
    /// Send a plain text message. The session token is resolved per call;
    /// dry-run mode answers with a synthetic id without touching the wire.
    pub async fn send_text(
        &self,
        village_id: &str,
        to: &str,
        body: &str,
    ) -> Result<SentMessage, ProviderError> {
        if self.dry_run {
            info!(village_id, to, "dry-run: skipping provider send");
            return Ok(SentMessage {
                message_id: format!("dryrun-{}", Uuid::new_v4()),
            });
        }

        let phone = normalize_phone(to);
        if phone.is_empty() {
            return Err(ProviderError::validation(format!(
                "destination {to:?} has no digits"
            )));
        }

        let base = self.gateway_base()?.to_string();
        let token = self.resolve_token(village_id).await?;
        let payload = json!({ "Phone": phone, "Body": body });

        let resp = self
            .chat_http
            .send(|c| {
                c.post(format!("{base}/chat/send/text"))
                    .header("token", &token)
                    .json(&payload)
            })
            .await?;

        let data: SendData = Self::parse(resp).await?;
        debug!(village_id, message_id = %data.id, "text sent");
        Ok(SentMessage { message_id: data.id })
    }

    /// Share a contact as a vCard bubble.
    pub async fn send_contact(
        &self,
        village_id: &str,
        to: &str,
        contact_name: &str,
        contact_phone: &str,
    ) -> Result<SentMessage, ProviderError> {
        if self.dry_run {
            return Ok(SentMessage {
                message_id: format!("dryrun-{}", Uuid::new_v4()),
            });
        }

        let base = self.gateway_base()?.to_string();
        let token = self.resolve_token(village_id).await?;
        let payload = json!({
            "Phone": normalize_phone(to),
            "Name": contact_name,
            "Vcard": build_vcard(contact_name, contact_phone),
        });

        let resp = self
            .chat_http
            .send(|c| {
                c.post(format!("{base}/chat/send/contact"))
                    .header("token", &token)
                    .json(&payload)
            })
            .await?;

        let data: SendData = Self::parse(resp).await?;
        Ok(SentMessage { message_id: data.id })
    }

    pub async fn mark_read(
        &self,
        village_id: &str,
        chat: &str,
        message_ids: &[String],
    ) -> Result<(), ProviderError> {
        if self.dry_run || message_ids.is_empty() {
            return Ok(());
        }

        let base = self.gateway_base()?.to_string();
        let token = self.resolve_token(village_id).await?;
        let payload = json!({ "Chat": normalize_phone(chat), "Ids": message_ids });

        self.chat_http
            .send(|c| {
                c.post(format!("{base}/chat/markread"))
                    .header("token", &token)
                    .json(&payload)
            })
            .await?;
        Ok(())
    }

    /// Composing/paused presence for the typing indicator.
    pub async fn set_presence(
        &self,
        village_id: &str,
        chat: &str,
        composing: bool,
    ) -> Result<(), ProviderError> {
        if self.dry_run {
            return Ok(());
        }

        let base = self.gateway_base()?.to_string();
        let token = self.resolve_token(village_id).await?;
        let state = if composing { "composing" } else { "paused" };
        let payload = json!({ "Chat": normalize_phone(chat), "State": state });

        self.chat_http
            .send(|c| {
                c.post(format!("{base}/chat/presence"))
                    .header("token", &token)
                    .json(&payload)
            })
            .await?;
        Ok(())
    }

    pub async fn qr(&self, village_id: &str) -> Result<String, ProviderError> {
        let base = self.gateway_base()?.to_string();
        let token = self.resolve_token(village_id).await?;

        let resp = self
            .session_http
            .send(|c| c.get(format!("{base}/session/qr")).header("token", &token))
            .await?;

        let data: QrData = Self::parse(resp).await?;
        Ok(data.qr_code)
    }

    pub async fn pair_phone(
        &self,
        village_id: &str,
        phone: &str,
    ) -> Result<String, ProviderError> {
        let base = self.gateway_base()?.to_string();
        let token = self.resolve_token(village_id).await?;
        let payload = json!({ "Phone": normalize_phone(phone) });

        let resp = self
            .session_http
            .send(|c| {
                c.post(format!("{base}/session/pairphone"))
                    .header("token", &token)
                    .json(&payload)
            })
            .await?;

        let data: PairData = Self::parse(resp).await?;
        Ok(data.linking_code)
    }

    pub async fn connect(&self, village_id: &str) -> Result<(), ProviderError> {
        let base = self.gateway_base()?.to_string();
        let token = self.resolve_token(village_id).await?;
        let payload = json!({ "Subscribe": ["All"], "Immediate": true });

        self.session_http
            .send(|c| {
                c.post(format!("{base}/session/connect"))
                    .header("token", &token)
                    .json(&payload)
            })
            .await?;
        Ok(())
    }

    pub async fn disconnect(&self, village_id: &str) -> Result<(), ProviderError> {
        let base = self.gateway_base()?.to_string();
        let token = self.resolve_token(village_id).await?;

        self.session_http
            .send(|c| {
                c.post(format!("{base}/session/disconnect"))
                    .header("token", &token)
            })
            .await?;
        Ok(())
    }

    pub async fn logout(&self, village_id: &str) -> Result<(), ProviderError> {
        let base = self.gateway_base()?.to_string();
        let token = self.resolve_token(village_id).await?;

        self.session_http
            .send(|c| {
                c.post(format!("{base}/session/logout"))
                    .header("token", &token)
            })
            .await?;
        Ok(())
    }

    pub async fn session_status(&self, village_id: &str) -> Result<GatewayStatus, ProviderError> {
        let base = self.gateway_base()?.to_string();
        let token = self.resolve_token(village_id).await?;

        let resp = self
            .session_http
            .send(|c| c.get(format!("{base}/session/status")).header("token", &token))
            .await?;

        Self::parse(resp).await
    }

    /// Logout with a token passed explicitly; used when tearing down a
    /// session whose row is about to be deleted.
    pub async fn logout_with_token(&self, token: &str) -> Result<(), ProviderError> {
        let base = self.gateway_base()?.to_string();
        let token = token.to_string();

        self.session_http
            .send(|c| {
                c.post(format!("{base}/session/logout"))
                    .header("token", &token)
            })
            .await?;
        Ok(())
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

    fn test_config(gateway_url: &str) -> AppConfig {
        let mut cfg = base_config();
        cfg.wa_api_url = Some(gateway_url.to_string());
        cfg
    }

    fn base_config() -> AppConfig {
        serde_json::from_value(serde_json::json!({
            "database_url": "postgres://localhost/test",
            "rabbitmq_url": "amqp://localhost",
            "internal_api_key": "k",
        }))
        .unwrap()
    }

    fn client(cfg: &AppConfig) -> ProviderClient {
        ProviderClient::new(cfg, Arc::new(StaticTokenResolver("tok-1".into())))
    }

    #[tokio::test]
    async fn send_text_normalizes_phone_and_sends_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/send/text"))
            .and(header("token", "tok-1"))
            .and(body_partial_json(serde_json::json!({
                "Phone": "628111222333",
                "Body": "halo",
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "data": { "Id": "wamid.1" } })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let sent = client(&test_config(&server.uri()))
            .send_text("V1", "08111222333@s.whatsapp.net", "halo")
            .await
            .unwrap();
        assert_eq!(sent.message_id, "wamid.1");
    }

    #[tokio::test]
    async fn send_text_without_gateway_url_is_config_error() {
        let err = client(&base_config())
            .send_text("V1", "628111", "halo")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::ConfigError);
    }

    #[tokio::test]
    async fn auth_rejection_maps_to_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/session/status"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = client(&test_config(&server.uri()))
            .session_status("V1")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::AuthError);
        assert_eq!(err.status_code, Some(401));
    }

    #[tokio::test]
    async fn dry_run_short_circuits_sends() {
        let mut cfg = base_config();
        cfg.wa_dry_run = true;
        let sent = client(&cfg).send_text("V1", "628111", "halo").await.unwrap();
        assert!(sent.message_id.starts_with("dryrun-"));
    }

    #[test]
    fn status_derives_bare_number() {
        let status = GatewayStatus {
            connected: true,
            logged_in: true,
            jid: Some("628999@s.whatsapp.net".into()),
        };
        assert_eq!(status.wa_number().as_deref(), Some("628999"));
    }
}
