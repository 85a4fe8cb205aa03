//! Typed client for the upstream WhatsApp provider: the session-token
//! "gateway" plane (sends, presence, session state) and the API-key
//! "support" plane (tenant user + customer session provisioning).

use std::sync::Arc;
use std::time::Duration;

use govconnect_circuit::{ResilientClient, RetryPolicy};
use govconnect_core::config::AppConfig;
use serde::de::DeserializeOwned;

mod error;
pub mod gateway;
pub mod phone;
mod resolver;
pub mod support;

pub use error::{ProviderError, ProviderErrorKind};
pub use gateway::{GatewayStatus, SentMessage};
pub use resolver::{StaticTokenResolver, TokenResolver};
pub use support::{CreateSessionRequest, SupportSession, SupportSessionInfo, SupportUser};

/// Provider calls answer `{ "data": ... }`; everything useful sits inside.
#[derive(serde::Deserialize)]
struct ApiResponse<T> {
    data: T,
}

#[derive(Clone)]
pub struct ProviderClient {
    gateway_url: Option<String>,
    support_url: Option<String>,
    support_key: Option<String>,
    dry_run: bool,
    /// Chat-level calls: short timeout, aggressive retry.
    chat_http: ResilientClient,
    /// Session lifecycle + support plane: slower upstream, longer timeout.
    session_http: ResilientClient,
    tokens: Arc<dyn TokenResolver>,
}

impl ProviderClient {
    pub fn new(config: &AppConfig, tokens: Arc<dyn TokenResolver>) -> Self {
        Self {
            gateway_url: config.wa_api_url.clone(),
            support_url: config.wa_support_url.clone(),
            support_key: config.support_api_key().map(str::to_string),
            dry_run: config.wa_dry_run,
            chat_http: ResilientClient::new(
                "wa-gateway",
                Duration::from_secs(10),
                RetryPolicy::default(),
            ),
            session_http: ResilientClient::new(
                "wa-support",
                Duration::from_secs(30),
                RetryPolicy::default(),
            ),
            tokens,
        }
    }

    /// True when the support control plane is configured; otherwise session
    /// provisioning runs in the degraded direct-gateway mode.
    pub fn has_support_plane(&self) -> bool {
        self.support_url.is_some()
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn gateway_base(&self) -> Result<&str, ProviderError> {
        self.gateway_url
            .as_deref()
            .map(|s| s.trim_end_matches('/'))
            .ok_or_else(|| ProviderError::config("WA_API_URL is not configured"))
    }

    fn support_base(&self) -> Result<&str, ProviderError> {
        self.support_url
            .as_deref()
            .map(|s| s.trim_end_matches('/'))
            .ok_or_else(|| ProviderError::config("WA_SUPPORT_URL is not configured"))
    }

    fn support_key(&self) -> Result<&str, ProviderError> {
        self.support_key
            .as_deref()
            .ok_or_else(|| ProviderError::config("WA_SUPPORT_INTERNAL_API_KEY is not configured"))
    }

    async fn resolve_token(&self, village_id: &str) -> Result<String, ProviderError> {
        self.tokens.resolve_token(village_id).await
    }

    async fn parse<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ProviderError> {
        let body: ApiResponse<T> = resp.json().await.map_err(|e| {
            ProviderError::new(
                ProviderErrorKind::ServerError,
                format!("unexpected provider response: {e}"),
            )
        })?;
        Ok(body.data)
    }
}
