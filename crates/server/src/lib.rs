//! Thin HTTP façade over the gateway components: webhook ingress, the
//! internal service-to-service API, and health. All business decisions live
//! in the components; handlers translate shapes and status codes.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, patch, post, put};
use axum::{Json, Router};
use govconnect_bus::BusClient;
use govconnect_core::config::AppConfig;
use govconnect_ingest::Ingest;
use govconnect_livechat::LiveChat;
use govconnect_provider::{ProviderClient, ProviderError, ProviderErrorKind};
use govconnect_session::SessionManager;
use govconnect_store::Store;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

mod internal;
mod webhook;

/// Upload cap for `/internal/media/upload`.
const MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Store,
    pub provider: Arc<ProviderClient>,
    pub sessions: Arc<SessionManager>,
    pub ingest: Arc<Ingest>,
    pub livechat: Arc<LiveChat>,
    pub bus: Arc<BusClient>,
    /// Peer IPs allowed on the webhook ingress; empty = unrestricted.
    pub webhook_allowlist: Arc<Vec<String>>,
}

/// Error envelope for the internal API: `{ "error": "...", "kind": "..." }`
/// with the status derived from the underlying failure.
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "VALIDATION_ERROR",
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: "NOT_FOUND",
            message: message.into(),
        }
    }

    fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            kind: "AUTH_ERROR",
            message: "invalid internal api key".to_string(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(provider_err) = err.downcast_ref::<ProviderError>() {
            let (status, kind) = match provider_err.kind {
                ProviderErrorKind::AuthError => (StatusCode::UNAUTHORIZED, "AUTH_ERROR"),
                ProviderErrorKind::ValidationError => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR")
                }
                ProviderErrorKind::ConfigError => {
                    (StatusCode::BAD_REQUEST, "TENANT_NOT_CONFIGURED")
                }
                ProviderErrorKind::Timeout => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT"),
                ProviderErrorKind::NetworkError => (StatusCode::BAD_GATEWAY, "NETWORK_ERROR"),
                ProviderErrorKind::ServerError => (StatusCode::BAD_GATEWAY, "SERVER_ERROR"),
            };
            return Self {
                status,
                kind,
                message: provider_err.to_string(),
            };
        }

        warn!(error = %err, "internal API error");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "INTERNAL",
            message: "internal error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message, "kind": self.kind }));
        (self.status, body).into_response()
    }
}

/// Every `/internal` handler goes through this first.
pub(crate) fn check_internal_key(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let provided = headers
        .get("x-internal-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if provided == state.config.internal_api_key {
        Ok(())
    } else {
        warn!("rejected internal API call with bad key");
        Err(ApiError::unauthorized())
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    bus_connected: bool,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        bus_connected: state.bus.is_connected().await,
    })
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // Webhook ingress (provider-facing, no auth)
        .route("/webhook", post(webhook::receive))
        .route("/webhook/whatsapp", post(webhook::receive))
        .route("/webhook/whatsapp", get(webhook::verify))
        // Messages
        .route("/internal/messages", get(internal::list_messages))
        .route("/internal/messages", post(internal::store_message))
        .route("/internal/messages/read", post(internal::mark_read_upstream))
        .route("/internal/send", post(internal::send_text))
        .route("/internal/typing", post(internal::typing))
        // Session lifecycle
        .route("/internal/whatsapp/status", get(internal::wa_status))
        .route("/internal/whatsapp/connect", post(internal::wa_connect))
        .route("/internal/whatsapp/disconnect", post(internal::wa_disconnect))
        .route("/internal/whatsapp/logout", post(internal::wa_logout))
        .route("/internal/whatsapp/qr", get(internal::wa_qr))
        .route("/internal/whatsapp/pairphone", post(internal::wa_pair_phone))
        .route("/internal/whatsapp/settings", get(internal::wa_settings))
        .route("/internal/whatsapp/session", post(internal::wa_create_session))
        .route("/internal/whatsapp/session", delete(internal::wa_delete_session))
        .route(
            "/internal/whatsapp/check-duplicate",
            get(internal::wa_check_duplicate),
        )
        .route(
            "/internal/whatsapp/force-disconnect",
            post(internal::wa_force_disconnect),
        )
        // Takeover
        .route("/internal/takeover/:channel_identifier", post(internal::takeover_start))
        .route(
            "/internal/takeover/:channel_identifier",
            delete(internal::takeover_end),
        )
        .route("/internal/takeover/:channel_identifier", get(internal::takeover_get))
        // Conversations
        .route("/internal/conversations", get(internal::conversations_list))
        .route(
            "/internal/conversations/user-profile",
            patch(internal::conversation_profile),
        )
        .route(
            "/internal/conversations/:channel_identifier",
            get(internal::conversation_detail),
        )
        .route(
            "/internal/conversations/:channel_identifier",
            delete(internal::conversation_delete),
        )
        .route(
            "/internal/conversations/:channel_identifier/send",
            post(internal::conversation_send),
        )
        .route(
            "/internal/conversations/:channel_identifier/read",
            post(internal::conversation_read),
        )
        .route(
            "/internal/conversations/:channel_identifier/retry",
            post(internal::conversation_retry),
        )
        // Channel accounts
        .route("/internal/channel-accounts", get(internal::accounts_list))
        .route(
            "/internal/channel-accounts/:village_id",
            get(internal::account_get),
        )
        .route(
            "/internal/channel-accounts/:village_id",
            put(internal::account_put),
        )
        // Media upload
        .route("/internal/media/upload", post(internal::media_upload))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

/// Bind and serve until the shutdown future resolves; in-flight handlers
/// drain before return.
pub async fn serve(
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let app = build_router(state);

    info!("channel gateway listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}
