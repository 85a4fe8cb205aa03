use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use govconnect_ingest::webhook::unwrap_form_body;
use govconnect_ingest::IngestOutcome;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::AppState;

/// Form transport: the whole JSON body arrives as one string field.
#[derive(Deserialize)]
struct WebhookForm {
    #[serde(rename = "jsonData")]
    json_data: String,
}

fn allowlisted(state: &AppState, peer: &SocketAddr) -> bool {
    if state.webhook_allowlist.is_empty() {
        return true;
    }
    let ip = peer.ip().to_string();
    state.webhook_allowlist.iter().any(|allowed| allowed == &ip)
}

/// `POST /webhook` and `POST /webhook/whatsapp`.
///
/// The response is 2xx for everything the body parser can make sense of —
/// filtered, duplicate and spam-rejected messages included — because the
/// provider retries non-2xx responses and retry amplification is worse than
/// a dropped diagnostic.
pub(crate) async fn receive(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, StatusCode> {
    if !allowlisted(&state, &peer) {
        warn!(peer = %peer, "webhook from non-allowlisted origin");
        return Err(StatusCode::FORBIDDEN);
    }

    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let payload: Value = if content_type.starts_with("application/x-www-form-urlencoded") {
        let form: WebhookForm =
            serde_urlencoded::from_bytes(&body).map_err(|_| StatusCode::BAD_REQUEST)?;
        unwrap_form_body(&form.json_data).map_err(|_| StatusCode::BAD_REQUEST)?
    } else {
        serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?
    };

    // Transient downstream failures are swallowed on purpose; the webhook
    // answering 5xx would only trigger upstream retry storms.
    match state.ingest.process_webhook(payload).await {
        Ok(IngestOutcome::Accepted {
            message_id,
            forwarded,
        }) => Ok(Json(json!({
            "status": "accepted",
            "message_id": message_id,
            "forwarded": forwarded,
        }))),
        Ok(IngestOutcome::SpamRejected) => Ok(Json(json!({ "status": "ignored", "reason": "spam" }))),
        Ok(IngestOutcome::Ignored(reason)) => {
            debug!(reason, "webhook acknowledged without processing");
            Ok(Json(json!({ "status": "ignored", "reason": reason })))
        }
        Err(e) => {
            warn!(error = %e, "webhook processing failed, acknowledged anyway");
            Ok(Json(json!({ "status": "error_acknowledged" })))
        }
    }
}

#[derive(Deserialize)]
pub(crate) struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

/// `GET /webhook/whatsapp` — classic subscription challenge. Without a
/// configured verify token the challenge is echoed as-is.
pub(crate) async fn verify(
    State(state): State<AppState>,
    Query(query): Query<VerifyQuery>,
) -> Result<String, StatusCode> {
    let Some(expected) = state.config.wa_webhook_verify_token.as_deref() else {
        return Ok(query.challenge.unwrap_or_default());
    };

    if query.mode.as_deref() != Some("subscribe") {
        return Err(StatusCode::BAD_REQUEST);
    }
    if query.verify_token.as_deref() != Some(expected) {
        warn!("webhook verify with invalid token");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(query.challenge.unwrap_or_default())
}
