//! Internal service-to-service API behind `X-Internal-API-Key`. Errors from
//! the components propagate verbatim with a safe message; provider error
//! kinds map onto HTTP statuses in [`crate::ApiError`].

use axum::extract::{Multipart, Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use chrono::Utc;
use govconnect_core::types::{
    Channel, ChannelAccount, ConversationKey, Direction, MessageSource, NewMessage,
};
use govconnect_store::ConversationFilter;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::{check_internal_key, ApiError, AppState, MAX_UPLOAD_BYTES};

fn parse_channel(raw: Option<&str>) -> Result<Channel, ApiError> {
    match raw {
        None => Ok(Channel::Whatsapp),
        Some(raw) => Channel::parse(raw)
            .ok_or_else(|| ApiError::bad_request(format!("unknown channel {raw:?}"))),
    }
}

// ── Messages ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct ListMessagesQuery {
    village_id: String,
    channel_identifier: Option<String>,
    wa_user_id: Option<String>,
    channel: Option<String>,
    limit: Option<i64>,
}

pub(crate) async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListMessagesQuery>,
) -> Result<Json<Value>, ApiError> {
    check_internal_key(&state, &headers)?;

    let identifier = query
        .channel_identifier
        .or(query.wa_user_id)
        .ok_or_else(|| ApiError::bad_request("channel_identifier or wa_user_id is required"))?;
    let key = ConversationKey::new(
        &query.village_id,
        parse_channel(query.channel.as_deref())?,
        &identifier,
    );

    let messages = state
        .store
        .recent_messages(&key, query.limit.unwrap_or(50).clamp(1, 200))
        .await?;
    Ok(Json(json!({ "messages": messages })))
}

#[derive(Deserialize)]
pub(crate) struct StoreMessageRequest {
    village_id: String,
    wa_user_id: Option<String>,
    channel: Option<String>,
    channel_identifier: Option<String>,
    message_id: Option<String>,
    message_text: String,
    direction: String,
    source: Option<String>,
}

/// Used by the AI orchestrator to record its own messages (and by webchat
/// for inbound ones); duplicates are a quiet no-op.
pub(crate) async fn store_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<StoreMessageRequest>,
) -> Result<Json<Value>, ApiError> {
    check_internal_key(&state, &headers)?;

    let direction = Direction::parse(&req.direction)
        .ok_or_else(|| ApiError::bad_request("direction must be IN or OUT"))?;
    let identifier = req
        .channel_identifier
        .clone()
        .or_else(|| req.wa_user_id.clone())
        .ok_or_else(|| ApiError::bad_request("channel_identifier or wa_user_id is required"))?;
    let channel = parse_channel(req.channel.as_deref())?;
    let source = match req.source.as_deref() {
        Some(raw) => MessageSource::parse(raw)
            .ok_or_else(|| ApiError::bad_request(format!("unknown source {raw:?}")))?,
        None => MessageSource::Ai,
    };

    let message = NewMessage {
        village_id: req.village_id.clone(),
        wa_user_id: req.wa_user_id,
        channel,
        channel_identifier: identifier.clone(),
        message_id: req
            .message_id
            .unwrap_or_else(|| format!("internal-{}", Uuid::new_v4())),
        message_text: req.message_text,
        direction,
        source,
        timestamp: Utc::now(),
    };

    let outcome = state.store.insert_message(&message).await?;
    let key = message.conversation_key();
    state
        .store
        .apply_message_to_conversation(
            &key,
            message.wa_user_id.as_deref(),
            &message.message_text,
            message.timestamp,
            direction,
        )
        .await?;

    Ok(Json(json!({
        "message_id": message.message_id,
        "outcome": format!("{outcome:?}"),
    })))
}

#[derive(Deserialize)]
pub(crate) struct SendRequest {
    village_id: Option<String>,
    wa_user_id: String,
    message: String,
}

pub(crate) async fn send_text(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SendRequest>,
) -> Result<Json<Value>, ApiError> {
    check_internal_key(&state, &headers)?;

    let village_id = req
        .village_id
        .or_else(|| state.config.default_village_id.clone())
        .ok_or_else(|| ApiError::bad_request("village_id is required"))?;
    let key = ConversationKey::new(&village_id, Channel::Whatsapp, &req.wa_user_id);

    let stored = state
        .livechat
        .send_to_user(&key, &req.message, MessageSource::Ai, None)
        .await?;
    Ok(Json(json!({ "message_id": stored.message_id })))
}

#[derive(Deserialize)]
pub(crate) struct TypingRequest {
    village_id: String,
    wa_user_id: String,
    #[serde(default = "default_composing")]
    composing: bool,
}

fn default_composing() -> bool {
    true
}

pub(crate) async fn typing(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TypingRequest>,
) -> Result<Json<Value>, ApiError> {
    check_internal_key(&state, &headers)?;

    // Cached read is fine here; only mark-as-read demands a fresh row.
    if !state.store.settings_cache().cached().await.typing_indicator {
        return Ok(Json(json!({ "status": "skipped", "reason": "typing indicator disabled" })));
    }

    state
        .provider
        .set_presence(&req.village_id, &req.wa_user_id, req.composing)
        .await
        .map_err(anyhow::Error::from)?;
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Deserialize)]
pub(crate) struct MarkReadRequest {
    village_id: String,
    wa_user_id: String,
    #[serde(default)]
    message_ids: Vec<String>,
}

pub(crate) async fn mark_read_upstream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<MarkReadRequest>,
) -> Result<Json<Value>, ApiError> {
    check_internal_key(&state, &headers)?;

    state
        .provider
        .mark_read(&req.village_id, &req.wa_user_id, &req.message_ids)
        .await
        .map_err(anyhow::Error::from)?;
    Ok(Json(json!({ "status": "ok" })))
}

// ── Session lifecycle ───────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct VillageQuery {
    village_id: String,
}

pub(crate) async fn wa_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<VillageQuery>,
) -> Result<Json<Value>, ApiError> {
    check_internal_key(&state, &headers)?;
    let report = state.sessions.status(&query.village_id).await?;
    Ok(Json(json!(report)))
}

#[derive(Deserialize)]
pub(crate) struct VillageBody {
    village_id: String,
}

pub(crate) async fn wa_connect(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<VillageBody>,
) -> Result<Json<Value>, ApiError> {
    check_internal_key(&state, &headers)?;
    let report = state.sessions.connect(&req.village_id).await?;
    Ok(Json(json!(report)))
}

pub(crate) async fn wa_disconnect(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<VillageBody>,
) -> Result<Json<Value>, ApiError> {
    check_internal_key(&state, &headers)?;
    let report = state.sessions.disconnect(&req.village_id).await?;
    Ok(Json(json!(report)))
}

pub(crate) async fn wa_logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<VillageBody>,
) -> Result<Json<Value>, ApiError> {
    check_internal_key(&state, &headers)?;
    let report = state.sessions.logout(&req.village_id).await?;
    Ok(Json(json!(report)))
}

pub(crate) async fn wa_qr(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<VillageQuery>,
) -> Result<Json<Value>, ApiError> {
    check_internal_key(&state, &headers)?;
    let qr = state
        .provider
        .qr(&query.village_id)
        .await
        .map_err(anyhow::Error::from)?;
    Ok(Json(json!({ "qr": qr })))
}

#[derive(Deserialize)]
pub(crate) struct PairPhoneRequest {
    village_id: String,
    phone: String,
}

pub(crate) async fn wa_pair_phone(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PairPhoneRequest>,
) -> Result<Json<Value>, ApiError> {
    check_internal_key(&state, &headers)?;
    let code = state
        .provider
        .pair_phone(&req.village_id, &req.phone)
        .await
        .map_err(anyhow::Error::from)?;
    Ok(Json(json!({ "linking_code": code })))
}

pub(crate) async fn wa_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<VillageQuery>,
) -> Result<Json<Value>, ApiError> {
    check_internal_key(&state, &headers)?;

    let session = state
        .store
        .get_session(&query.village_id)
        .await?
        .ok_or_else(|| ApiError::not_found("no session for village"))?;
    let (api_key, session_id) = session
        .support_api_key
        .as_deref()
        .zip(session.support_session_id.as_deref())
        .ok_or_else(|| ApiError::bad_request("session has no support-plane identifiers"))?;

    let settings = state
        .provider
        .session_settings(api_key, session_id)
        .await
        .map_err(anyhow::Error::from)?;
    Ok(Json(settings))
}

#[derive(Deserialize)]
pub(crate) struct CreateSessionBody {
    village_id: String,
    admin_id: Option<String>,
    slug: Option<String>,
}

pub(crate) async fn wa_create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateSessionBody>,
) -> Result<Json<Value>, ApiError> {
    check_internal_key(&state, &headers)?;
    let session = state
        .sessions
        .create(&req.village_id, req.admin_id.as_deref(), req.slug.as_deref())
        .await?;
    // The provider token is write-only from the API's point of view.
    Ok(Json(json!({
        "village_id": session.village_id,
        "instance_name": session.instance_name,
        "support_user_id": session.support_user_id,
        "support_session_id": session.support_session_id,
    })))
}

pub(crate) async fn wa_delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<VillageQuery>,
) -> Result<Json<Value>, ApiError> {
    check_internal_key(&state, &headers)?;
    state.sessions.delete(&query.village_id).await?;
    Ok(Json(json!({ "status": "deleted" })))
}

#[derive(Deserialize)]
pub(crate) struct DuplicateQuery {
    village_id: String,
    wa_number: String,
}

pub(crate) async fn wa_check_duplicate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DuplicateQuery>,
) -> Result<Json<Value>, ApiError> {
    check_internal_key(&state, &headers)?;
    let check = state
        .sessions
        .check_duplicate(&query.village_id, &query.wa_number)
        .await?;
    Ok(Json(json!(check)))
}

#[derive(Deserialize)]
pub(crate) struct ForceDisconnectRequest {
    village_id: String,
    target_village_id: String,
}

pub(crate) async fn wa_force_disconnect(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ForceDisconnectRequest>,
) -> Result<Json<Value>, ApiError> {
    check_internal_key(&state, &headers)?;
    state
        .sessions
        .force_disconnect_other(&req.village_id, &req.target_village_id)
        .await?;
    Ok(Json(json!({ "status": "disconnected" })))
}

// ── Takeover ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct TakeoverStartRequest {
    village_id: String,
    channel: Option<String>,
    admin_id: String,
    admin_name: Option<String>,
    reason: Option<String>,
}

pub(crate) async fn takeover_start(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(channel_identifier): Path<String>,
    Json(req): Json<TakeoverStartRequest>,
) -> Result<Json<Value>, ApiError> {
    check_internal_key(&state, &headers)?;

    let key = ConversationKey::new(
        &req.village_id,
        parse_channel(req.channel.as_deref())?,
        &channel_identifier,
    );
    let takeover = state
        .livechat
        .start_takeover(&key, &req.admin_id, req.admin_name.as_deref(), req.reason.as_deref())
        .await?;
    Ok(Json(json!(takeover)))
}

#[derive(Deserialize)]
pub(crate) struct ConversationQuery {
    village_id: String,
    channel: Option<String>,
}

pub(crate) async fn takeover_end(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(channel_identifier): Path<String>,
    Query(query): Query<ConversationQuery>,
) -> Result<Json<Value>, ApiError> {
    check_internal_key(&state, &headers)?;

    let key = ConversationKey::new(
        &query.village_id,
        parse_channel(query.channel.as_deref())?,
        &channel_identifier,
    );
    let ended = state.livechat.end_takeover(&key).await?;
    Ok(Json(json!({ "ended": ended })))
}

pub(crate) async fn takeover_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(channel_identifier): Path<String>,
    Query(query): Query<ConversationQuery>,
) -> Result<Json<Value>, ApiError> {
    check_internal_key(&state, &headers)?;

    let key = ConversationKey::new(
        &query.village_id,
        parse_channel(query.channel.as_deref())?,
        &channel_identifier,
    );
    let takeover = state.store.active_takeover(&key).await?;
    Ok(Json(json!({ "takeover": takeover })))
}

// ── Conversations ───────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct ConversationsQuery {
    village_id: String,
    #[serde(default)]
    filter: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

pub(crate) async fn conversations_list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ConversationsQuery>,
) -> Result<Json<Value>, ApiError> {
    check_internal_key(&state, &headers)?;

    let filter = ConversationFilter::parse(query.filter.as_deref().unwrap_or("all"));
    let conversations = state
        .livechat
        .conversations(
            &query.village_id,
            filter,
            query.limit.unwrap_or(20),
            query.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(json!({ "conversations": conversations })))
}

#[derive(Deserialize)]
pub(crate) struct ProfileRequest {
    village_id: String,
    channel: Option<String>,
    channel_identifier: String,
    user_name: Option<String>,
    user_phone: Option<String>,
}

pub(crate) async fn conversation_profile(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ProfileRequest>,
) -> Result<Json<Value>, ApiError> {
    check_internal_key(&state, &headers)?;

    let key = ConversationKey::new(
        &req.village_id,
        parse_channel(req.channel.as_deref())?,
        &req.channel_identifier,
    );
    state
        .store
        .update_conversation_profile(&key, req.user_name.as_deref(), req.user_phone.as_deref())
        .await?;
    Ok(Json(json!({ "status": "ok" })))
}

pub(crate) async fn conversation_detail(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(channel_identifier): Path<String>,
    Query(query): Query<ConversationQuery>,
) -> Result<Json<Value>, ApiError> {
    check_internal_key(&state, &headers)?;

    let key = ConversationKey::new(
        &query.village_id,
        parse_channel(query.channel.as_deref())?,
        &channel_identifier,
    );
    let detail = state
        .livechat
        .conversation(&key)
        .await?
        .ok_or_else(|| ApiError::not_found("conversation not found"))?;
    Ok(Json(json!(detail)))
}

pub(crate) async fn conversation_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(channel_identifier): Path<String>,
    Query(query): Query<ConversationQuery>,
) -> Result<Json<Value>, ApiError> {
    check_internal_key(&state, &headers)?;

    let key = ConversationKey::new(
        &query.village_id,
        parse_channel(query.channel.as_deref())?,
        &channel_identifier,
    );
    state.livechat.delete_conversation(&key).await?;
    Ok(Json(json!({ "status": "deleted" })))
}

#[derive(Deserialize)]
pub(crate) struct AdminSendRequest {
    village_id: String,
    channel: Option<String>,
    message: String,
    admin_id: String,
}

pub(crate) async fn conversation_send(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(channel_identifier): Path<String>,
    Json(req): Json<AdminSendRequest>,
) -> Result<Json<Value>, ApiError> {
    check_internal_key(&state, &headers)?;

    let key = ConversationKey::new(
        &req.village_id,
        parse_channel(req.channel.as_deref())?,
        &channel_identifier,
    );
    let stored = state
        .livechat
        .admin_send(&key, &req.message, &req.admin_id)
        .await?;
    Ok(Json(json!({ "message_id": stored.message_id })))
}

pub(crate) async fn conversation_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(channel_identifier): Path<String>,
    Query(query): Query<ConversationQuery>,
) -> Result<Json<Value>, ApiError> {
    check_internal_key(&state, &headers)?;

    let key = ConversationKey::new(
        &query.village_id,
        parse_channel(query.channel.as_deref())?,
        &channel_identifier,
    );
    state.livechat.mark_as_read(&key).await?;
    Ok(Json(json!({ "status": "ok" })))
}

pub(crate) async fn conversation_retry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(channel_identifier): Path<String>,
    Query(query): Query<ConversationQuery>,
) -> Result<Json<Value>, ApiError> {
    check_internal_key(&state, &headers)?;

    let key = ConversationKey::new(
        &query.village_id,
        parse_channel(query.channel.as_deref())?,
        &channel_identifier,
    );
    let message_id = state
        .livechat
        .retry_ai(&key)
        .await?
        .ok_or_else(|| ApiError::not_found("no pending message to retry"))?;
    Ok(Json(json!({ "status": "republished", "message_id": message_id })))
}

// ── Channel accounts ────────────────────────────────────────────────────

pub(crate) async fn accounts_list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    check_internal_key(&state, &headers)?;
    let accounts = state.store.list_channel_accounts().await?;
    Ok(Json(json!({ "accounts": accounts })))
}

pub(crate) async fn account_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(village_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    check_internal_key(&state, &headers)?;
    let account = state
        .store
        .get_channel_account(&village_id)
        .await?
        .ok_or_else(|| ApiError::not_found("channel account not found"))?;
    Ok(Json(json!(account)))
}

#[derive(Deserialize)]
pub(crate) struct AccountPutRequest {
    wa_number: Option<String>,
    wa_token: Option<String>,
    webhook_url: Option<String>,
    #[serde(default = "default_enabled")]
    enabled_wa: bool,
    #[serde(default = "default_enabled")]
    enabled_webchat: bool,
}

fn default_enabled() -> bool {
    true
}

pub(crate) async fn account_put(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(village_id): Path<String>,
    Json(req): Json<AccountPutRequest>,
) -> Result<Json<Value>, ApiError> {
    check_internal_key(&state, &headers)?;

    let account = ChannelAccount {
        village_id: village_id.clone(),
        wa_number: req.wa_number,
        wa_token: req.wa_token,
        webhook_url: req.webhook_url,
        enabled_wa: req.enabled_wa,
        enabled_webchat: req.enabled_webchat,
    };
    state.store.upsert_channel_account(&account).await?;
    Ok(Json(json!(account)))
}

// ── Media upload ────────────────────────────────────────────────────────

const ALLOWED_UPLOAD_EXTENSIONS: [&str; 5] = ["pdf", "jpg", "png", "doc", "docx"];

fn upload_extension(filename: &str, bytes: &[u8]) -> Option<&'static str> {
    let by_name = filename
        .rsplit('.')
        .next()
        .map(str::to_lowercase)
        .and_then(|ext| {
            ALLOWED_UPLOAD_EXTENSIONS
                .iter()
                .find(|allowed| **allowed == ext || (ext == "jpeg" && **allowed == "jpg"))
                .copied()
        });
    if by_name.is_some() {
        return by_name;
    }
    // Fall back to sniffing when the name is unhelpful.
    infer::get(bytes).and_then(|kind| match kind.extension() {
        "pdf" => Some("pdf"),
        "jpg" => Some("jpg"),
        "png" => Some("png"),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::upload_extension;

    #[test]
    fn upload_extension_accepts_documented_types() {
        assert_eq!(upload_extension("laporan.pdf", b""), Some("pdf"));
        assert_eq!(upload_extension("FOTO.JPG", b""), Some("jpg"));
        assert_eq!(upload_extension("scan.jpeg", b""), Some("jpg"));
        assert_eq!(upload_extension("surat.docx", b""), Some("docx"));
        assert_eq!(upload_extension("virus.exe", b""), None);
    }

    #[test]
    fn upload_extension_sniffs_when_name_is_useless() {
        assert_eq!(upload_extension("blob", b"%PDF-1.4 content"), Some("pdf"));
        assert_eq!(
            upload_extension("blob", &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]),
            Some("png")
        );
        assert_eq!(upload_extension("blob", b"plain text"), None);
    }
}

pub(crate) async fn media_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    check_internal_key(&state, &headers)?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("invalid multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field.file_name().unwrap_or("upload").to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("upload read failed: {e}")))?;

        if bytes.len() > MAX_UPLOAD_BYTES {
            return Err(ApiError::bad_request("file exceeds the 5MB limit"));
        }
        let ext = upload_extension(&filename, &bytes).ok_or_else(|| {
            ApiError::bad_request("only PDF, JPG, PNG, DOC and DOCX uploads are accepted")
        })?;

        let dir = state.config.media_storage_path.join("uploads");
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(anyhow::Error::from)?;
        let stored_name = format!("{}_{}.{}", Utc::now().timestamp_millis(), Uuid::new_v4(), ext);
        tokio::fs::write(dir.join(&stored_name), &bytes)
            .await
            .map_err(anyhow::Error::from)?;

        info!(file = %stored_name, size = bytes.len(), "media uploaded");

        let rel = format!("uploads/{stored_name}");
        return Ok(Json(json!({
            "filename": stored_name,
            "size_bytes": bytes.len(),
            "internal_url": state
                .config
                .media_internal_url
                .as_deref()
                .map(|b| format!("{}/{}", b.trim_end_matches('/'), rel)),
            "public_url": state
                .config
                .media_public_url
                .as_deref()
                .map(|b| format!("{}/{}", b.trim_end_matches('/'), rel)),
        })));
    }

    Err(ApiError::bad_request("multipart field 'file' is required"))
}
