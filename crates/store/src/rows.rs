use chrono::{DateTime, Utc};
use govconnect_core::types::{
    AiStatus, Channel, ChannelAccount, Conversation, Direction, MessageSource, PendingMessage,
    PendingStatus, Session, SessionStatus, Settings, StoredMessage, TakeoverSession,
};
use uuid::Uuid;

// Enum columns are stored as TEXT; unknown values degrade to the most
// conservative variant instead of failing the whole row.

#[derive(sqlx::FromRow)]
pub(crate) struct MessageRow {
    pub id: Uuid,
    pub village_id: String,
    pub wa_user_id: Option<String>,
    pub channel: String,
    pub channel_identifier: String,
    pub message_id: String,
    pub message_text: String,
    pub direction: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl MessageRow {
    pub fn into_message(self) -> StoredMessage {
        StoredMessage {
            id: self.id,
            village_id: self.village_id,
            wa_user_id: self.wa_user_id,
            channel: Channel::parse(&self.channel).unwrap_or(Channel::Whatsapp),
            channel_identifier: self.channel_identifier,
            message_id: self.message_id,
            message_text: self.message_text,
            direction: Direction::parse(&self.direction).unwrap_or(Direction::In),
            source: MessageSource::parse(&self.source).unwrap_or(MessageSource::System),
            timestamp: self.timestamp,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct ConversationRow {
    pub village_id: String,
    pub channel: String,
    pub channel_identifier: String,
    pub wa_user_id: Option<String>,
    pub user_name: Option<String>,
    pub user_phone: Option<String>,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: i32,
    pub is_takeover: bool,
    pub ai_status: Option<String>,
    pub ai_error_message: Option<String>,
    pub pending_message_id: Option<String>,
}

impl ConversationRow {
    pub fn into_conversation(self) -> Conversation {
        Conversation {
            village_id: self.village_id,
            channel: Channel::parse(&self.channel).unwrap_or(Channel::Whatsapp),
            channel_identifier: self.channel_identifier,
            wa_user_id: self.wa_user_id,
            user_name: self.user_name,
            user_phone: self.user_phone,
            last_message: self.last_message,
            last_message_at: self.last_message_at,
            unread_count: self.unread_count,
            is_takeover: self.is_takeover,
            ai_status: self.ai_status.as_deref().and_then(AiStatus::parse),
            ai_error_message: self.ai_error_message,
            pending_message_id: self.pending_message_id,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct SessionRow {
    pub village_id: String,
    pub instance_name: Option<String>,
    pub admin_id: Option<String>,
    pub provider_token: Option<String>,
    pub status: Option<String>,
    pub wa_number: Option<String>,
    pub support_user_id: Option<String>,
    pub support_api_key: Option<String>,
    pub support_session_id: Option<String>,
    pub last_connected_at: Option<DateTime<Utc>>,
}

impl SessionRow {
    pub fn into_session(self) -> Session {
        Session {
            village_id: self.village_id,
            instance_name: self.instance_name,
            admin_id: self.admin_id,
            provider_token: self.provider_token,
            status: self.status.as_deref().and_then(SessionStatus::parse),
            wa_number: self.wa_number,
            support_user_id: self.support_user_id,
            support_api_key: self.support_api_key,
            support_session_id: self.support_session_id,
            last_connected_at: self.last_connected_at,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct AccountRow {
    pub village_id: String,
    pub wa_number: Option<String>,
    pub wa_token: Option<String>,
    pub webhook_url: Option<String>,
    pub enabled_wa: bool,
    pub enabled_webchat: bool,
}

impl AccountRow {
    pub fn into_account(self) -> ChannelAccount {
        ChannelAccount {
            village_id: self.village_id,
            wa_number: self.wa_number,
            wa_token: self.wa_token,
            webhook_url: self.webhook_url,
            enabled_wa: self.enabled_wa,
            enabled_webchat: self.enabled_webchat,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct TakeoverRow {
    pub id: Uuid,
    pub village_id: String,
    pub channel: String,
    pub channel_identifier: String,
    pub admin_id: String,
    pub admin_name: Option<String>,
    pub reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl TakeoverRow {
    pub fn into_takeover(self) -> TakeoverSession {
        TakeoverSession {
            id: self.id,
            village_id: self.village_id,
            channel: Channel::parse(&self.channel).unwrap_or(Channel::Whatsapp),
            channel_identifier: self.channel_identifier,
            admin_id: self.admin_id,
            admin_name: self.admin_name,
            reason: self.reason,
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct PendingRow {
    pub village_id: String,
    pub wa_user_id: Option<String>,
    pub channel: String,
    pub channel_identifier: String,
    pub message_id: String,
    pub message_text: String,
    pub status: String,
    pub retry_count: i32,
    pub error_msg: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingRow {
    pub fn into_pending(self) -> PendingMessage {
        PendingMessage {
            village_id: self.village_id,
            wa_user_id: self.wa_user_id,
            channel: Channel::parse(&self.channel).unwrap_or(Channel::Whatsapp),
            channel_identifier: self.channel_identifier,
            message_id: self.message_id,
            message_text: self.message_text,
            status: PendingStatus::parse(&self.status).unwrap_or(PendingStatus::Pending),
            retry_count: self.retry_count,
            error_msg: self.error_msg,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct SettingsRow {
    pub auto_read_messages: bool,
    pub typing_indicator: bool,
}

impl SettingsRow {
    pub fn into_settings(self) -> Settings {
        Settings {
            auto_read_messages: self.auto_read_messages,
            typing_indicator: self.typing_indicator,
        }
    }
}
