use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Messaging channel a conversation lives on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    Whatsapp,
    Webchat,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Whatsapp => "WHATSAPP",
            Channel::Webchat => "WEBCHAT",
        }
    }

    pub fn parse(s: &str) -> Option<Channel> {
        match s {
            "WHATSAPP" => Some(Channel::Whatsapp),
            "WEBCHAT" => Some(Channel::Webchat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "IN",
            Direction::Out => "OUT",
        }
    }

    pub fn parse(s: &str) -> Option<Direction> {
        match s {
            "IN" => Some(Direction::In),
            "OUT" => Some(Direction::Out),
            _ => None,
        }
    }
}

/// Who produced a stored message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageSource {
    WaWebhook,
    Ai,
    System,
    Admin,
}

impl MessageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageSource::WaWebhook => "WA_WEBHOOK",
            MessageSource::Ai => "AI",
            MessageSource::System => "SYSTEM",
            MessageSource::Admin => "ADMIN",
        }
    }

    pub fn parse(s: &str) -> Option<MessageSource> {
        match s {
            "WA_WEBHOOK" => Some(MessageSource::WaWebhook),
            "AI" => Some(MessageSource::Ai),
            "SYSTEM" => Some(MessageSource::System),
            "ADMIN" => Some(MessageSource::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Connected,
    Disconnected,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Connected => "connected",
            SessionStatus::Disconnected => "disconnected",
        }
    }

    pub fn parse(s: &str) -> Option<SessionStatus> {
        match s {
            "connected" => Some(SessionStatus::Connected),
            "disconnected" => Some(SessionStatus::Disconnected),
            _ => None,
        }
    }
}

/// AI pipeline state surfaced on a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AiStatus {
    Processing,
    Error,
}

impl AiStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AiStatus::Processing => "processing",
            AiStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<AiStatus> {
        match s {
            "processing" => Some(AiStatus::Processing),
            "error" => Some(AiStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl PendingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingStatus::Pending => "pending",
            PendingStatus::Processing => "processing",
            PendingStatus::Completed => "completed",
            PendingStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<PendingStatus> {
        match s {
            "pending" => Some(PendingStatus::Pending),
            "processing" => Some(PendingStatus::Processing),
            "completed" => Some(PendingStatus::Completed),
            "failed" => Some(PendingStatus::Failed),
            _ => None,
        }
    }
}

/// Identifies one conversation. Every store lookup and every ordering
/// decision is scoped by this tuple; two keys never share state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub village_id: String,
    pub channel: Channel,
    pub channel_identifier: String,
}

impl ConversationKey {
    pub fn new(village_id: &str, channel: Channel, channel_identifier: &str) -> Self {
        Self {
            village_id: village_id.to_string(),
            channel,
            channel_identifier: channel_identifier.to_string(),
        }
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.village_id,
            self.channel.as_str(),
            self.channel_identifier
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: Uuid,
    pub village_id: String,
    pub wa_user_id: Option<String>,
    pub channel: Channel,
    pub channel_identifier: String,
    /// Globally unique provider-side id; the idempotency primitive.
    pub message_id: String,
    pub message_text: String,
    pub direction: Direction,
    pub source: MessageSource,
    pub timestamp: DateTime<Utc>,
}

/// Message about to be persisted. `id` is assigned on insert.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub village_id: String,
    pub wa_user_id: Option<String>,
    pub channel: Channel,
    pub channel_identifier: String,
    pub message_id: String,
    pub message_text: String,
    pub direction: Direction,
    pub source: MessageSource,
    pub timestamp: DateTime<Utc>,
}

impl NewMessage {
    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::new(&self.village_id, self.channel, &self.channel_identifier)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub village_id: String,
    pub channel: Channel,
    pub channel_identifier: String,
    pub wa_user_id: Option<String>,
    pub user_name: Option<String>,
    pub user_phone: Option<String>,
    pub last_message: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread_count: i32,
    pub is_takeover: bool,
    pub ai_status: Option<AiStatus>,
    pub ai_error_message: Option<String>,
    pub pending_message_id: Option<String>,
}

impl Conversation {
    pub fn key(&self) -> ConversationKey {
        ConversationKey::new(&self.village_id, self.channel, &self.channel_identifier)
    }
}

/// One provider session per tenant. `instance_name` is the slug the upstream
/// provider uses in webhooks and is a second unique key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub village_id: String,
    pub instance_name: Option<String>,
    pub admin_id: Option<String>,
    pub provider_token: Option<String>,
    pub status: Option<SessionStatus>,
    pub wa_number: Option<String>,
    pub support_user_id: Option<String>,
    pub support_api_key: Option<String>,
    pub support_session_id: Option<String>,
    pub last_connected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelAccount {
    pub village_id: String,
    pub wa_number: Option<String>,
    pub wa_token: Option<String>,
    pub webhook_url: Option<String>,
    pub enabled_wa: bool,
    pub enabled_webchat: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeoverSession {
    pub id: Uuid,
    pub village_id: String,
    pub channel: Channel,
    pub channel_identifier: String,
    pub admin_id: String,
    pub admin_name: Option<String>,
    pub reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMessage {
    pub village_id: String,
    pub wa_user_id: Option<String>,
    pub channel: Channel,
    pub channel_identifier: String,
    pub message_id: String,
    pub message_text: String,
    pub status: PendingStatus,
    pub retry_count: i32,
    pub error_msg: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingMessage {
    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::new(&self.village_id, self.channel, &self.channel_identifier)
    }
}

/// Process-wide dashboard toggles, persisted as a single row.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Settings {
    pub auto_read_messages: bool,
    pub typing_indicator: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_round_trips_through_str() {
        assert_eq!(Channel::parse("WHATSAPP"), Some(Channel::Whatsapp));
        assert_eq!(Channel::parse("WEBCHAT"), Some(Channel::Webchat));
        assert_eq!(Channel::parse("sms"), None);
        assert_eq!(Channel::Whatsapp.as_str(), "WHATSAPP");
    }

    #[test]
    fn conversation_key_display_is_stable() {
        let key = ConversationKey::new("V1", Channel::Whatsapp, "628111222333");
        assert_eq!(key.to_string(), "V1:WHATSAPP:628111222333");
    }

    #[test]
    fn pending_status_parses_all_states() {
        for s in ["pending", "processing", "completed", "failed"] {
            let parsed = PendingStatus::parse(s).unwrap();
            assert_eq!(parsed.as_str(), s);
        }
    }
}
