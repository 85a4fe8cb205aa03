use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Channel, PendingStatus};

/// Durable topic exchange every gateway event flows through.
pub const EXCHANGE_NAME: &str = "govconnect.events";

pub const ROUTE_MESSAGE_RECEIVED: &str = "whatsapp.message.received";
pub const ROUTE_AI_REPLY: &str = "ai.reply";
pub const ROUTE_AI_ERROR: &str = "ai.error";
pub const ROUTE_MESSAGE_STATUS: &str = "message.status";

/// Queue names are stable per consumer so redeliveries survive restarts.
pub const QUEUE_AI_REPLY: &str = "channel.ai.reply";
pub const QUEUE_AI_ERROR: &str = "channel.ai.error";
pub const QUEUE_MESSAGE_STATUS: &str = "channel.message.status";

/// One accumulated bubble entry forwarded to the AI so a superseding reply
/// can consider every text the user sent while the AI was still thinking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextMessage {
    pub message_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpamGuardInfo {
    #[serde(default)]
    pub is_duplicate: bool,
    #[serde(default)]
    pub supersede_previous: bool,
    #[serde(default)]
    pub suppressed_message_ids: Vec<String>,
    #[serde(default)]
    pub context_messages: Vec<ContextMessage>,
}

/// Published on `whatsapp.message.received` for every approved inbound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessageEvent {
    pub village_id: String,
    pub wa_user_id: Option<String>,
    pub message: String,
    pub message_id: String,
    pub received_at: DateTime<Utc>,
    pub batched_message_ids: Vec<String>,
    #[serde(default)]
    pub has_media: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_public_url: Option<String>,
    pub spam_guard: SpamGuardInfo,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_retry: bool,
}

/// Consumed from `ai.reply`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiReplyEvent {
    pub village_id: String,
    pub wa_user_id: Option<String>,
    #[serde(default)]
    pub channel: Option<Channel>,
    #[serde(default)]
    pub channel_identifier: Option<String>,
    pub reply_text: String,
    /// Optional second bubble sent shortly after the main reply.
    #[serde(default)]
    pub guidance_text: Option<String>,
    #[serde(default)]
    pub batched_message_ids: Vec<String>,
}

impl AiReplyEvent {
    /// The conversation identifier the reply targets. The orchestrator may
    /// omit `channel_identifier` for WhatsApp where it equals the user id.
    pub fn target_identifier(&self) -> Option<&str> {
        self.channel_identifier
            .as_deref()
            .or(self.wa_user_id.as_deref())
    }
}

/// Consumed from `ai.error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiErrorEvent {
    pub village_id: String,
    pub wa_user_id: Option<String>,
    #[serde(default)]
    pub channel: Option<Channel>,
    #[serde(default)]
    pub channel_identifier: Option<String>,
    pub error_message: String,
    #[serde(default)]
    pub batched_message_ids: Vec<String>,
}

impl AiErrorEvent {
    pub fn target_identifier(&self) -> Option<&str> {
        self.channel_identifier
            .as_deref()
            .or(self.wa_user_id.as_deref())
    }
}

/// Consumed from `message.status`; drives pending-queue transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageStatusEvent {
    pub village_id: String,
    pub message_id: String,
    pub status: PendingStatus,
    #[serde(default)]
    pub error_msg: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_event_serializes_snake_case() {
        let event = InboundMessageEvent {
            village_id: "V1".into(),
            wa_user_id: Some("628111222333".into()),
            message: "halo".into(),
            message_id: "m1".into(),
            received_at: "2026-01-01T00:00:00Z".parse().unwrap(),
            batched_message_ids: vec!["m1".into()],
            has_media: false,
            media_type: None,
            media_url: None,
            media_public_url: None,
            spam_guard: SpamGuardInfo::default(),
            is_retry: false,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["village_id"], "V1");
        assert_eq!(json["batched_message_ids"][0], "m1");
        assert_eq!(json["spam_guard"]["supersede_previous"], false);
        // not-retry publishes omit the flag entirely
        assert!(json.get("is_retry").is_none());
    }

    #[test]
    fn ai_reply_falls_back_to_user_id() {
        let reply: AiReplyEvent = serde_json::from_value(serde_json::json!({
            "village_id": "V1",
            "wa_user_id": "628111222333",
            "reply_text": "hai",
            "batched_message_ids": ["m2"],
        }))
        .unwrap();

        assert_eq!(reply.target_identifier(), Some("628111222333"));
        assert!(reply.guidance_text.is_none());
    }

    #[test]
    fn status_event_parses_pending_states() {
        let event: MessageStatusEvent = serde_json::from_value(serde_json::json!({
            "village_id": "V1",
            "message_id": "m1",
            "status": "completed",
        }))
        .unwrap();
        assert_eq!(event.status, PendingStatus::Completed);
    }
}
