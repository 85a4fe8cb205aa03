//! One-step projection of the provider's dynamic webhook shapes into a
//! strict internal struct. Field names arrive in camelCase or PascalCase,
//! `Sender` is a string or an object, and the whole body may be wrapped in
//! a form field `jsonData`; everything past this module sees one shape.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::media::{extract_media, MediaRef};

#[derive(Debug, Clone)]
pub struct ParsedWebhook {
    pub event_type: String,
    pub instance_name: Option<String>,
    pub message: Option<NormalizedMessage>,
}

#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub chat: String,
    pub sender: Option<String>,
    pub push_name: Option<String>,
    pub is_from_me: bool,
    pub is_group: bool,
    pub text: String,
    pub media: Option<MediaRef>,
}

/// Unwrap the form transport: a single `jsonData` field carrying the JSON
/// body as a string, parsed exactly once.
pub fn unwrap_form_body(json_data: &str) -> Result<Value, serde_json::Error> {
    serde_json::from_str(json_data)
}

pub(crate) fn field<'a>(value: &'a Value, names: &[&str]) -> Option<&'a Value> {
    let obj = value.as_object()?;
    names.iter().find_map(|name| obj.get(*name))
}

pub(crate) fn str_field<'a>(value: &'a Value, names: &[&str]) -> Option<&'a str> {
    field(value, names).and_then(Value::as_str)
}

fn bool_field(value: &Value, names: &[&str]) -> bool {
    field(value, names).and_then(Value::as_bool).unwrap_or(false)
}

/// Sender arrives either as a bare JID string or as an object with the id
/// under one of several keys.
fn sender_field(info: &Value) -> Option<String> {
    let sender = field(info, &["Sender", "sender"])?;
    if let Some(s) = sender.as_str() {
        return Some(s.to_string());
    }
    str_field(sender, &["ID", "Id", "id", "User", "user"]).map(str::to_string)
}

/// Extract the message text by fixed priority: plain conversation,
/// extended text, media caption, then structured location/contact.
fn extract_text(message: &Value) -> Option<String> {
    if let Some(text) = str_field(message, &["conversation", "Conversation"]) {
        if !text.is_empty() {
            return Some(text.to_string());
        }
    }

    if let Some(extended) = field(message, &["extendedTextMessage", "ExtendedTextMessage"]) {
        if let Some(text) = str_field(extended, &["text", "Text"]) {
            return Some(text.to_string());
        }
    }

    for name in [
        "imageMessage",
        "ImageMessage",
        "videoMessage",
        "VideoMessage",
        "documentMessage",
        "DocumentMessage",
    ] {
        if let Some(media) = field(message, &[name]) {
            if let Some(caption) = str_field(media, &["caption", "Caption"]) {
                return Some(caption.to_string());
            }
            // Captionless media still yields an ingestible row.
            return Some(String::new());
        }
    }

    if let Some(location) = field(message, &["locationMessage", "LocationMessage"]) {
        let lat = field(location, &["degreesLatitude", "DegreesLatitude"])
            .and_then(Value::as_f64)
            .unwrap_or_default();
        let lng = field(location, &["degreesLongitude", "DegreesLongitude"])
            .and_then(Value::as_f64)
            .unwrap_or_default();
        return Some(format!("[location] {lat},{lng}"));
    }

    if let Some(contact) = field(message, &["contactMessage", "ContactMessage"]) {
        let name = str_field(contact, &["displayName", "DisplayName"]).unwrap_or("contact");
        return Some(format!("[contact] {name}"));
    }

    None
}

/// Project the raw payload. Non-`Message` events keep their type for the
/// caller to acknowledge as a no-op; malformed message events come back
/// with `message: None`.
pub fn parse_webhook(payload: &Value) -> ParsedWebhook {
    let event_type = str_field(payload, &["type", "Type"])
        .unwrap_or_default()
        .to_string();
    let instance_name = str_field(
        payload,
        &["instanceName", "InstanceName", "instance_name"],
    )
    .map(str::to_string);

    if event_type != "Message" {
        return ParsedWebhook {
            event_type,
            instance_name,
            message: None,
        };
    }

    let message = (|| {
        let event = field(payload, &["event", "Event"])?;
        let info = field(event, &["Info", "info"])?;

        let message_id = str_field(info, &["ID", "Id", "id"])?.to_string();
        let chat = str_field(info, &["Chat", "chat"])?.to_string();
        let timestamp = str_field(info, &["Timestamp", "timestamp"])
            .and_then(|raw| raw.parse::<DateTime<Utc>>().ok())
            .unwrap_or_else(Utc::now);

        let body = field(event, &["Message", "message"]);
        let text = body.and_then(extract_text).unwrap_or_default();
        let media = extract_media(payload, body);

        if text.is_empty() && media.is_none() {
            return None;
        }

        Some(NormalizedMessage {
            message_id,
            timestamp,
            chat,
            sender: sender_field(info),
            push_name: str_field(info, &["PushName", "pushName"]).map(str::to_string),
            is_from_me: bool_field(info, &["IsFromMe", "isFromMe"]),
            is_group: bool_field(info, &["IsGroup", "isGroup"]),
            text,
            media,
        })
    })();

    ParsedWebhook {
        event_type,
        instance_name,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_payload() -> Value {
        json!({
            "type": "Message",
            "instanceName": "desa-a",
            "event": {
                "Info": {
                    "ID": "m1",
                    "Chat": "628111222333@s.whatsapp.net",
                    "Timestamp": "2026-01-01T00:00:00Z",
                    "IsFromMe": false,
                    "IsGroup": false,
                    "PushName": "Budi"
                },
                "Message": { "conversation": "halo" }
            }
        })
    }

    #[test]
    fn parses_the_canonical_text_message() {
        let parsed = parse_webhook(&base_payload());
        assert_eq!(parsed.event_type, "Message");
        assert_eq!(parsed.instance_name.as_deref(), Some("desa-a"));

        let msg = parsed.message.unwrap();
        assert_eq!(msg.message_id, "m1");
        assert_eq!(msg.chat, "628111222333@s.whatsapp.net");
        assert_eq!(msg.text, "halo");
        assert_eq!(msg.push_name.as_deref(), Some("Budi"));
        assert!(!msg.is_from_me);
        assert_eq!(msg.timestamp.to_rfc3339(), "2026-01-01T00:00:00+00:00");
    }

    #[test]
    fn non_message_events_carry_no_message() {
        let parsed = parse_webhook(&json!({ "type": "Presence", "event": {} }));
        assert_eq!(parsed.event_type, "Presence");
        assert!(parsed.message.is_none());
    }

    #[test]
    fn pascal_case_keys_are_equivalent() {
        let parsed = parse_webhook(&json!({
            "Type": "Message",
            "InstanceName": "desa-a",
            "Event": {
                "Info": {
                    "Id": "m2",
                    "Chat": "628111@s.whatsapp.net",
                    "IsFromMe": true
                },
                "Message": { "Conversation": "dari saya" }
            }
        }));
        let msg = parsed.message.unwrap();
        assert_eq!(msg.message_id, "m2");
        assert!(msg.is_from_me);
        assert_eq!(msg.text, "dari saya");
    }

    #[test]
    fn extended_text_takes_second_priority() {
        let mut payload = base_payload();
        payload["event"]["Message"] = json!({
            "extendedTextMessage": { "text": "balasan panjang" }
        });
        let msg = parse_webhook(&payload).message.unwrap();
        assert_eq!(msg.text, "balasan panjang");
    }

    #[test]
    fn image_caption_is_used_as_text() {
        let mut payload = base_payload();
        payload["event"]["Message"] = json!({
            "imageMessage": { "caption": "lihat foto ini", "mimetype": "image/jpeg", "url": "https://cdn/img" }
        });
        let msg = parse_webhook(&payload).message.unwrap();
        assert_eq!(msg.text, "lihat foto ini");
        assert!(msg.media.is_some());
    }

    #[test]
    fn location_message_is_rendered_structurally() {
        let mut payload = base_payload();
        payload["event"]["Message"] = json!({
            "locationMessage": { "degreesLatitude": -6.2, "degreesLongitude": 106.8 }
        });
        let msg = parse_webhook(&payload).message.unwrap();
        assert_eq!(msg.text, "[location] -6.2,106.8");
    }

    #[test]
    fn sender_accepts_string_or_object() {
        let mut payload = base_payload();
        payload["event"]["Info"]["Sender"] = json!("628999@s.whatsapp.net");
        let msg = parse_webhook(&payload).message.unwrap();
        assert_eq!(msg.sender.as_deref(), Some("628999@s.whatsapp.net"));

        let mut payload = base_payload();
        payload["event"]["Info"]["Sender"] = json!({ "User": "628999" });
        let msg = parse_webhook(&payload).message.unwrap();
        assert_eq!(msg.sender.as_deref(), Some("628999"));
    }

    #[test]
    fn form_body_is_parsed_once() {
        let inner = base_payload().to_string();
        let value = unwrap_form_body(&inner).unwrap();
        let msg = parse_webhook(&value).message.unwrap();
        assert_eq!(msg.message_id, "m1");
    }

    #[test]
    fn missing_text_and_media_means_no_message() {
        let mut payload = base_payload();
        payload["event"]["Message"] = json!({});
        assert!(parse_webhook(&payload).message.is_none());
    }
}
