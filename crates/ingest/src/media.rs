//! Media extraction and storage. Extraction inspects the payload in fixed
//! order (`s3.url`, top-level base64, typed message fields, JPEG thumbnail
//! fallback); storage is best-effort and bounded by a download timeout so
//! the save path never blocks on a slow CDN.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use govconnect_core::config::AppConfig;
use serde_json::Value;
use tracing::debug;

use crate::webhook::{field, str_field};

pub const MEDIA_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub enum MediaSource {
    Url(String),
    Base64(String),
}

#[derive(Debug, Clone)]
pub struct MediaRef {
    /// Coarse kind: image, video, audio, document, sticker.
    pub media_type: String,
    pub mime_type: Option<String>,
    pub source: MediaSource,
}

/// Stored file exposed through two URL spaces: internal (service-to-service)
/// and public (dashboard links).
#[derive(Debug, Clone)]
pub struct SavedMedia {
    pub media_type: String,
    pub internal_url: Option<String>,
    pub public_url: Option<String>,
}

fn media_type_from_mime(mime: &str) -> &'static str {
    match mime.split('/').next().unwrap_or_default() {
        "image" => "image",
        "video" => "video",
        "audio" => "audio",
        _ => "document",
    }
}

const TYPED_FIELDS: [(&str, &str); 10] = [
    ("imageMessage", "image"),
    ("ImageMessage", "image"),
    ("videoMessage", "video"),
    ("VideoMessage", "video"),
    ("audioMessage", "audio"),
    ("AudioMessage", "audio"),
    ("documentMessage", "document"),
    ("DocumentMessage", "document"),
    ("stickerMessage", "sticker"),
    ("StickerMessage", "sticker"),
];

/// Pull a media descriptor out of the webhook. `payload` is the whole body
/// (for `s3`/`base64` transports), `message` the typed message object.
pub fn extract_media(payload: &Value, message: Option<&Value>) -> Option<MediaRef> {
    let top_mime = str_field(payload, &["mimeType", "MimeType", "mimetype"]).map(str::to_string);

    if let Some(s3) = field(payload, &["s3", "S3"]) {
        if let Some(url) = str_field(s3, &["url", "Url", "URL"]) {
            let media_type = top_mime
                .as_deref()
                .map(media_type_from_mime)
                .unwrap_or("document");
            return Some(MediaRef {
                media_type: media_type.to_string(),
                mime_type: top_mime,
                source: MediaSource::Url(url.to_string()),
            });
        }
    }

    if let Some(b64) = str_field(payload, &["base64", "Base64"]) {
        if let Some(mime) = top_mime {
            return Some(MediaRef {
                media_type: media_type_from_mime(&mime).to_string(),
                mime_type: Some(mime),
                source: MediaSource::Base64(b64.to_string()),
            });
        }
    }

    let message = message?;
    for (name, media_type) in TYPED_FIELDS {
        let Some(typed) = field(message, &[name]) else {
            continue;
        };
        let mime = str_field(typed, &["mimetype", "Mimetype", "mimeType"]).map(str::to_string);

        if let Some(url) = str_field(typed, &["url", "Url", "URL"]) {
            return Some(MediaRef {
                media_type: media_type.to_string(),
                mime_type: mime,
                source: MediaSource::Url(url.to_string()),
            });
        }

        // Images without a fetchable URL still carry a thumbnail worth
        // keeping as a degraded fallback.
        if media_type == "image" {
            if let Some(thumb) = str_field(typed, &["JPEGThumbnail", "jpegThumbnail"]) {
                return Some(MediaRef {
                    media_type: "image".to_string(),
                    mime_type: Some("image/jpeg".to_string()),
                    source: MediaSource::Base64(thumb.to_string()),
                });
            }
        }
    }
    None
}

pub struct MediaStorage {
    root: PathBuf,
    internal_base: Option<String>,
    public_base: Option<String>,
    http: reqwest::Client,
}

impl MediaStorage {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            root: config.media_storage_path.clone(),
            internal_base: config
                .media_internal_url
                .as_deref()
                .map(|s| s.trim_end_matches('/').to_string()),
            public_base: config
                .media_public_url
                .as_deref()
                .map(|s| s.trim_end_matches('/').to_string()),
            http: reqwest::Client::builder()
                .timeout(MEDIA_DOWNLOAD_TIMEOUT)
                .build()
                .expect("failed to build media HTTP client"),
        }
    }

    /// Fetch the bytes and store them under
    /// `<root>/<channel_identifier>/<messageId>_<ts>.<ext>`.
    pub async fn fetch_and_store(
        &self,
        media: &MediaRef,
        channel_identifier: &str,
        message_id: &str,
    ) -> Result<SavedMedia> {
        let bytes = match &media.source {
            MediaSource::Url(url) => {
                let resp = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .context("media download failed")?;
                if !resp.status().is_success() {
                    anyhow::bail!("media download returned HTTP {}", resp.status());
                }
                resp.bytes().await.context("media body read failed")?.to_vec()
            }
            MediaSource::Base64(data) => {
                let raw = data.split(',').next_back().unwrap_or(data);
                BASE64.decode(raw).context("media base64 decode failed")?
            }
        };

        let ext = media
            .mime_type
            .as_deref()
            .and_then(extension_for_mime)
            .or_else(|| infer::get(&bytes).map(|kind| kind.extension()))
            .unwrap_or("bin");

        let dir = self.root.join(sanitize(channel_identifier));
        tokio::fs::create_dir_all(&dir)
            .await
            .context("media directory create failed")?;

        let filename = format!(
            "{}_{}.{}",
            sanitize(message_id),
            Utc::now().timestamp_millis(),
            ext
        );
        let path = dir.join(&filename);
        tokio::fs::write(&path, &bytes)
            .await
            .context("media write failed")?;

        debug!(path = %path.display(), size = bytes.len(), "media stored");

        let rel = format!("{}/{}", sanitize(channel_identifier), filename);
        Ok(SavedMedia {
            media_type: media.media_type.clone(),
            internal_url: self.internal_base.as_deref().map(|b| format!("{b}/{rel}")),
            public_url: self.public_base.as_deref().map(|b| format!("{b}/{rel}")),
        })
    }
}

fn extension_for_mime(mime: &str) -> Option<&'static str> {
    match mime {
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        "video/mp4" => Some("mp4"),
        "audio/ogg" | "audio/ogg; codecs=opus" => Some("ogg"),
        "audio/mpeg" => Some("mp3"),
        "application/pdf" => Some("pdf"),
        _ => None,
    }
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn s3_url_takes_first_priority() {
        let payload = json!({
            "mimeType": "image/png",
            "s3": { "url": "https://bucket/key.png" },
            "base64": "ignored"
        });
        let media = extract_media(&payload, None).unwrap();
        assert_eq!(media.media_type, "image");
        assert!(matches!(media.source, MediaSource::Url(ref u) if u == "https://bucket/key.png"));
    }

    #[test]
    fn top_level_base64_requires_mime() {
        let payload = json!({ "base64": "aGFsbw==" });
        assert!(extract_media(&payload, None).is_none());

        let payload = json!({ "base64": "aGFsbw==", "mimeType": "application/pdf" });
        let media = extract_media(&payload, None).unwrap();
        assert_eq!(media.media_type, "document");
    }

    #[test]
    fn typed_message_field_is_used() {
        let message = json!({
            "videoMessage": { "url": "https://cdn/video", "mimetype": "video/mp4" }
        });
        let media = extract_media(&json!({}), Some(&message)).unwrap();
        assert_eq!(media.media_type, "video");
        assert_eq!(media.mime_type.as_deref(), Some("video/mp4"));
    }

    #[test]
    fn jpeg_thumbnail_is_the_image_fallback() {
        let message = json!({
            "imageMessage": { "mimetype": "image/jpeg", "JPEGThumbnail": "dGh1bWI=" }
        });
        let media = extract_media(&json!({}), Some(&message)).unwrap();
        assert!(matches!(media.source, MediaSource::Base64(_)));
        assert_eq!(media.mime_type.as_deref(), Some("image/jpeg"));
    }

    #[tokio::test]
    async fn stores_base64_media_under_conversation_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cfg: AppConfig = serde_json::from_value(json!({
            "database_url": "postgres://localhost/test",
            "rabbitmq_url": "amqp://localhost",
            "internal_api_key": "k",
            "media_storage_path": dir.path().to_str().unwrap(),
            "media_internal_url": "http://channel:8080/media",
            "media_public_url": "https://cdn.example/media",
        }))
        .unwrap();
        let storage = MediaStorage::new(&cfg);

        let media = MediaRef {
            media_type: "image".into(),
            mime_type: Some("image/png".into()),
            source: MediaSource::Base64(BASE64.encode(b"png-bytes")),
        };
        let saved = storage
            .fetch_and_store(&media, "628111222333", "m1")
            .await
            .unwrap();

        assert!(saved.internal_url.unwrap().starts_with("http://channel:8080/media/628111222333/m1_"));
        assert!(saved.public_url.unwrap().ends_with(".png"));

        let entries: Vec<_> = std::fs::read_dir(dir.path().join("628111222333"))
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn downloads_url_media() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.pdf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.4 fake".to_vec()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cfg: AppConfig = serde_json::from_value(json!({
            "database_url": "postgres://localhost/test",
            "rabbitmq_url": "amqp://localhost",
            "internal_api_key": "k",
            "media_storage_path": dir.path().to_str().unwrap(),
        }))
        .unwrap();
        let storage = MediaStorage::new(&cfg);

        let media = MediaRef {
            media_type: "document".into(),
            mime_type: Some("application/pdf".into()),
            source: MediaSource::Url(format!("{}/file.pdf", server.uri())),
        };
        let saved = storage.fetch_and_store(&media, "628111", "m9").await.unwrap();
        // No URL bases configured: file is on disk but unexposed.
        assert!(saved.internal_url.is_none());
        assert!(saved.public_url.is_none());
    }
}
