use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment-driven configuration for the channel gateway.
///
/// Every field maps to the upper-case environment variable of the same name
/// (`DATABASE_URL`, `SPAM_GUARD_MAX_IDENTICAL`, ...). Required connection
/// strings fail startup when missing; tunables carry their documented
/// defaults.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub rabbitmq_url: String,
    /// Service-to-service token expected in `X-Internal-API-Key`.
    pub internal_api_key: String,

    pub wa_api_url: Option<String>,
    pub wa_support_url: Option<String>,
    /// May be in `source:key` form; only the key portion is sent upstream.
    pub wa_support_internal_api_key: Option<String>,
    pub public_channel_base_url: Option<String>,
    pub wa_webhook_verify_token: Option<String>,

    #[serde(default = "default_media_storage_path")]
    pub media_storage_path: PathBuf,
    pub media_internal_url: Option<String>,
    pub media_public_url: Option<String>,

    #[serde(default = "default_true")]
    pub spam_guard_enabled: bool,
    #[serde(default = "default_max_identical")]
    pub spam_guard_max_identical: u32,
    #[serde(default = "default_ban_duration_ms")]
    pub spam_guard_ban_duration_ms: u64,
    #[serde(default = "default_rate_max_messages")]
    pub spam_rate_max_messages: u32,
    #[serde(default = "default_rate_window_ms")]
    pub spam_rate_window_ms: u64,

    #[serde(default = "default_publish_retry_delay_ms")]
    pub message_batch_publish_retry_delay_ms: u64,

    /// Fallback tenant when webhook tenant resolution fails.
    pub default_village_id: Option<String>,

    /// Short-circuit all provider send paths with a synthetic message id.
    #[serde(default)]
    pub wa_dry_run: bool,

    /// Comma-separated list of peer IPs allowed to hit the webhook ingress.
    /// Empty means no restriction.
    pub webhook_ip_allowlist: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_media_storage_path() -> PathBuf {
    PathBuf::from("./storage/media")
}

fn default_true() -> bool {
    true
}

fn default_max_identical() -> u32 {
    5
}

fn default_ban_duration_ms() -> u64 {
    60_000
}

fn default_rate_max_messages() -> u32 {
    10
}

fn default_rate_window_ms() -> u64 {
    10_000
}

fn default_publish_retry_delay_ms() -> u64 {
    5_000
}

fn default_port() -> u16 {
    8080
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(Environment::default().try_parsing(true))
            .build()?;

        s.try_deserialize()
    }

    /// The key portion of `WA_SUPPORT_INTERNAL_API_KEY`, stripping an
    /// optional `source:` prefix.
    pub fn support_api_key(&self) -> Option<&str> {
        self.wa_support_internal_api_key
            .as_deref()
            .map(|raw| match raw.split_once(':') {
                Some((_source, key)) => key,
                None => raw,
            })
    }

    pub fn webhook_allowlist(&self) -> Vec<String> {
        self.webhook_ip_allowlist
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(|ip| ip.trim().to_string())
                    .filter(|ip| !ip.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> AppConfig {
        AppConfig {
            database_url: "postgres://localhost/channel".into(),
            rabbitmq_url: "amqp://localhost:5672".into(),
            internal_api_key: "secret".into(),
            wa_api_url: None,
            wa_support_url: None,
            wa_support_internal_api_key: None,
            public_channel_base_url: None,
            wa_webhook_verify_token: None,
            media_storage_path: default_media_storage_path(),
            media_internal_url: None,
            media_public_url: None,
            spam_guard_enabled: true,
            spam_guard_max_identical: default_max_identical(),
            spam_guard_ban_duration_ms: default_ban_duration_ms(),
            spam_rate_max_messages: default_rate_max_messages(),
            spam_rate_window_ms: default_rate_window_ms(),
            message_batch_publish_retry_delay_ms: default_publish_retry_delay_ms(),
            default_village_id: None,
            wa_dry_run: false,
            webhook_ip_allowlist: None,
            port: default_port(),
        }
    }

    #[test]
    fn support_key_strips_source_prefix() {
        let mut cfg = minimal();
        cfg.wa_support_internal_api_key = Some("dashboard:abc123".into());
        assert_eq!(cfg.support_api_key(), Some("abc123"));

        cfg.wa_support_internal_api_key = Some("plainkey".into());
        assert_eq!(cfg.support_api_key(), Some("plainkey"));
    }

    #[test]
    fn allowlist_splits_and_trims() {
        let mut cfg = minimal();
        cfg.webhook_ip_allowlist = Some("10.0.0.1, 10.0.0.2 ,".into());
        assert_eq!(cfg.webhook_allowlist(), vec!["10.0.0.1", "10.0.0.2"]);
        cfg.webhook_ip_allowlist = None;
        assert!(cfg.webhook_allowlist().is_empty());
    }
}
