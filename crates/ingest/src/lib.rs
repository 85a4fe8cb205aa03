//! Inbound pipeline: webhook normalization, tenant resolution, filtering,
//! media fetch, persistence with FIFO truncation, spam-guard decision, and
//! hand-off to the forwarder. Steps for one conversation run under a
//! per-conversation lock so store → guard → publish keeps strict order.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use govconnect_core::types::{
    Channel, ConversationKey, Direction, MessageSource, NewMessage,
};
use govconnect_core::events::{InboundMessageEvent, SpamGuardInfo};
use govconnect_forwarder::Forwarder;
use govconnect_guard::{SpamGuard, SpamVerdict};
use govconnect_provider::phone::strip_jid;
use govconnect_store::{InsertOutcome, Store};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod media;
pub mod webhook;

use media::{MediaStorage, SavedMedia, MEDIA_DOWNLOAD_TIMEOUT};
use webhook::parse_webhook;

/// Longest acceptable phone-derived identifier.
const MAX_PHONE_DIGITS: usize = 16;

/// Why the pipeline stopped; the webhook response is 2xx in every case so
/// the provider does not retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Non-message events, filtered chats, duplicates, malformed bodies.
    Ignored(&'static str),
    /// The spam guard rejected the message; nothing was persisted.
    SpamRejected,
    /// Stored; in takeover mode no event was published.
    Accepted { message_id: String, forwarded: bool },
}

/// Per-conversation async locks, created on first use.
#[derive(Clone, Default)]
struct KeyedLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl KeyedLocks {
    async fn acquire(&self, key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

pub struct Ingest {
    store: Store,
    guard: Arc<SpamGuard>,
    forwarder: Arc<Forwarder>,
    media: Arc<MediaStorage>,
    default_village: Option<String>,
    locks: KeyedLocks,
}

impl Ingest {
    pub fn new(
        store: Store,
        guard: Arc<SpamGuard>,
        forwarder: Arc<Forwarder>,
        media: MediaStorage,
        default_village: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            guard,
            forwarder,
            media: Arc::new(media),
            default_village,
            locks: KeyedLocks::default(),
        })
    }

    /// Entry point for both webhook routes. The payload is already a parsed
    /// JSON value (the form `jsonData` transport is unwrapped by the API
    /// layer via [`webhook::unwrap_form_body`]).
    pub async fn process_webhook(&self, payload: Value) -> Result<IngestOutcome> {
        let parsed = parse_webhook(&payload);

        if parsed.event_type != "Message" {
            debug!(event_type = %parsed.event_type, "non-message webhook acknowledged");
            return Ok(IngestOutcome::Ignored("non-message event"));
        }
        let Some(msg) = parsed.message else {
            warn!("message webhook without a usable body");
            return Ok(IngestOutcome::Ignored("malformed message event"));
        };

        // Filter order is fixed; each check is cheap and conclusive.
        if msg.is_group || msg.chat.ends_with("@g.us") {
            return Ok(IngestOutcome::Ignored("group chat"));
        }
        if msg.chat.ends_with("@broadcast") {
            return Ok(IngestOutcome::Ignored("broadcast"));
        }
        if msg.chat.starts_with("status@") {
            return Ok(IngestOutcome::Ignored("status update"));
        }
        if msg.is_from_me {
            return Ok(IngestOutcome::Ignored("own message"));
        }

        if self.store.message_exists(&msg.message_id).await? {
            debug!(message_id = %msg.message_id, "duplicate webhook acknowledged");
            return Ok(IngestOutcome::Ignored("duplicate message"));
        }

        let phone = strip_jid(&msg.chat).to_string();
        if phone.is_empty()
            || phone.len() > MAX_PHONE_DIGITS
            || !phone.chars().all(|c| c.is_ascii_digit())
        {
            return Ok(IngestOutcome::Ignored("implausible phone identifier"));
        }

        let village_id = self.resolve_village(parsed.instance_name.as_deref()).await;
        let key = ConversationKey::new(&village_id, Channel::Whatsapp, &phone);

        // Everything from here runs serialized per conversation.
        let _ordering = self.locks.acquire(&key.to_string()).await;

        // Media fetch is detached so a slow CDN cannot stall persistence;
        // it is joined again before the event is built.
        let media_task: Option<JoinHandle<Option<SavedMedia>>> = msg.media.clone().map(|media| {
            let storage = Arc::clone(&self.media);
            let identifier = phone.clone();
            let message_id = msg.message_id.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(
                    MEDIA_DOWNLOAD_TIMEOUT,
                    storage.fetch_and_store(&media, &identifier, &message_id),
                )
                .await
                {
                    Ok(Ok(saved)) => Some(saved),
                    Ok(Err(e)) => {
                        warn!(message_id = %message_id, error = %e, "media fetch failed");
                        None
                    }
                    Err(_) => {
                        warn!(message_id = %message_id, "media fetch timed out");
                        None
                    }
                }
            })
        });

        let has_media = msg.media.is_some();
        let new_message = NewMessage {
            village_id: village_id.clone(),
            wa_user_id: Some(phone.clone()),
            channel: Channel::Whatsapp,
            channel_identifier: phone.clone(),
            message_id: msg.message_id.clone(),
            message_text: msg.text.clone(),
            direction: Direction::In,
            source: MessageSource::WaWebhook,
            timestamp: msg.timestamp,
        };

        match self.store.insert_message(&new_message).await? {
            InsertOutcome::Duplicate => {
                return Ok(IngestOutcome::Ignored("duplicate message"));
            }
            InsertOutcome::Inserted => {}
        }

        // Takeover: store for admin visibility, cancel the in-flight batch,
        // and publish nothing.
        let conversation = self.store.get_conversation(&key).await?;
        if conversation.is_some_and(|c| c.is_takeover) {
            let cancelled = self.guard.cancel_in_flight(&village_id, &phone);
            self.store.mark_pending_completed(&cancelled).await?;
            self.store
                .apply_message_to_conversation(
                    &key,
                    Some(&phone),
                    &msg.text,
                    msg.timestamp,
                    Direction::In,
                )
                .await?;
            self.update_profile(&key, msg.push_name.as_deref(), &phone).await;
            info!(conversation = %key, "takeover active, message stored without forwarding");
            return Ok(IngestOutcome::Accepted {
                message_id: msg.message_id,
                forwarded: false,
            });
        }

        let verdict =
            self.guard
                .check_message(&village_id, &phone, &msg.message_id, &msg.text);

        let (supersede, suppressed, context) = match verdict {
            SpamVerdict::Reject(reason) => {
                // Must not enter history: remove the row inserted above.
                self.store.delete_message(&msg.message_id).await?;
                warn!(conversation = %key, ?reason, "message rejected as spam");
                return Ok(IngestOutcome::SpamRejected);
            }
            SpamVerdict::Process {
                supersede_previous,
                suppressed_message_ids,
                context,
            } => (supersede_previous, suppressed_message_ids, context),
        };

        if supersede {
            // Earlier bubbles are done; their replies (if any) get dropped.
            self.store.mark_pending_completed(&suppressed).await?;
        }

        self.store.create_pending(&new_message).await?;
        self.store
            .apply_message_to_conversation(
                &key,
                Some(&phone),
                &msg.text,
                msg.timestamp,
                Direction::In,
            )
            .await?;
        self.update_profile(&key, msg.push_name.as_deref(), &phone).await;
        self.store
            .set_ai_status(&key, Some(govconnect_core::types::AiStatus::Processing), None)
            .await?;
        self.store
            .set_pending_message_id(&key, Some(&msg.message_id))
            .await?;

        let saved_media = match media_task {
            Some(task) => task.await.unwrap_or_default(),
            None => None,
        };

        let event = InboundMessageEvent {
            village_id: village_id.clone(),
            wa_user_id: Some(phone.clone()),
            message: msg.text.clone(),
            message_id: msg.message_id.clone(),
            received_at: msg.timestamp,
            batched_message_ids: vec![msg.message_id.clone()],
            has_media,
            media_type: saved_media.as_ref().map(|m| m.media_type.clone()),
            media_url: saved_media.as_ref().and_then(|m| m.internal_url.clone()),
            media_public_url: saved_media.as_ref().and_then(|m| m.public_url.clone()),
            spam_guard: SpamGuardInfo {
                is_duplicate: false,
                supersede_previous: supersede,
                suppressed_message_ids: suppressed,
                context_messages: context,
            },
            is_retry: false,
        };

        Arc::clone(&self.forwarder).publish_inbound(key, event).await;
        Ok(IngestOutcome::Accepted {
            message_id: msg.message_id,
            forwarded: true,
        })
    }

    /// Map the provider slug to a tenant: session by village id, session by
    /// instance slug, then the configured fallback. An unresolvable webhook
    /// is still accepted but degrades to the isolated "unknown" tenant.
    async fn resolve_village(&self, instance_name: Option<&str>) -> String {
        if let Some(instance) = instance_name {
            match self.store.get_session(instance).await {
                Ok(Some(session)) => return session.village_id,
                Ok(None) => {}
                Err(e) => warn!(instance, error = %e, "session lookup failed"),
            }
            match self.store.get_session_by_instance(instance).await {
                Ok(Some(session)) => return session.village_id,
                Ok(None) => {}
                Err(e) => warn!(instance, error = %e, "instance lookup failed"),
            }
            warn!(instance, "webhook instance not mapped to any tenant");
        } else {
            warn!("webhook carried no instance name");
        }

        self.default_village
            .clone()
            .unwrap_or_else(|| "unknown".to_string())
    }

    async fn update_profile(&self, key: &ConversationKey, push_name: Option<&str>, phone: &str) {
        if let Some(name) = push_name {
            if let Err(e) = self
                .store
                .update_conversation_profile(key, Some(name), Some(phone))
                .await
            {
                warn!(conversation = %key, error = %e, "profile update failed");
            }
        }
    }
}
