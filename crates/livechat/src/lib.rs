//! Admin-facing conversation operations: listing, takeover lifecycle,
//! manual sends, read state, deletion, and AI retry. Takeover is the pivot:
//! while active, the AI is out of the loop for that conversation and the
//! admin speaks through the same provider session.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use govconnect_core::types::{
    Channel, Conversation, ConversationKey, Direction, MessageSource, NewMessage, StoredMessage,
    TakeoverSession,
};
use govconnect_forwarder::{EventPublisher, Forwarder};
use govconnect_guard::SpamGuard;
use govconnect_provider::ProviderClient;
use govconnect_store::{ConversationFilter, Store};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

/// Message page size when opening a conversation.
const DETAIL_MESSAGE_LIMIT: i64 = 50;

#[derive(Debug, Serialize)]
pub struct ConversationDetail {
    pub conversation: Conversation,
    /// Oldest first, capped at the detail page size.
    pub messages: Vec<StoredMessage>,
    pub takeover: Option<TakeoverSession>,
}

pub struct LiveChat {
    store: Store,
    provider: Arc<ProviderClient>,
    forwarder: Arc<Forwarder>,
    guard: Arc<SpamGuard>,
    publisher: Arc<dyn EventPublisher>,
}

impl LiveChat {
    pub fn new(
        store: Store,
        provider: Arc<ProviderClient>,
        forwarder: Arc<Forwarder>,
        guard: Arc<SpamGuard>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            store,
            provider,
            forwarder,
            guard,
            publisher,
        }
    }

    pub async fn conversations(
        &self,
        village_id: &str,
        filter: ConversationFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Conversation>> {
        self.store
            .list_conversations(village_id, filter, limit.clamp(1, 100), offset.max(0))
            .await
    }

    /// Single conversation with its recent history; opening it clears the
    /// unread counter.
    pub async fn conversation(&self, key: &ConversationKey) -> Result<Option<ConversationDetail>> {
        let Some(conversation) = self.store.get_conversation(key).await? else {
            return Ok(None);
        };
        let messages = self.store.recent_messages(key, DETAIL_MESSAGE_LIMIT).await?;
        let takeover = self.store.active_takeover(key).await?;
        self.store.mark_conversation_read(key).await?;

        Ok(Some(ConversationDetail {
            conversation,
            messages,
            takeover,
        }))
    }

    /// Start (or restart) a human takeover. Idempotent: an existing active
    /// row is ended first. The in-flight AI batch for the user is cancelled
    /// so no stale reply surfaces mid-handover.
    pub async fn start_takeover(
        &self,
        key: &ConversationKey,
        admin_id: &str,
        admin_name: Option<&str>,
        reason: Option<&str>,
    ) -> Result<TakeoverSession> {
        let takeover = self
            .store
            .start_takeover(key, admin_id, admin_name, reason)
            .await?;

        let cancelled = self
            .guard
            .cancel_in_flight(&key.village_id, &key.channel_identifier);
        if !cancelled.is_empty() {
            self.store.mark_pending_completed(&cancelled).await?;
        }
        self.store.set_ai_status(key, None, None).await?;

        info!(conversation = %key, admin_id, "takeover started");
        Ok(takeover)
    }

    pub async fn end_takeover(&self, key: &ConversationKey) -> Result<bool> {
        let ended = self.store.end_takeover(key).await?;
        if ended {
            info!(conversation = %key, "takeover ended");
        }
        Ok(ended)
    }

    /// Admin reply. WEBCHAT stores directly (delivery is pull-based);
    /// WHATSAPP sends upstream first and only stores on success so history
    /// matches what the user actually saw.
    pub async fn admin_send(
        &self,
        key: &ConversationKey,
        message: &str,
        admin_id: &str,
    ) -> Result<StoredMessage> {
        self.send_to_user(key, message, MessageSource::Admin, Some(admin_id))
            .await
    }

    /// Shared outbound path, also used by the internal send endpoint.
    pub async fn send_to_user(
        &self,
        key: &ConversationKey,
        message: &str,
        source: MessageSource,
        admin_id: Option<&str>,
    ) -> Result<StoredMessage> {
        let message_id = match key.channel {
            Channel::Whatsapp => {
                let account = self.store.get_channel_account(&key.village_id).await?;
                if account.is_some_and(|a| !a.enabled_wa) {
                    bail!("outbound WhatsApp is disabled for tenant {}", key.village_id);
                }

                match self
                    .provider
                    .send_text(&key.village_id, &key.channel_identifier, message)
                    .await
                {
                    Ok(sent) => {
                        self.store
                            .record_send(key, Some(message), "sent", None)
                            .await
                            .ok();
                        sent.message_id
                    }
                    Err(e) => {
                        // The attempt is audited, the message row is not
                        // created: history stays consistent with the user's
                        // view.
                        self.store
                            .record_send(key, Some(message), "failed", Some(&e.to_string()))
                            .await
                            .ok();
                        return Err(e).context("provider send failed");
                    }
                }
            }
            Channel::Webchat => format!("webchat-{}", Uuid::new_v4()),
        };

        let new_message = NewMessage {
            village_id: key.village_id.clone(),
            wa_user_id: Some(key.channel_identifier.clone()),
            channel: key.channel,
            channel_identifier: key.channel_identifier.clone(),
            message_id,
            message_text: message.to_string(),
            direction: Direction::Out,
            source,
            timestamp: Utc::now(),
        };
        self.store.insert_message(&new_message).await?;
        self.store
            .apply_message_to_conversation(
                key,
                new_message.wa_user_id.as_deref(),
                message,
                new_message.timestamp,
                Direction::Out,
            )
            .await?;

        if let Some(admin_id) = admin_id {
            info!(conversation = %key, admin_id, "admin message sent");
        }

        Ok(StoredMessage {
            id: Uuid::new_v4(),
            village_id: new_message.village_id,
            wa_user_id: new_message.wa_user_id,
            channel: new_message.channel,
            channel_identifier: new_message.channel_identifier,
            message_id: new_message.message_id,
            message_text: new_message.message_text,
            direction: new_message.direction,
            source: new_message.source,
            timestamp: new_message.timestamp,
        })
    }

    /// Reset the unread counter. Re-reads the settings row first so a
    /// dashboard toggle of auto-read is honored without a restart; when it
    /// is on, the read receipt is forwarded upstream best-effort.
    pub async fn mark_as_read(&self, key: &ConversationKey) -> Result<()> {
        let settings = self.store.reload_settings().await?;
        self.store.mark_conversation_read(key).await?;

        if settings.auto_read_messages && key.channel == Channel::Whatsapp {
            let inbound_ids: Vec<String> = self
                .store
                .recent_messages(key, DETAIL_MESSAGE_LIMIT)
                .await?
                .into_iter()
                .filter(|m| m.direction == Direction::In)
                .map(|m| m.message_id)
                .collect();
            if let Err(e) = self
                .provider
                .mark_read(&key.village_id, &key.channel_identifier, &inbound_ids)
                .await
            {
                warn!(conversation = %key, error = %e, "upstream mark-read failed");
            }
        }
        Ok(())
    }

    /// Remove the conversation and everything scoped to it, then tell the
    /// orchestrator (best-effort) to drop its per-user profile cache.
    pub async fn delete_conversation(&self, key: &ConversationKey) -> Result<()> {
        let removed = self.store.delete_conversation_messages(key).await?;
        self.store.delete_takeovers(key).await?;
        self.store.delete_conversation(key).await?;
        info!(conversation = %key, messages = removed, "conversation deleted");

        let notice = serde_json::json!({
            "village_id": key.village_id,
            "channel": key.channel.as_str(),
            "channel_identifier": key.channel_identifier,
        });
        if let Err(e) = self.publisher.publish_json("conversation.deleted", notice).await {
            warn!(conversation = %key, error = %e, "orchestrator cache notice failed");
        }
        Ok(())
    }

    /// Re-publish the latest pending message with the retry flag; used when
    /// the AI errored out and the admin asks for another attempt. `None`
    /// means the conversation has nothing queued to retry.
    pub async fn retry_ai(&self, key: &ConversationKey) -> Result<Option<String>> {
        let Some(pending) = self.store.latest_pending_for_conversation(key).await? else {
            return Ok(None);
        };

        Arc::clone(&self.forwarder).republish_pending(&pending).await?;
        info!(conversation = %key, message_id = %pending.message_id, "AI retry requested");
        Ok(Some(pending.message_id))
    }
}
