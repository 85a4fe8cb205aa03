//! Bus-facing packaging of the pipeline: publishes approved inbound
//! messages to the AI with keyed retry, and consumes the reply / error /
//! status queues, dispatching replies outbound through the provider.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use govconnect_bus::{BusClient, EventHandler};
use govconnect_core::config::AppConfig;
use govconnect_core::events::{
    AiErrorEvent, AiReplyEvent, InboundMessageEvent, MessageStatusEvent, SpamGuardInfo,
    QUEUE_AI_ERROR, QUEUE_AI_REPLY, QUEUE_MESSAGE_STATUS, ROUTE_AI_ERROR, ROUTE_AI_REPLY,
    ROUTE_MESSAGE_RECEIVED, ROUTE_MESSAGE_STATUS,
};
use govconnect_core::types::{
    AiStatus, Channel, ConversationKey, Direction, PendingMessage, PendingStatus,
};
use govconnect_guard::SpamGuard;
use govconnect_provider::ProviderClient;
use govconnect_store::Store;
use tracing::{error, info, warn};

mod retry;
mod text;

pub use retry::RetryScheduler;
pub use text::normalize_reply_text;

/// Delay before the guidance bubble follows the main reply.
const GUIDANCE_DELAY: Duration = Duration::from_millis(500);

/// Publishing seam so tests can swap the bus for a recording double.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_json(&self, routing_key: &str, payload: serde_json::Value) -> Result<()>;
}

#[async_trait]
impl EventPublisher for BusClient {
    async fn publish_json(&self, routing_key: &str, payload: serde_json::Value) -> Result<()> {
        self.publish(routing_key, &payload).await?;
        Ok(())
    }
}

pub struct Forwarder {
    store: Store,
    provider: Arc<ProviderClient>,
    guard: Arc<SpamGuard>,
    publisher: Arc<dyn EventPublisher>,
    retries: RetryScheduler,
}

impl Forwarder {
    pub fn new(
        store: Store,
        provider: Arc<ProviderClient>,
        guard: Arc<SpamGuard>,
        publisher: Arc<dyn EventPublisher>,
        config: &AppConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            provider,
            guard,
            publisher,
            retries: RetryScheduler::new(Duration::from_millis(
                config.message_batch_publish_retry_delay_ms,
            )),
        })
    }

    /// Attach the three consumer queues to the bus. Must run before
    /// `BusClient::start` so the first connect already binds them.
    pub async fn register_consumers(self: Arc<Self>, bus: &Arc<BusClient>) {
        bus.subscribe(
            QUEUE_AI_REPLY,
            ROUTE_AI_REPLY,
            Arc::new(ReplyConsumer(Arc::clone(&self))),
        )
        .await;
        bus.subscribe(
            QUEUE_AI_ERROR,
            ROUTE_AI_ERROR,
            Arc::new(ErrorConsumer(Arc::clone(&self))),
        )
        .await;
        bus.subscribe(
            QUEUE_MESSAGE_STATUS,
            ROUTE_MESSAGE_STATUS,
            Arc::new(StatusConsumer(Arc::clone(&self))),
        )
        .await;
    }

    /// Abort pending publish-retry timers; shutdown path.
    pub fn flush_retries(&self) {
        self.retries.flush();
    }

    // ── Publish path ────────────────────────────────────────────────────

    /// Publish one approved inbound event. A takeover that began after
    /// ingest (or before a retry timer fired) still suppresses the publish.
    /// Failures schedule a keyed retry; the key collapses repeated failures
    /// of the same message into one timer.
    pub async fn publish_inbound(self: Arc<Self>, key: ConversationKey, event: InboundMessageEvent) {
        if !self.try_publish(&key, &event).await {
            self.schedule_republish(key, event);
        }
    }

    /// One publish attempt; returns whether the event is settled (published
    /// or permanently suppressed).
    async fn try_publish(&self, key: &ConversationKey, event: &InboundMessageEvent) -> bool {
        match self.store.get_conversation(key).await {
            Ok(Some(convo)) if convo.is_takeover => {
                info!(conversation = %key, "takeover active, inbound event suppressed");
                return true;
            }
            Err(e) => {
                warn!(conversation = %key, error = %e, "takeover check failed, publishing anyway");
            }
            _ => {}
        }

        let payload = match serde_json::to_value(event) {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "inbound event serialization failed");
                return true;
            }
        };

        match self.publisher.publish_json(ROUTE_MESSAGE_RECEIVED, payload).await {
            Ok(()) => {
                if let Err(e) = self.store.mark_pending_processing(&event.message_id).await {
                    warn!(message_id = %event.message_id, error = %e, "pending transition failed");
                }
                info!(
                    conversation = %key,
                    message_id = %event.message_id,
                    supersede = event.spam_guard.supersede_previous,
                    "inbound event published"
                );
                true
            }
            Err(e) => {
                warn!(
                    conversation = %key,
                    message_id = %event.message_id,
                    error = %e,
                    "publish failed, scheduling retry"
                );
                false
            }
        }
    }

    fn schedule_republish(self: Arc<Self>, key: ConversationKey, event: InboundMessageEvent) {
        let retry_key = format!(
            "{}:{}:{}",
            event.village_id,
            event.wa_user_id.as_deref().unwrap_or("-"),
            event.message_id
        );
        let forwarder = Arc::clone(&self);
        self.retries.schedule(&retry_key, move || async move {
            if !forwarder.try_publish(&key, &event).await {
                forwarder.schedule_republish(key, event);
            }
        });
    }

    /// Re-publish the latest pending message of a conversation with
    /// `is_retry` set; the admin "retry AI" entry point.
    pub async fn republish_pending(self: Arc<Self>, pending: &PendingMessage) -> Result<()> {
        let key = pending.conversation_key();
        self.store
            .set_ai_status(&key, Some(AiStatus::Processing), None)
            .await?;

        let event = InboundMessageEvent {
            village_id: pending.village_id.clone(),
            wa_user_id: pending.wa_user_id.clone(),
            message: pending.message_text.clone(),
            message_id: pending.message_id.clone(),
            received_at: pending.created_at,
            batched_message_ids: vec![pending.message_id.clone()],
            has_media: false,
            media_type: None,
            media_url: None,
            media_public_url: None,
            spam_guard: SpamGuardInfo {
                context_messages: vec![govconnect_core::events::ContextMessage {
                    message_id: pending.message_id.clone(),
                    text: pending.message_text.clone(),
                }],
                ..SpamGuardInfo::default()
            },
            is_retry: true,
        };
        self.publish_inbound(key, event).await;
        Ok(())
    }

    // ── Reply path ──────────────────────────────────────────────────────

    /// Dispatch an AI reply to the user. Send failures are logged and the
    /// delivery is acked regardless; requeueing a failing send would only
    /// hammer the provider with the same payload.
    pub async fn handle_reply(&self, reply: AiReplyEvent) -> Result<()> {
        let identifier = reply
            .target_identifier()
            .context("ai.reply without wa_user_id or channel_identifier")?
            .to_string();
        let channel = reply.channel.unwrap_or(Channel::Whatsapp);
        let key = ConversationKey::new(&reply.village_id, channel, &identifier);

        let conversation = self.store.get_conversation(&key).await?;
        if conversation.as_ref().is_some_and(|c| c.is_takeover) {
            info!(conversation = %key, "takeover active, AI reply suppressed");
            return Ok(());
        }

        if self.reply_is_superseded(&reply).await? {
            info!(conversation = %key, "reply superseded by a newer bubble, dropped");
            return Ok(());
        }

        let reply_text = normalize_reply_text(&reply.reply_text);

        if channel == Channel::Whatsapp {
            let account = self.store.get_channel_account(&reply.village_id).await?;
            if account.is_some_and(|a| !a.enabled_wa) {
                info!(conversation = %key, "outbound WhatsApp disabled for tenant, reply dropped");
                return Ok(());
            }

            match self.provider.send_text(&reply.village_id, &identifier, &reply_text).await {
                Ok(sent) => {
                    self.store
                        .record_send(&key, Some(&reply_text), "sent", None)
                        .await
                        .ok();
                    info!(conversation = %key, provider_id = %sent.message_id, "AI reply delivered");

                    if let Some(guidance) = reply.guidance_text.as_deref() {
                        tokio::time::sleep(GUIDANCE_DELAY).await;
                        let guidance = normalize_reply_text(guidance);
                        if let Err(e) = self
                            .provider
                            .send_text(&reply.village_id, &identifier, &guidance)
                            .await
                        {
                            warn!(conversation = %key, error = %e, "guidance bubble failed");
                        }
                    }
                }
                Err(e) => {
                    error!(conversation = %key, error = %e, "AI reply send failed");
                    self.store
                        .record_send(&key, Some(&reply_text), "failed", Some(&e.to_string()))
                        .await
                        .ok();
                    return Ok(());
                }
            }
        }

        self.store
            .apply_message_to_conversation(
                &key,
                reply.wa_user_id.as_deref(),
                &reply_text,
                Utc::now(),
                Direction::Out,
            )
            .await?;
        self.store.set_ai_status(&key, None, None).await?;
        self.store.set_pending_message_id(&key, None).await?;
        self.store.delete_pending(&reply.batched_message_ids).await?;

        self.guard.clear_in_flight(&reply.village_id, &identifier);
        Ok(())
    }

    /// A batch whose pending rows were already parked `completed` was
    /// superseded (or cancelled by a takeover); its reply must not reach
    /// the user.
    async fn reply_is_superseded(&self, reply: &AiReplyEvent) -> Result<bool> {
        for message_id in &reply.batched_message_ids {
            if let Some(pending) = self.store.get_pending(message_id).await? {
                if pending.status == PendingStatus::Completed {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    // ── Error path ──────────────────────────────────────────────────────

    pub async fn handle_ai_error(&self, event: AiErrorEvent) -> Result<()> {
        let identifier = event
            .target_identifier()
            .context("ai.error without wa_user_id or channel_identifier")?
            .to_string();
        let channel = event.channel.unwrap_or(Channel::Whatsapp);
        let key = ConversationKey::new(&event.village_id, channel, &identifier);

        let preview: String = event.error_message.chars().take(200).collect();
        self.store
            .set_ai_status(&key, Some(AiStatus::Error), Some(&preview))
            .await?;
        self.store
            .mark_pending_failed(&event.batched_message_ids, &event.error_message)
            .await?;

        warn!(conversation = %key, "AI error recorded on conversation");
        Ok(())
    }

    // ── Status path ─────────────────────────────────────────────────────

    pub async fn handle_status(&self, event: MessageStatusEvent) -> Result<()> {
        match event.status {
            PendingStatus::Completed => {
                self.store.delete_pending(&[event.message_id]).await?;
            }
            PendingStatus::Failed => {
                let reason = event.error_msg.as_deref().unwrap_or("reported failed");
                self.store
                    .mark_pending_failed(&[event.message_id], reason)
                    .await?;
            }
            PendingStatus::Processing | PendingStatus::Pending => {
                self.store.mark_pending_processing(&event.message_id).await?;
            }
        }
        Ok(())
    }
}

struct ReplyConsumer(Arc<Forwarder>);

#[async_trait]
impl EventHandler for ReplyConsumer {
    async fn handle(&self, payload: &[u8]) -> Result<()> {
        let event: AiReplyEvent =
            serde_json::from_slice(payload).context("invalid ai.reply payload")?;
        self.0.handle_reply(event).await
    }
}

struct ErrorConsumer(Arc<Forwarder>);

#[async_trait]
impl EventHandler for ErrorConsumer {
    async fn handle(&self, payload: &[u8]) -> Result<()> {
        let event: AiErrorEvent =
            serde_json::from_slice(payload).context("invalid ai.error payload")?;
        self.0.handle_ai_error(event).await
    }
}

struct StatusConsumer(Arc<Forwarder>);

#[async_trait]
impl EventHandler for StatusConsumer {
    async fn handle(&self, payload: &[u8]) -> Result<()> {
        let event: MessageStatusEvent =
            serde_json::from_slice(payload).context("invalid message.status payload")?;
        self.0.handle_status(event).await
    }
}
