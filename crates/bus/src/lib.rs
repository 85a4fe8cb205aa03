//! Durable RabbitMQ coupling: one publishing channel per process, durable
//! topic exchange, durable consumer queues, and a supervisor task that
//! reconnects with jittered exponential backoff and re-establishes every
//! consumer after an outage.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::StreamExt;
use govconnect_core::events::EXCHANGE_NAME;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{error, info, warn};

const RECONNECT_BASE_DELAY_MS: u64 = 1_000;
const RECONNECT_MAX_DELAY_MS: u64 = 30_000;
const RECONNECT_JITTER: f64 = 0.3;

/// Persistent delivery mode per AMQP: survives broker restarts together
/// with the durable queue.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

#[derive(Debug, Error)]
pub enum BusError {
    /// No live channel; the caller schedules its own retry.
    #[error("message bus unavailable: {0}")]
    Unavailable(String),

    #[error("bus protocol error: {0}")]
    Protocol(#[from] lapin::Error),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Consumer callback. An `Err` nacks without requeue so a poison message
/// cannot loop; at-least-once delivery is paired with idempotent effects on
/// the handler side.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]) -> anyhow::Result<()>;
}

struct ConsumerSpec {
    queue: String,
    routing_key: String,
    handler: Arc<dyn EventHandler>,
}

struct BusState {
    connection: Option<Connection>,
    channel: Option<Channel>,
    consumers: Vec<Arc<ConsumerSpec>>,
}

pub struct BusClient {
    url: String,
    state: Mutex<BusState>,
    shutting_down: Arc<AtomicBool>,
    connection_lost: Arc<Notify>,
}

impl BusClient {
    pub fn new(url: &str) -> Arc<Self> {
        Arc::new(Self {
            url: url.to_string(),
            state: Mutex::new(BusState {
                connection: None,
                channel: None,
                consumers: Vec::new(),
            }),
            shutting_down: Arc::new(AtomicBool::new(false)),
            connection_lost: Arc::new(Notify::new()),
        })
    }

    /// Register a durable queue bound to `routing_key`. Must be called
    /// before `start`; consumers are (re-)established on every connect.
    pub async fn subscribe(&self, queue: &str, routing_key: &str, handler: Arc<dyn EventHandler>) {
        let mut state = self.state.lock().await;
        state.consumers.push(Arc::new(ConsumerSpec {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
            handler,
        }));
    }

    /// Connect and spawn the supervisor. The first connection failure is
    /// returned so startup can fail loudly; later outages reconnect forever.
    pub async fn start(self: Arc<Self>) -> Result<(), BusError> {
        self.connect_once().await?;

        let bus = Arc::clone(&self);
        tokio::spawn(async move {
            bus.supervise().await;
        });
        Ok(())
    }

    async fn supervise(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        loop {
            self.connection_lost.notified().await;
            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }

            loop {
                attempt = attempt.saturating_add(1);
                let delay = reconnect_delay(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, "bus reconnecting");
                tokio::time::sleep(delay).await;

                if self.shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                match self.connect_once().await {
                    Ok(()) => {
                        info!(attempt, "bus reconnected");
                        attempt = 0;
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, attempt, "bus reconnect failed");
                    }
                }
            }
        }
    }

    async fn connect_once(&self) -> Result<(), BusError> {
        let connection =
            Connection::connect(&self.url, ConnectionProperties::default()).await?;

        // Wake the supervisor when the broker drops us.
        let shutting_down = Arc::clone(&self.shutting_down);
        let connection_lost = Arc::clone(&self.connection_lost);
        connection.on_error(move |e| {
            if !shutting_down.load(Ordering::SeqCst) {
                warn!(error = %e, "bus connection lost");
            }
            connection_lost.notify_one();
        });

        let channel = connection.create_channel().await?;
        channel
            .exchange_declare(
                EXCHANGE_NAME,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let mut state = self.state.lock().await;
        for spec in state.consumers.iter().cloned() {
            self.establish_consumer(&channel, spec).await?;
        }
        state.channel = Some(channel);
        // The connection handle must outlive the channel; dropping it would
        // tear the socket down.
        state.connection = Some(connection);
        info!(exchange = EXCHANGE_NAME, "bus channel ready");
        Ok(())
    }

    async fn establish_consumer(
        &self,
        channel: &Channel,
        spec: Arc<ConsumerSpec>,
    ) -> Result<(), BusError> {
        channel
            .queue_declare(
                &spec.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                &spec.queue,
                EXCHANGE_NAME,
                &spec.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let mut consumer = channel
            .basic_consume(
                &spec.queue,
                &format!("channel-gateway-{}", spec.queue),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let queue = spec.queue.clone();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(d) => d,
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "consumer stream error");
                        break;
                    }
                };

                match spec.handler.handle(&delivery.data).await {
                    Ok(()) => {
                        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                            warn!(queue = %queue, error = %e, "ack failed");
                        }
                    }
                    Err(e) => {
                        // No requeue: a handler exception would loop forever
                        // on the same payload otherwise.
                        error!(queue = %queue, error = %e, "handler failed, dropping delivery");
                        if let Err(e) = delivery
                            .nack(BasicNackOptions {
                                requeue: false,
                                ..Default::default()
                            })
                            .await
                        {
                            warn!(queue = %queue, error = %e, "nack failed");
                        }
                    }
                }
            }
            info!(queue = %queue, "consumer loop ended");
        });
        Ok(())
    }

    /// Publish a persistent JSON event. During an outage this returns
    /// `Unavailable` immediately; retrying is the caller's job (the
    /// forwarder keys its retry timers per message).
    pub async fn publish<T: Serialize>(
        &self,
        routing_key: &str,
        event: &T,
    ) -> Result<(), BusError> {
        let payload = serde_json::to_vec(event)?;

        let channel = {
            let state = self.state.lock().await;
            match &state.channel {
                Some(ch) if ch.status().connected() => ch.clone(),
                _ => {
                    return Err(BusError::Unavailable(
                        "no live channel for publish".to_string(),
                    ))
                }
            }
        };

        channel
            .basic_publish(
                EXCHANGE_NAME,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
                    .with_content_type("application/json".into()),
            )
            .await?
            .await?;
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        let state = self.state.lock().await;
        state
            .channel
            .as_ref()
            .map(|ch| ch.status().connected())
            .unwrap_or(false)
    }

    /// Stop reconnecting and close the channel. Consumers drain with the
    /// closing channel; in-flight deliveries finish or are redelivered.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.connection_lost.notify_one();

        let mut state = self.state.lock().await;
        if let Some(channel) = state.channel.take() {
            if let Err(e) = channel.close(200, "shutdown").await {
                warn!(error = %e, "bus channel close failed");
            }
        }
        if let Some(connection) = state.connection.take() {
            if let Err(e) = connection.close(200, "shutdown").await {
                warn!(error = %e, "bus connection close failed");
            }
        }
        info!("bus client shut down");
    }
}

/// `min(base · 2^n, max) · (1 + rand·jitter)`, jitter sourced from clock
/// nanos so no RNG crate is pulled in for a backoff smear.
fn reconnect_delay(attempt: u32) -> Duration {
    let exp = RECONNECT_BASE_DELAY_MS.saturating_mul(2u64.saturating_pow(attempt.min(16) - 1));
    let capped = exp.min(RECONNECT_MAX_DELAY_MS);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    let jitter = (nanos % 1000) as f64 / 1000.0 * RECONNECT_JITTER;
    Duration::from_millis((capped as f64 * (1.0 + jitter)) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_delay_grows_and_caps() {
        let first = reconnect_delay(1).as_millis() as u64;
        assert!((1_000..=1_300).contains(&first), "got {first}");

        let sixth = reconnect_delay(6).as_millis() as u64;
        assert!((30_000..=39_000).contains(&sixth), "got {sixth}");

        // Deep attempt counts must not overflow.
        let deep = reconnect_delay(64).as_millis() as u64;
        assert!(deep <= 39_000);
    }
}
