use crate::task::Task;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use optiq_core::config::RabbitMqConfig;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const MAX_CONNECT_ATTEMPTS: u32 = 5;
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// One unacknowledged message per channel. Together with the worker's
/// semaphore this bounds resident image memory.
const PREFETCH_COUNT: u16 = 1;

const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Errors surfaced by the queue client.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to connect to RabbitMQ after {attempts} attempts: {source}")]
    Connect { attempts: u32, source: lapin::Error },

    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("failed to serialize task: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("broker rejected publish")]
    Nacked,

    #[error("consumer channel closed")]
    ChannelClosed,
}

/// Durable publish / reliable consume client over one AMQP channel.
///
/// The topology (direct durable exchange, durable queue, binding) is declared
/// idempotently on connect, so producers and consumers can start in any
/// order.
pub struct QueueClient {
    // Held so the connection outlives the channel.
    _connection: Connection,
    channel: Channel,
    config: RabbitMqConfig,
}

impl QueueClient {
    /// Connect with exponential backoff and declare the topology.
    pub async fn connect(config: &RabbitMqConfig) -> Result<Self, QueueError> {
        let connection = connect_with_backoff(config).await?;
        let channel = connection.create_channel().await?;

        channel
            .exchange_declare(
                &config.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        channel
            .queue_declare(
                &config.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        channel
            .queue_bind(
                &config.queue,
                &config.exchange,
                &config.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
            .await?;

        // Publisher confirms make a broker NACK visible to publish() callers.
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        info!(
            exchange = %config.exchange,
            queue = %config.queue,
            routing_key = %config.routing_key,
            "RabbitMQ client initialized"
        );

        Ok(Self {
            _connection: connection,
            channel,
            config: config.clone(),
        })
    }

    /// Publish a task with persistent delivery. Returns an error when the
    /// broker refuses the message.
    #[instrument(skip(self, task), fields(task_id = %task.id))]
    pub async fn publish(&self, task: &Task) -> Result<(), QueueError> {
        let body = serde_json::to_vec(task)?;

        let confirmation = self
            .channel
            .basic_publish(
                &self.config.exchange,
                &self.config.routing_key,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(DELIVERY_MODE_PERSISTENT),
            )
            .await?
            .await?;

        if let Confirmation::Nack(_) = confirmation {
            return Err(QueueError::Nacked);
        }

        debug!(task_id = %task.id, "Task published");
        Ok(())
    }

    /// Consume tasks until the channel closes or `shutdown` is cancelled.
    ///
    /// Per delivery: an undecodable payload is acked and dropped (it can
    /// never succeed); otherwise the handler runs to completion and the
    /// message is acked on `Ok` or nacked with requeue on `Err`. A handler
    /// already running when shutdown fires is never cancelled mid-flight.
    ///
    /// Returns `Ok` on a requested shutdown and `ChannelClosed` when the
    /// delivery stream ends unexpectedly; the caller owns the restart policy.
    pub async fn consume<F, Fut, E>(
        &self,
        shutdown: CancellationToken,
        handler: F,
    ) -> Result<(), QueueError>
    where
        F: Fn(Task) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::fmt::Display,
    {
        let mut consumer = self
            .channel
            .basic_consume(
                &self.config.queue,
                &self.config.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(
            queue = %self.config.queue,
            consumer_tag = %self.config.consumer_tag,
            "Started consuming messages"
        );

        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Stopping consumer: shutdown requested");
                    return Ok(());
                }
                next = consumer.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => {
                        error!(error = %e, "Consumer delivery error");
                        return Err(QueueError::Broker(e));
                    }
                    None => {
                        warn!("RabbitMQ channel closed");
                        return Err(QueueError::ChannelClosed);
                    }
                },
            };

            let task: Task = match serde_json::from_slice(&delivery.data) {
                Ok(task) => task,
                Err(e) => {
                    error!(error = %e, "Dropping undecodable task payload");
                    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                        warn!(error = %e, "Failed to ack dropped message");
                    }
                    continue;
                }
            };

            debug!(task_id = %task.id, "Received task");

            match handler(task).await {
                Ok(()) => {
                    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                        warn!(error = %e, "Failed to ack message");
                    }
                }
                Err(e) => {
                    error!(error = %e, "Task handler failed, requeueing");
                    let options = BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    };
                    if let Err(e) = delivery.nack(options).await {
                        warn!(error = %e, "Failed to nack message");
                    }
                }
            }
        }
    }
}

async fn connect_with_backoff(config: &RabbitMqConfig) -> Result<Connection, QueueError> {
    let url = config.amqp_url();
    let mut delay = INITIAL_RETRY_DELAY;

    for attempt in 1..=MAX_CONNECT_ATTEMPTS {
        info!(
            host = %config.host,
            port = config.port,
            attempt,
            max_attempts = MAX_CONNECT_ATTEMPTS,
            "Connecting to RabbitMQ"
        );

        match Connection::connect(&url, ConnectionProperties::default()).await {
            Ok(connection) => {
                info!("Connected to RabbitMQ");
                return Ok(connection);
            }
            Err(source) if attempt == MAX_CONNECT_ATTEMPTS => {
                return Err(QueueError::Connect {
                    attempts: MAX_CONNECT_ATTEMPTS,
                    source,
                });
            }
            Err(e) => {
                warn!(error = %e, retry_in = ?delay, "Failed to connect to RabbitMQ, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }

    unreachable!("connect loop returns on the last attempt")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let mut delay = INITIAL_RETRY_DELAY;
        let mut total = Duration::ZERO;
        for _ in 1..MAX_CONNECT_ATTEMPTS {
            total += delay;
            delay *= 2;
        }
        // 1 + 2 + 4 + 8 seconds of waiting across five attempts.
        assert_eq!(total, Duration::from_secs(15));
        assert_eq!(delay, Duration::from_secs(16));
    }

    #[test]
    fn prefetch_is_one_per_channel() {
        assert_eq!(PREFETCH_COUNT, 1);
        assert_eq!(DELIVERY_MODE_PERSISTENT, 2);
    }
}
