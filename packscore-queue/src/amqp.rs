// Copyright (C) 2024 Quickwit, Inc.
//
// Quickwit is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@quickwit.io.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use packscore_common::KillSwitch;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, warn};

use crate::envelope::{decide_retry, Envelope, RetryStep, MAX_PRIORITY};
use crate::error::{QueueError, QueueErrorKind, QueueResult};
use crate::{ConsumeOptions, DeadLetterHandler, Enqueuer, MessageHandler};

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(32);
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Reconnection backoff. Bounded so a long broker outage does not push the
/// next attempt hours away.
// attempt, delay
// 1   2s
// 2   4s
// 3   8s
// >=5 32s
fn reconnect_delay(attempt: u32) -> Duration {
    let max_power = attempt.min(31);
    Duration::from_secs(2u64.pow(max_power)).min(MAX_RECONNECT_DELAY)
}

/// Protocol-level failures mean the broker refused us (connection forced,
/// blocked, consumer cancelled): the instance is dead. Everything else is a
/// connectivity blip the supervisor can reconnect from.
fn classify_lapin_error(error: &lapin::Error) -> QueueErrorKind {
    match error {
        lapin::Error::ProtocolError(_) => QueueErrorKind::Fatal,
        _ => QueueErrorKind::Transient,
    }
}

fn lapin_error(error: lapin::Error) -> QueueError {
    classify_lapin_error(&error).with_error(error)
}

async fn publish_confirmed(
    channel: &Channel,
    queue_name: &str,
    envelope: &Envelope,
) -> QueueResult<()> {
    let payload = serde_json::to_vec(envelope).expect("an envelope is always serializable");
    let confirm = channel
        .basic_publish(
            "",
            queue_name,
            BasicPublishOptions::default(),
            &payload,
            BasicProperties::default()
                .with_priority(envelope.priority)
                .with_delivery_mode(PERSISTENT_DELIVERY_MODE),
        )
        .await
        .map_err(lapin_error)?
        .await
        .map_err(lapin_error)?;
    if let Confirmation::Nack(_) = confirm {
        return Err(QueueErrorKind::Transient
            .with_error(anyhow::anyhow!("broker nacked publish of `{}`", envelope.name)));
    }
    Ok(())
}

async fn process_delivery(
    channel: Channel,
    queue_name: String,
    delivery: Delivery,
    handler: Arc<dyn MessageHandler>,
    dead_letter_handler: Arc<dyn DeadLetterHandler>,
    max_retries: u32,
) {
    let envelope: Envelope = match serde_json::from_slice(&delivery.data) {
        Ok(envelope) => envelope,
        Err(parse_error) => {
            // A poison payload would be redelivered forever: drop it.
            error!(err = %parse_error, "failed to parse envelope, discarding delivery");
            if let Err(ack_error) = delivery.ack(BasicAckOptions::default()).await {
                warn!(err = %ack_error, "failed to ack poison delivery");
            }
            return;
        }
    };
    debug!(name = %envelope.name, retry_count = envelope.retry_count, "processing delivery");
    match handler.handle(&envelope).await {
        Ok(()) => {
            if let Err(ack_error) = delivery.ack(BasicAckOptions::default()).await {
                warn!(err = %ack_error, name = %envelope.name, "failed to ack delivery");
            }
        }
        Err(handler_error) => match decide_retry(&envelope, max_retries) {
            RetryStep::Republish(requeued) => {
                warn!(
                    err = %handler_error,
                    name = %envelope.name,
                    retry_count = requeued.retry_count,
                    "analysis failed, requeueing at the tail"
                );
                match publish_confirmed(&channel, &queue_name, &requeued).await {
                    Ok(()) => {
                        if let Err(ack_error) = delivery.ack(BasicAckOptions::default()).await {
                            warn!(err = %ack_error, name = %envelope.name, "failed to ack after republish");
                        }
                    }
                    Err(publish_error) => {
                        // Hand the original back to the broker rather than
                        // losing the message.
                        error!(err = %publish_error, name = %envelope.name, "republish failed, requeueing original");
                        let nack_options = BasicNackOptions {
                            requeue: true,
                            ..Default::default()
                        };
                        if let Err(nack_error) = delivery.nack(nack_options).await {
                            warn!(err = %nack_error, name = %envelope.name, "failed to nack delivery");
                        }
                    }
                }
            }
            RetryStep::DeadLetter => {
                error!(
                    err = %handler_error,
                    name = %envelope.name,
                    retry_count = envelope.retry_count,
                    "retries exceeded, dead-lettering"
                );
                dead_letter_handler
                    .on_retries_exceeded(&envelope, &handler_error)
                    .await;
                let nack_options = BasicNackOptions {
                    requeue: false,
                    ..Default::default()
                };
                if let Err(nack_error) = delivery.nack(nack_options).await {
                    warn!(err = %nack_error, name = %envelope.name, "failed to dead-letter delivery");
                }
            }
        },
    }
}

/// AMQP implementation of the work queue: durable priority queue, publisher
/// confirms, prefetch-bounded consumer, supervised reconnection.
pub struct AmqpWorkQueue {
    uri: String,
    queue_name: String,
    kill_switch: KillSwitch,
    publish_channel: Mutex<Option<Channel>>,
}

impl AmqpWorkQueue {
    pub fn new<S: Into<String>>(uri: S, queue_name: S, kill_switch: KillSwitch) -> Self {
        Self {
            uri: uri.into(),
            queue_name: queue_name.into(),
            kill_switch,
            publish_channel: Mutex::new(None),
        }
    }

    /// Readiness probe: opens (or reuses) a channel.
    pub async fn is_up(&self) -> bool {
        self.publisher_channel().await.is_ok()
    }

    async fn open_channel(&self) -> QueueResult<Channel> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(lapin_error)?;
        let channel = connection.create_channel().await.map_err(lapin_error)?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(lapin_error)?;
        let mut queue_arguments = FieldTable::default();
        queue_arguments.insert(
            "x-max-priority".into(),
            AMQPValue::ShortShortUInt(MAX_PRIORITY),
        );
        channel
            .queue_declare(
                &self.queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                queue_arguments,
            )
            .await
            .map_err(lapin_error)?;
        Ok(channel)
    }

    async fn publisher_channel(&self) -> QueueResult<Channel> {
        let mut publish_channel = self.publish_channel.lock().await;
        if let Some(channel) = publish_channel.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
            *publish_channel = None;
        }
        let channel = self.open_channel().await?;
        *publish_channel = Some(channel.clone());
        Ok(channel)
    }

    /// Registers the consumer and processes deliveries until the kill switch
    /// fires, the connection drops (transient), or the broker turns us away
    /// (fatal).
    async fn run_consumer_once(
        &self,
        handler: &Arc<dyn MessageHandler>,
        dead_letter_handler: &Arc<dyn DeadLetterHandler>,
        options: &ConsumeOptions,
    ) -> QueueResult<()> {
        let channel = self.open_channel().await?;
        channel
            .basic_qos(options.concurrency as u16, BasicQosOptions::default())
            .await
            .map_err(lapin_error)?;
        let mut consumer = channel
            .basic_consume(
                &self.queue_name,
                "packscore-analyzer",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(lapin_error)?;
        info!(queue = %self.queue_name, concurrency = options.concurrency, "consumer registered");

        let handler_permits = Arc::new(Semaphore::new(options.concurrency));
        loop {
            let delivery = tokio::select! {
                _ = self.kill_switch.killed() => {
                    return Ok(());
                }
                delivery_opt = consumer.next() => {
                    match delivery_opt {
                        Some(Ok(delivery)) => delivery,
                        Some(Err(consume_error)) => {
                            return Err(lapin_error(consume_error)
                                .add_context("consumer stream failed"));
                        }
                        // The broker closed the consumer without us asking.
                        None => {
                            return Err(QueueErrorKind::Fatal.with_error(anyhow::anyhow!(
                                "broker cancelled the consumer on `{}`",
                                self.queue_name
                            )));
                        }
                    }
                }
            };
            let permit = handler_permits
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore is never closed");
            tokio::spawn({
                let channel = channel.clone();
                let queue_name = self.queue_name.clone();
                let handler = handler.clone();
                let dead_letter_handler = dead_letter_handler.clone();
                let max_retries = options.max_retries;
                async move {
                    let _permit = permit;
                    process_delivery(
                        channel,
                        queue_name,
                        delivery,
                        handler,
                        dead_letter_handler,
                        max_retries,
                    )
                    .await;
                }
            });
        }
    }

    /// Consumes until the kill switch fires or a fatal broker condition
    /// destroys the instance. Transient failures reconnect with bounded
    /// backoff.
    pub async fn consume(
        &self,
        handler: Arc<dyn MessageHandler>,
        dead_letter_handler: Arc<dyn DeadLetterHandler>,
        options: ConsumeOptions,
    ) -> QueueResult<()> {
        let mut reconnect_attempt = 0u32;
        loop {
            if self.kill_switch.is_dead() {
                return Ok(());
            }
            match self
                .run_consumer_once(&handler, &dead_letter_handler, &options)
                .await
            {
                Ok(()) => return Ok(()),
                Err(consume_error) if consume_error.is_fatal() => {
                    return Err(consume_error);
                }
                Err(consume_error) => {
                    reconnect_attempt += 1;
                    if let Some(on_reconnect) = &options.on_reconnect {
                        on_reconnect(reconnect_attempt);
                    }
                    let delay = reconnect_delay(reconnect_attempt);
                    warn!(
                        err = %consume_error,
                        attempt = reconnect_attempt,
                        delay_secs = delay.as_secs(),
                        "broker connection lost, reconnecting"
                    );
                    tokio::select! {
                        _ = self.kill_switch.killed() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Enqueuer for AmqpWorkQueue {
    async fn push(&self, name: &str, priority: u8) -> QueueResult<()> {
        let envelope = Envelope::new(name, priority);
        let channel = self.publisher_channel().await?;
        match publish_confirmed(&channel, &self.queue_name, &envelope).await {
            Ok(()) => Ok(()),
            Err(publish_error) => {
                // Drop the cached channel so the next push reconnects.
                *self.publish_channel.lock().await = None;
                Err(publish_error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delay_is_bounded() {
        assert_eq!(reconnect_delay(1), Duration::from_secs(2));
        assert_eq!(reconnect_delay(2), Duration::from_secs(4));
        assert_eq!(reconnect_delay(4), Duration::from_secs(16));
        assert_eq!(reconnect_delay(5), MAX_RECONNECT_DELAY);
        assert_eq!(reconnect_delay(1_000), MAX_RECONNECT_DELAY);
    }
}
