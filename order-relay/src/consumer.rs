//! RabbitMQ consumer for completed orders.
//!
//! This module binds the orders queue to the headers exchange, consumes
//! deliveries one at a time and marks each consumed order as fulfilled in the
//! store. Deliveries are acknowledged manually, after the status update has
//! been applied.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::queue::{declare_binding, ConsumerBroker, ConsumerChannel, RoutingHeaders};
use crate::status::{OrderStatusUpdater, StatusUpdate};

/// Exchange, queue and routing the consumer binds with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub exchange: String,
    pub queue: String,
    pub headers: RoutingHeaders,
    pub consumer_tag: String,
    /// Status written for every consumed order
    pub status: String,
}

impl ConsumerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            exchange: config.consume_exchange.clone(),
            queue: config.queue.clone(),
            headers: config.routing_headers(),
            consumer_tag: config.consumer_tag.clone(),
            status: config.fulfilled_status.clone(),
        }
    }
}

/// What to tell the broker about a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryAction {
    Ack,
    Reject { requeue: bool },
}

fn body_preview(body: &[u8]) -> String {
    String::from_utf8_lossy(&body[..body.len().min(500)]).into_owned()
}

/// Handle one delivery body.
///
/// - body that is not a JSON object, or a non-string `number`: rejected without requeue
/// - missing, null or empty `number`: acknowledged, nothing to update
/// - updated or unknown order: acknowledged
/// - store failure: rejected and requeued
pub async fn handle_delivery(
    updater: &dyn OrderStatusUpdater,
    status: &str,
    body: &[u8],
) -> DeliveryAction {
    let message: Value = match serde_json::from_slice(body) {
        Ok(message) => message,
        Err(e) => {
            error!(
                error = %e,
                body_preview = %body_preview(body),
                "order_message_parse_failed"
            );
            return DeliveryAction::Reject { requeue: false };
        }
    };

    let Value::Object(fields) = message else {
        error!(body_preview = %body_preview(body), "order_message_not_object");
        return DeliveryAction::Reject { requeue: false };
    };

    let order_number = match fields.get("number") {
        Some(Value::String(number)) if !number.is_empty() => number.as_str(),
        None | Some(Value::Null) | Some(Value::String(_)) => {
            warn!("order_message_missing_number");
            return DeliveryAction::Ack;
        }
        Some(other) => {
            error!(number = %other, "order_message_invalid_number");
            return DeliveryAction::Reject { requeue: false };
        }
    };

    match updater.update_order_status(order_number, status).await {
        Ok(StatusUpdate::Updated) => DeliveryAction::Ack,
        Ok(StatusUpdate::NotFound) => {
            warn!(order_number = order_number, "order_status_target_missing");
            DeliveryAction::Ack
        }
        Err(e) => {
            error!(
                order_number = order_number,
                error = %e,
                "order_status_update_failed"
            );
            DeliveryAction::Reject { requeue: true }
        }
    }
}

/// Long-lived consumer of the orders queue.
pub struct Consumer {
    broker: Arc<dyn ConsumerBroker>,
    settings: ConsumerSettings,
    updater: Arc<dyn OrderStatusUpdater>,
}

impl Consumer {
    pub fn new(
        broker: Arc<dyn ConsumerBroker>,
        settings: ConsumerSettings,
        updater: Arc<dyn OrderStatusUpdater>,
    ) -> Self {
        Self {
            broker,
            settings,
            updater,
        }
    }

    /// Consume orders until `shutdown` completes or the broker cancels the
    /// subscription. The consumer's channel is closed on every exit path.
    pub async fn retrieve_orders(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let channel = self
            .broker
            .open_consumer_channel()
            .await
            .context("Failed to create channel")?;

        info!("rabbitmq_channel_created");

        let result = self.consume(channel.as_ref(), shutdown).await;

        if let Err(e) = channel.close().await {
            warn!(error = %e, "rabbitmq_channel_close_error");
        }

        result
    }

    async fn consume(
        &self,
        channel: &dyn ConsumerChannel,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let settings = &self.settings;

        // One unacknowledged delivery at a time
        channel
            .set_prefetch(1)
            .await
            .context("Failed to set QoS")?;

        declare_binding(channel, &settings.exchange, &settings.queue, &settings.headers)
            .await
            .context("Failed to bind queue")?;

        info!(
            exchange = %settings.exchange,
            queue = %settings.queue,
            object_type = %settings.headers.object_type,
            routing_key = %settings.headers.routing_key,
            "rabbitmq_queue_bound"
        );

        let mut deliveries = channel
            .subscribe(&settings.queue, &settings.consumer_tag)
            .await
            .context("Failed to start consumer")?;

        info!(queue = %settings.queue, "rabbitmq_consumer_started");

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("consumer_stopping");
                    break;
                }
                delivery = deliveries.next() => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            let delivery_tag = delivery.delivery_tag;

                            info!(
                                queue = %settings.queue,
                                delivery_tag = delivery_tag,
                                redelivered = delivery.redelivered,
                                body_length = delivery.body.len(),
                                "rabbitmq_order_received"
                            );

                            let action =
                                handle_delivery(self.updater.as_ref(), &settings.status, &delivery.body)
                                    .await;

                            let settled = match action {
                                DeliveryAction::Ack => channel.ack(delivery_tag).await,
                                DeliveryAction::Reject { requeue } => {
                                    channel.nack(delivery_tag, requeue).await
                                }
                            };

                            if let Err(e) = settled {
                                error!(
                                    delivery_tag = delivery_tag,
                                    action = ?action,
                                    error = %e,
                                    "rabbitmq_settle_failed"
                                );
                            }
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "rabbitmq_delivery_error");
                        }
                        None => {
                            warn!("rabbitmq_consumer_closed");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
