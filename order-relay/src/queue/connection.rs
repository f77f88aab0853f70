//! lapin-backed broker connection.
//!
//! One [`AmqpConnection`] is created at startup and cloned into the publisher
//! and the consumer. Clones share the underlying connection.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tracing::{info, warn};

use super::broker::{
    Broker, BrokerChannel, ConsumerBroker, ConsumerChannel, Delivery, DeliveryStream,
};
use super::error::BrokerError;
use super::types::{BindingArguments, OutgoingMessage, JSON_CONTENT_TYPE};

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Shared broker connection handle.
#[derive(Clone)]
pub struct AmqpConnection {
    inner: Arc<Connection>,
}

impl AmqpConnection {
    /// Connect to the broker at `url`.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        info!(url_length = url.len(), "rabbitmq_connecting");

        let conn = Connection::connect(url, ConnectionProperties::default()).await?;

        info!("rabbitmq_connected");

        Ok(Self {
            inner: Arc::new(conn),
        })
    }

    /// Open a channel usable for publishing and consuming.
    pub async fn create_channel(&self) -> Result<AmqpChannel, BrokerError> {
        let channel = self.inner.create_channel().await?;
        Ok(AmqpChannel { channel })
    }

    pub fn is_connected(&self) -> bool {
        self.inner.status().connected()
    }

    /// Close the connection gracefully. Errors are logged, not returned.
    pub async fn close(&self) {
        if !self.is_connected() {
            return;
        }

        if let Err(e) = self.inner.close(200, "Normal shutdown").await {
            warn!(error = %e, "rabbitmq_connection_close_error");
        } else {
            info!("rabbitmq_connection_closed");
        }
    }
}

#[async_trait]
impl Broker for AmqpConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        Ok(Box::new(self.create_channel().await?))
    }
}

#[async_trait]
impl ConsumerBroker for AmqpConnection {
    async fn open_consumer_channel(&self) -> Result<Box<dyn ConsumerChannel>, BrokerError> {
        Ok(Box::new(self.create_channel().await?))
    }
}

/// A lapin channel.
pub struct AmqpChannel {
    channel: Channel,
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Self {
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            body: delivery.data,
        }
    }
}

#[async_trait]
impl ConsumerChannel for AmqpChannel {
    async fn set_prefetch(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|delivery| delivery.map(Delivery::from).map_err(BrokerError::from))
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_headers_exchange(&self, exchange: &str) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Headers,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        arguments: &BindingArguments,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::from(arguments),
            )
            .await?;
        Ok(())
    }

    async fn publish(&self, exchange: &str, message: &OutgoingMessage) -> Result<(), BrokerError> {
        let mut properties = BasicProperties::default()
            .with_content_type(JSON_CONTENT_TYPE.into())
            .with_headers(FieldTable::from(&message.headers));

        if message.persistent {
            properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        self.channel
            .basic_publish(
                exchange,
                "",
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await?
            .await?;

        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.channel.status().connected() {
            self.channel.close(200, "Normal shutdown").await?;
        }
        Ok(())
    }
}
