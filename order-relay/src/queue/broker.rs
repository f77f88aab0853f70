//! Broker abstraction shared by the publisher and the consumer.
//!
//! [`Broker`] hands out short-lived channels; [`BrokerChannel`] is the small
//! set of AMQP operations the headers-exchange protocol needs. The consumer
//! side adds [`ConsumerBroker`] / [`ConsumerChannel`] for subscriptions and
//! acknowledgements. The lapin implementation lives in `connection`, an
//! in-memory one in `memory`.

use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::debug;

use super::error::BrokerError;
use super::types::{BindingArguments, OutgoingMessage, RoutingHeaders};

/// Source of broker channels.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a fresh channel. The caller owns it and must close it.
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError>;
}

/// One broker channel.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a durable headers exchange (idempotent).
    async fn declare_headers_exchange(&self, exchange: &str) -> Result<(), BrokerError>;

    /// Declare a durable queue (idempotent).
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Bind `queue` to `exchange` with header match arguments.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        arguments: &BindingArguments,
    ) -> Result<(), BrokerError>;

    /// Publish a message to `exchange`. Headers exchanges ignore the routing key.
    async fn publish(&self, exchange: &str, message: &OutgoingMessage) -> Result<(), BrokerError>;

    /// Close the channel.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// A message handed to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub body: Vec<u8>,
}

/// Deliveries of one subscription. Ends when the broker cancels it.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Source of long-lived consumer channels.
#[async_trait]
pub trait ConsumerBroker: Send + Sync {
    async fn open_consumer_channel(&self) -> Result<Box<dyn ConsumerChannel>, BrokerError>;
}

/// A channel that can also subscribe to a queue and settle deliveries.
#[async_trait]
pub trait ConsumerChannel: BrokerChannel {
    /// Limit unacknowledged deliveries on this channel.
    async fn set_prefetch(&self, prefetch_count: u16) -> Result<(), BrokerError>;

    /// Subscribe to `queue` with manual acknowledgement.
    async fn subscribe(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;
}

/// Declare the exchange and queue and bind them with `x-match: all` over the
/// routing headers.
pub async fn declare_binding<C>(
    channel: &C,
    exchange: &str,
    queue: &str,
    headers: &RoutingHeaders,
) -> Result<(), BrokerError>
where
    C: BrokerChannel + ?Sized,
{
    channel.declare_headers_exchange(exchange).await?;
    channel.declare_queue(queue).await?;

    let arguments = BindingArguments::all(headers);
    channel.bind_queue(queue, exchange, &arguments).await?;

    debug!(
        exchange = exchange,
        queue = queue,
        x_match = %arguments.x_match,
        object_type = %headers.object_type,
        routing_key = %headers.routing_key,
        "rabbitmq_binding_declared"
    );

    Ok(())
}
