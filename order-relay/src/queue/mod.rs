//! Queue module for RabbitMQ operations.
//!
//! This module provides:
//! - Message and routing types for the headers-exchange protocol
//! - The broker seam with lapin-backed and in-memory implementations
//! - The retrying publisher
//! - Consumer channels with manual acknowledgement
//!
//! ## Architecture
//!
//! ```text
//! Order completed → Publisher → headers exchange ─(x-match: all)→ orders queue → Consumer
//! ```

pub mod broker;
pub mod connection;
pub mod error;
pub mod memory;
pub mod publisher;
pub mod types;

pub use broker::{
    declare_binding, Broker, BrokerChannel, ConsumerBroker, ConsumerChannel, Delivery,
    DeliveryStream,
};
pub use connection::{AmqpChannel, AmqpConnection};
pub use error::BrokerError;
pub use memory::{BrokerOp, Failure, InMemoryBroker};
pub use publisher::{PublishOutcome, Publisher, RetryPolicy};
pub use types::{
    BindingArguments, MessageEnvelope, OutgoingMessage, RoutingHeaders, XMatch,
    DEFAULT_OBJECT_TYPE, DEFAULT_ROUTING_KEY, ORDERS_QUEUE,
};
