//! Order Relay - completed-order events over a RabbitMQ headers exchange.
//!
//! This library provides shared modules for the two Order Relay binaries:
//! - `order-relay-publish`: Publishes a completed order through the completion hooks
//! - `order-relay-consumer`: Consumes order events and updates order status
//!
//! ## Architecture
//!
//! ```text
//! Order completed → hooks → Publisher → headers exchange → orders queue → Consumer → store
//! ```

pub mod config;
pub mod consumer;
pub mod hooks;
pub mod queue;
pub mod status;

// Re-export commonly used types
pub use config::Config;
pub use consumer::{handle_delivery, Consumer, ConsumerSettings, DeliveryAction};
pub use hooks::{CompletionHooks, Order, OrderCompletionObserver, OrderEventPublisher};
pub use queue::{
    AmqpConnection, BrokerError, ConsumerBroker, InMemoryBroker, MessageEnvelope, PublishOutcome,
    Publisher, RetryPolicy, RoutingHeaders,
};
pub use status::{
    HttpStatusUpdater, LogOnlyStatusUpdater, OrderStatusUpdater, StatusUpdate, StatusUpdateError,
};
