//! Order completion hooks.
//!
//! The host's order workflow calls [`CompletionHooks::order_completed`] when
//! an order reaches its complete state. Registered observers run in
//! registration order; [`OrderEventPublisher`] is the one that forwards the
//! order to the broker.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::queue::{MessageEnvelope, PublishOutcome, Publisher, RoutingHeaders};

/// Full attribute set of an order as the host stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Order(Map<String, Value>);

impl Order {
    pub fn new(attributes: Map<String, Value>) -> Self {
        Self(attributes)
    }

    /// Order number, when present as a string.
    pub fn number(&self) -> Option<&str> {
        self.0.get("number").and_then(Value::as_str)
    }

    pub fn attributes(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl TryFrom<Value> for Order {
    type Error = Value;

    /// Only JSON objects are orders; anything else is handed back.
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(attributes) => Ok(Self(attributes)),
            other => Err(other),
        }
    }
}

/// Reacts to an order reaching its complete state.
#[async_trait]
pub trait OrderCompletionObserver: Send + Sync {
    async fn on_order_completed(&self, order: &Order);
}

/// Observers of the order completion transition.
#[derive(Default, Clone)]
pub struct CompletionHooks {
    observers: Vec<Arc<dyn OrderCompletionObserver>>,
}

impl CompletionHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, observer: Arc<dyn OrderCompletionObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Notify every observer, one after another.
    pub async fn order_completed(&self, order: &Order) {
        if self.observers.is_empty() {
            warn!(order_number = ?order.number(), "order_completed_without_observers");
            return;
        }

        for observer in &self.observers {
            observer.on_order_completed(order).await;
        }
    }
}

/// Publishes completed orders to a headers exchange.
#[derive(Clone)]
pub struct OrderEventPublisher {
    publisher: Publisher,
    exchange: String,
    queue: String,
    headers: RoutingHeaders,
}

impl OrderEventPublisher {
    pub fn new(
        publisher: Publisher,
        exchange: impl Into<String>,
        queue: impl Into<String>,
        headers: RoutingHeaders,
    ) -> Self {
        Self {
            publisher,
            exchange: exchange.into(),
            queue: queue.into(),
            headers,
        }
    }

    /// Publish one order and report the outcome.
    pub async fn publish_order(&self, order: &Order) -> PublishOutcome {
        let envelope = MessageEnvelope::new(self.exchange.clone(), order.clone().into_value())
            .with_headers(self.headers.clone())
            .with_queue(self.queue.clone());

        let outcome = self.publisher.publish(&envelope).await;

        info!(
            order_number = ?order.number(),
            exchange = %self.exchange,
            published = outcome.is_published(),
            attempts = outcome.attempts(),
            "order_completed_event"
        );

        outcome
    }
}

#[async_trait]
impl OrderCompletionObserver for OrderEventPublisher {
    async fn on_order_completed(&self, order: &Order) {
        self.publish_order(order).await;
    }
}
