//! In-memory headers-exchange broker for testing or local pipelines.
//!
//! Routing follows the broker's headers-exchange rules: a published message
//! lands in every queue whose binding arguments match its headers. Every
//! operation is recorded so tests can assert on the exact call sequence.
//!
//! A queue with a live subscription hands new messages straight to the
//! subscriber; otherwise they wait in the queue. Requeued messages wait in the
//! queue until the next subscription.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::{mpsc, Mutex};

use super::broker::{
    Broker, BrokerChannel, ConsumerBroker, ConsumerChannel, Delivery, DeliveryStream,
};
use super::error::BrokerError;
use super::types::{BindingArguments, OutgoingMessage};

/// Operation recorded by the in-memory broker.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerOp {
    OpenChannel,
    DeclareHeadersExchange {
        exchange: String,
    },
    DeclareQueue {
        queue: String,
    },
    BindQueue {
        queue: String,
        exchange: String,
        arguments: BindingArguments,
    },
    Publish {
        exchange: String,
        message: OutgoingMessage,
    },
    SetPrefetch {
        prefetch_count: u16,
    },
    Subscribe {
        queue: String,
        consumer_tag: String,
    },
    Ack {
        delivery_tag: u64,
    },
    Nack {
        delivery_tag: u64,
        requeue: bool,
    },
    CloseChannel,
}

/// Kind of failure to inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Connection drop or similar; retried by the publisher.
    Transient,
    /// Non-transient publish error; never retried.
    Unexpected,
}

#[derive(Debug, Clone, Copy)]
enum FailurePlan {
    Next(Failure, u32),
    Always(Failure),
}

#[derive(Debug, Default)]
struct State {
    exchanges: HashSet<String>,
    queues: HashMap<String, Vec<OutgoingMessage>>,
    bindings: Vec<(String, String, BindingArguments)>,
    ops: Vec<BrokerOp>,
    failure: Option<FailurePlan>,
    subscribers: HashMap<String, mpsc::UnboundedSender<Delivery>>,
    unacked: HashMap<u64, (String, OutgoingMessage)>,
    last_delivery_tag: u64,
}

impl State {
    /// Hand `message` to the subscriber of `queue`, if there is a live one.
    fn deliver(&mut self, queue: &str, message: &OutgoingMessage) -> bool {
        let Some(sender) = self.subscribers.get(queue) else {
            return false;
        };

        let delivery_tag = self.last_delivery_tag + 1;
        let delivery = Delivery {
            delivery_tag,
            redelivered: false,
            body: message.body.clone(),
        };

        if sender.send(delivery).is_err() {
            self.subscribers.remove(queue);
            return false;
        }

        self.last_delivery_tag = delivery_tag;
        self.unacked
            .insert(delivery_tag, (queue.to_string(), message.clone()));
        true
    }

    fn enqueue(&mut self, queue: &str, message: OutgoingMessage) {
        if !self.deliver(queue, &message) {
            self.queues.entry(queue.to_string()).or_default().push(message);
        }
    }

    /// Consume one injected failure, if any is armed.
    fn take_failure(&mut self) -> Option<Failure> {
        match self.failure? {
            FailurePlan::Always(failure) => Some(failure),
            FailurePlan::Next(failure, remaining) => {
                self.failure = if remaining > 1 {
                    Some(FailurePlan::Next(failure, remaining - 1))
                } else {
                    None
                };
                Some(failure)
            }
        }
    }
}

/// Shared in-memory broker. Clones see the same exchanges and queues.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` exchange declarations.
    pub async fn fail_next(&self, failure: Failure, times: u32) {
        let mut state = self.state.lock().await;
        state.failure = (times > 0).then_some(FailurePlan::Next(failure, times));
    }

    /// Fail every exchange declaration from now on.
    pub async fn fail_always(&self, failure: Failure) {
        self.state.lock().await.failure = Some(FailurePlan::Always(failure));
    }

    /// Every operation performed so far, in order.
    pub async fn operations(&self) -> Vec<BrokerOp> {
        self.state.lock().await.ops.clone()
    }

    /// Number of recorded operations accepted by `matches`.
    pub async fn count(&self, matches: impl Fn(&BrokerOp) -> bool) -> usize {
        self.state.lock().await.ops.iter().filter(|op| matches(op)).count()
    }

    /// Messages currently sitting in `queue`.
    pub async fn queued(&self, queue: &str) -> Vec<OutgoingMessage> {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    /// Remove and return every message in `queue`.
    pub async fn drain(&self, queue: &str) -> Vec<OutgoingMessage> {
        self.state
            .lock()
            .await
            .queues
            .get_mut(queue)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Deliveries handed out and not yet acked or nacked.
    pub async fn unacked(&self) -> usize {
        self.state.lock().await.unacked.len()
    }

    /// Cancel every subscription; their delivery streams end.
    pub async fn cancel_consumers(&self) {
        self.state.lock().await.subscribers.clear();
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        self.state.lock().await.ops.push(BrokerOp::OpenChannel);
        Ok(Box::new(InMemoryChannel {
            state: Arc::clone(&self.state),
        }))
    }
}

#[async_trait]
impl ConsumerBroker for InMemoryBroker {
    async fn open_consumer_channel(&self) -> Result<Box<dyn ConsumerChannel>, BrokerError> {
        self.state.lock().await.ops.push(BrokerOp::OpenChannel);
        Ok(Box::new(InMemoryChannel {
            state: Arc::clone(&self.state),
        }))
    }
}

struct InMemoryChannel {
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_headers_exchange(&self, exchange: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.ops.push(BrokerOp::DeclareHeadersExchange {
            exchange: exchange.to_string(),
        });

        match state.take_failure() {
            Some(Failure::Transient) => Err(BrokerError::Unavailable(
                "connection reset by peer".to_string(),
            )),
            Some(Failure::Unexpected) => Err(BrokerError::Publish(
                "exchange declaration rejected".to_string(),
            )),
            None => {
                state.exchanges.insert(exchange.to_string());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.ops.push(BrokerOp::DeclareQueue {
            queue: queue.to_string(),
        });
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        arguments: &BindingArguments,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.ops.push(BrokerOp::BindQueue {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            arguments: arguments.clone(),
        });

        if !state.exchanges.contains(exchange) {
            return Err(BrokerError::Publish(format!("no exchange '{exchange}'")));
        }
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Publish(format!("no queue '{queue}'")));
        }

        let binding = (queue.to_string(), exchange.to_string(), arguments.clone());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, message: &OutgoingMessage) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.ops.push(BrokerOp::Publish {
            exchange: exchange.to_string(),
            message: message.clone(),
        });

        if !state.exchanges.contains(exchange) {
            return Err(BrokerError::Publish(format!("no exchange '{exchange}'")));
        }

        let headers: BTreeMap<String, String> = message.headers.to_map();
        let targets: HashSet<String> = state
            .bindings
            .iter()
            .filter(|(_, bound, arguments)| bound == exchange && arguments.matches(&headers))
            .map(|(queue, _, _)| queue.clone())
            .collect();

        for queue in targets {
            state.enqueue(&queue, message.clone());
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.state.lock().await.ops.push(BrokerOp::CloseChannel);
        Ok(())
    }
}

#[async_trait]
impl ConsumerChannel for InMemoryChannel {
    async fn set_prefetch(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        self.state
            .lock()
            .await
            .ops
            .push(BrokerOp::SetPrefetch { prefetch_count });
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        let mut state = self.state.lock().await;
        state.ops.push(BrokerOp::Subscribe {
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
        });

        let waiting = match state.queues.get_mut(queue) {
            Some(messages) => std::mem::take(messages),
            None => return Err(BrokerError::Publish(format!("no queue '{queue}'"))),
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        state.subscribers.insert(queue.to_string(), sender);
        for message in waiting {
            state.enqueue(queue, message);
        }

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver
                .recv()
                .await
                .map(|delivery| (Ok(delivery), receiver))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.ops.push(BrokerOp::Ack { delivery_tag });

        match state.unacked.remove(&delivery_tag) {
            Some(_) => Ok(()),
            None => Err(BrokerError::Publish(format!(
                "unknown delivery tag {delivery_tag}"
            ))),
        }
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.ops.push(BrokerOp::Nack {
            delivery_tag,
            requeue,
        });

        let (queue, message) = state.unacked.remove(&delivery_tag).ok_or_else(|| {
            BrokerError::Publish(format!("unknown delivery tag {delivery_tag}"))
        })?;

        if requeue {
            state.queues.entry(queue).or_default().push(message);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::types::RoutingHeaders;

    fn message(headers: RoutingHeaders) -> OutgoingMessage {
        OutgoingMessage {
            body: br#"{"number":"R100"}"#.to_vec(),
            headers,
            persistent: true,
        }
    }

    #[tokio::test]
    async fn test_routes_only_to_matching_bindings() {
        let broker = InMemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();

        channel.declare_headers_exchange("orders").await.unwrap();
        channel.declare_queue("store").await.unwrap();
        channel.declare_queue("warehouse").await.unwrap();
        channel
            .bind_queue("store", "orders", &BindingArguments::all(&RoutingHeaders::default()))
            .await
            .unwrap();
        channel
            .bind_queue(
                "warehouse",
                "orders",
                &BindingArguments::all(&RoutingHeaders::new("order", "warehouse")),
            )
            .await
            .unwrap();

        channel
            .publish("orders", &message(RoutingHeaders::default()))
            .await
            .unwrap();

        assert_eq!(broker.queued("store").await.len(), 1);
        assert!(broker.queued("warehouse").await.is_empty());
    }

    #[tokio::test]
    async fn test_publish_to_missing_exchange_is_unexpected() {
        let broker = InMemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();

        let err = channel
            .publish("nowhere", &message(RoutingHeaders::default()))
            .await
            .unwrap_err();

        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_fail_next_runs_out() {
        let broker = InMemoryBroker::new();
        broker.fail_next(Failure::Transient, 1).await;
        let channel = broker.open_channel().await.unwrap();

        let first = channel.declare_headers_exchange("orders").await;
        assert!(matches!(first, Err(ref e) if e.is_transient()));
        assert!(channel.declare_headers_exchange("orders").await.is_ok());
    }

    async fn bound_queue(broker: &InMemoryBroker) -> Box<dyn ConsumerChannel> {
        let channel = broker.open_consumer_channel().await.unwrap();
        channel.declare_headers_exchange("orders").await.unwrap();
        channel.declare_queue("orders").await.unwrap();
        channel
            .bind_queue("orders", "orders", &BindingArguments::all(&RoutingHeaders::default()))
            .await
            .unwrap();
        channel
    }

    #[tokio::test]
    async fn test_subscribe_delivers_waiting_and_new_messages() {
        let broker = InMemoryBroker::new();
        let channel = bound_queue(&broker).await;
        channel
            .publish("orders", &message(RoutingHeaders::default()))
            .await
            .unwrap();

        let mut deliveries = channel.subscribe("orders", "test").await.unwrap();
        channel
            .publish("orders", &message(RoutingHeaders::default()))
            .await
            .unwrap();

        let first = deliveries.next().await.unwrap().unwrap();
        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!((first.delivery_tag, second.delivery_tag), (1, 2));
        assert_eq!(first.body, br#"{"number":"R100"}"#.to_vec());
        assert!(broker.queued("orders").await.is_empty());
        assert_eq!(broker.unacked().await, 2);
    }

    #[tokio::test]
    async fn test_nack_requeue_returns_message_to_queue() {
        let broker = InMemoryBroker::new();
        let channel = bound_queue(&broker).await;
        let mut deliveries = channel.subscribe("orders", "test").await.unwrap();
        channel
            .publish("orders", &message(RoutingHeaders::default()))
            .await
            .unwrap();
        channel
            .publish("orders", &message(RoutingHeaders::default()))
            .await
            .unwrap();

        let kept = deliveries.next().await.unwrap().unwrap();
        let dropped = deliveries.next().await.unwrap().unwrap();
        channel.nack(kept.delivery_tag, true).await.unwrap();
        channel.nack(dropped.delivery_tag, false).await.unwrap();

        assert_eq!(broker.queued("orders").await.len(), 1);
        assert_eq!(broker.unacked().await, 0);
        assert!(channel.ack(kept.delivery_tag).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_ends_delivery_stream() {
        let broker = InMemoryBroker::new();
        let channel = bound_queue(&broker).await;
        let mut deliveries = channel.subscribe("orders", "test").await.unwrap();

        broker.cancel_consumers().await;

        assert!(deliveries.next().await.is_none());
    }

    #[tokio::test]
    async fn test_drain_empties_queue() {
        let broker = InMemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();
        channel.declare_headers_exchange("orders").await.unwrap();
        channel.declare_queue("orders").await.unwrap();
        channel
            .bind_queue("orders", "orders", &BindingArguments::all(&RoutingHeaders::default()))
            .await
            .unwrap();
        channel
            .publish("orders", &message(RoutingHeaders::default()))
            .await
            .unwrap();

        assert_eq!(broker.drain("orders").await.len(), 1);
        assert!(broker.queued("orders").await.is_empty());
    }
}
