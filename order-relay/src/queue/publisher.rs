//! Async RabbitMQ publisher with bounded retry.
//!
//! Each publish opens its own channel, declares the headers exchange and the
//! bound queue, publishes a persistent JSON message and closes the channel.
//! Transient failures are retried after a fixed delay; failures never reach
//! the caller and are only visible in the logs.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use super::broker::{declare_binding, Broker, BrokerChannel};
use super::error::BrokerError;
use super::types::{MessageEnvelope, OutgoingMessage};

/// Bounded retry with a fixed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt
    pub max_retries: u32,
    /// Sleep between attempts
    pub retry_delay: Duration,
    /// Limit for opening the channel, for the publish sequence and for
    /// closing the channel
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(5),
        }
    }
}

/// What happened to a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The broker accepted the message.
    Published { attempts: u32 },
    /// Every attempt failed transiently; the message was dropped.
    RetriesExhausted { attempts: u32 },
    /// A non-transient error stopped the publish; the message was dropped.
    Failed { attempts: u32 },
}

impl PublishOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, PublishOutcome::Published { .. })
    }

    pub fn attempts(&self) -> u32 {
        match *self {
            PublishOutcome::Published { attempts }
            | PublishOutcome::RetriesExhausted { attempts }
            | PublishOutcome::Failed { attempts } => attempts,
        }
    }
}

/// Fire-and-forget publisher. Cheap to clone.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
    policy: RetryPolicy,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>, policy: RetryPolicy) -> Self {
        Self { broker, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Publish `envelope`, retrying transient failures.
    ///
    /// Makes at most `max_retries + 1` attempts. Never returns an error; the
    /// outcome is informational.
    pub async fn publish(&self, envelope: &MessageEnvelope) -> PublishOutcome {
        let message = match envelope.to_outgoing() {
            Ok(message) => message,
            Err(e) => {
                error!(
                    exchange = %envelope.exchange,
                    error = %e,
                    "rabbitmq_publish_unexpected_error"
                );
                return PublishOutcome::Failed { attempts: 0 };
            }
        };

        let mut retries = 0;

        loop {
            let attempt = retries + 1;

            match self.attempt(envelope, &message).await {
                Ok(()) => {
                    info!(
                        exchange = %envelope.exchange,
                        queue = %envelope.queue,
                        attempt = attempt,
                        body_length = message.body.len(),
                        "rabbitmq_published"
                    );
                    return PublishOutcome::Published { attempts: attempt };
                }
                Err(e) if e.is_transient() => {
                    retries += 1;
                    if retries > self.policy.max_retries {
                        error!(
                            exchange = %envelope.exchange,
                            attempts = attempt,
                            max_retries = self.policy.max_retries,
                            error = %e,
                            "rabbitmq_publish_failed"
                        );
                        return PublishOutcome::RetriesExhausted { attempts: attempt };
                    }

                    warn!(
                        exchange = %envelope.exchange,
                        attempt = retries,
                        max_retries = self.policy.max_retries,
                        retry_delay_ms = self.policy.retry_delay.as_millis() as u64,
                        error = %e,
                        "rabbitmq_publish_retrying"
                    );
                    sleep(self.policy.retry_delay).await;
                }
                Err(e) => {
                    error!(
                        exchange = %envelope.exchange,
                        attempt = attempt,
                        error = %e,
                        "rabbitmq_publish_unexpected_error"
                    );
                    return PublishOutcome::Failed { attempts: attempt };
                }
            }
        }
    }

    /// One attempt on a fresh channel. The channel is closed on every path
    /// once it has been opened.
    async fn attempt(
        &self,
        envelope: &MessageEnvelope,
        message: &OutgoingMessage,
    ) -> Result<(), BrokerError> {
        let channel = self.limited(self.broker.open_channel()).await?;

        let result = self
            .limited(send(channel.as_ref(), envelope, message))
            .await;

        if let Err(e) = self.limited(channel.close()).await {
            warn!(error = %e, "rabbitmq_channel_close_error");
        }

        result
    }

    async fn limited<T>(
        &self,
        operation: impl Future<Output = Result<T, BrokerError>>,
    ) -> Result<T, BrokerError> {
        let limit = self.policy.attempt_timeout;
        timeout(limit, operation)
            .await
            .map_err(|_| BrokerError::Timeout(limit))?
    }
}

async fn send(
    channel: &dyn BrokerChannel,
    envelope: &MessageEnvelope,
    message: &OutgoingMessage,
) -> Result<(), BrokerError> {
    declare_binding(channel, &envelope.exchange, &envelope.queue, &envelope.headers).await?;
    channel.publish(&envelope.exchange, message).await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    use super::*;
    use crate::queue::memory::{BrokerOp, Failure, InMemoryBroker};
    use crate::queue::types::{BindingArguments, RoutingHeaders};

    /// Counts this crate's warn and error events.
    #[derive(Clone, Default)]
    struct LevelCounts {
        warn: Arc<AtomicUsize>,
        error: Arc<AtomicUsize>,
    }

    impl LevelCounts {
        fn warns(&self) -> usize {
            self.warn.load(Ordering::SeqCst)
        }

        fn errors(&self) -> usize {
            self.error.load(Ordering::SeqCst)
        }
    }

    impl<S: Subscriber> Layer<S> for LevelCounts {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            let metadata = event.metadata();
            if !metadata.target().starts_with("order_relay") {
                return;
            }
            match *metadata.level() {
                Level::WARN => self.warn.fetch_add(1, Ordering::SeqCst),
                Level::ERROR => self.error.fetch_add(1, Ordering::SeqCst),
                _ => 0,
            };
        }
    }

    /// Broker whose channels accept everything but never finish closing.
    struct StuckClose;

    #[async_trait]
    impl Broker for StuckClose {
        async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
            Ok(Box::new(StuckClose))
        }
    }

    #[async_trait]
    impl BrokerChannel for StuckClose {
        async fn declare_headers_exchange(&self, _: &str) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn declare_queue(&self, _: &str) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn bind_queue(
            &self,
            _: &str,
            _: &str,
            _: &BindingArguments,
        ) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn publish(&self, _: &str, _: &OutgoingMessage) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), BrokerError> {
            std::future::pending().await
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            retry_delay: Duration::ZERO,
            attempt_timeout: Duration::from_secs(5),
        }
    }

    fn publisher(broker: &InMemoryBroker, max_retries: u32) -> Publisher {
        Publisher::new(Arc::new(broker.clone()), fast_policy(max_retries))
    }

    fn is_exchange_declare(op: &BrokerOp) -> bool {
        matches!(op, BrokerOp::DeclareHeadersExchange { .. })
    }

    #[tokio::test]
    async fn test_publish_issues_expected_calls() {
        let broker = InMemoryBroker::new();
        let envelope =
            MessageEnvelope::new("test_exchange", json!({"order_id": 123, "status": "created"}));

        let outcome = publisher(&broker, 2).publish(&envelope).await;

        assert_eq!(outcome, PublishOutcome::Published { attempts: 1 });
        assert_eq!(
            broker.operations().await,
            vec![
                BrokerOp::OpenChannel,
                BrokerOp::DeclareHeadersExchange {
                    exchange: "test_exchange".to_string()
                },
                BrokerOp::DeclareQueue {
                    queue: "orders".to_string()
                },
                BrokerOp::BindQueue {
                    queue: "orders".to_string(),
                    exchange: "test_exchange".to_string(),
                    arguments: BindingArguments::all(&RoutingHeaders::default()),
                },
                BrokerOp::Publish {
                    exchange: "test_exchange".to_string(),
                    message: OutgoingMessage {
                        body: br#"{"order_id":123,"status":"created"}"#.to_vec(),
                        headers: RoutingHeaders::default(),
                        persistent: true,
                    },
                },
                BrokerOp::CloseChannel,
            ]
        );
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_retries() {
        let broker = InMemoryBroker::new();
        broker.fail_always(Failure::Transient).await;
        let envelope = MessageEnvelope::new("orders", json!({"number": "R100"}));

        let outcome = publisher(&broker, 2).publish(&envelope).await;

        assert_eq!(outcome, PublishOutcome::RetriesExhausted { attempts: 3 });
        assert_eq!(broker.count(is_exchange_declare).await, 3);
        assert_eq!(
            broker.count(|op| matches!(op, BrokerOp::CloseChannel)).await,
            3
        );
        assert_eq!(
            broker.count(|op| matches!(op, BrokerOp::Publish { .. })).await,
            0
        );
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let broker = InMemoryBroker::new();
        broker.fail_next(Failure::Transient, 1).await;
        let envelope = MessageEnvelope::new("orders", json!({"number": "R100"}));

        let outcome = publisher(&broker, 2).publish(&envelope).await;

        assert_eq!(outcome, PublishOutcome::Published { attempts: 2 });
        assert_eq!(broker.queued("orders").await.len(), 1);
    }

    #[tokio::test]
    async fn test_unexpected_error_is_not_retried() {
        let broker = InMemoryBroker::new();
        broker.fail_always(Failure::Unexpected).await;
        let envelope = MessageEnvelope::new("orders", json!({"number": "R100"}));

        let outcome = publisher(&broker, 2).publish(&envelope).await;

        assert_eq!(outcome, PublishOutcome::Failed { attempts: 1 });
        assert_eq!(broker.count(is_exchange_declare).await, 1);
        assert_eq!(
            broker.count(|op| matches!(op, BrokerOp::CloseChannel)).await,
            1
        );
    }

    #[tokio::test]
    async fn test_zero_retries_makes_one_attempt() {
        let broker = InMemoryBroker::new();
        broker.fail_always(Failure::Transient).await;
        let envelope = MessageEnvelope::new("orders", json!({}));

        let outcome = publisher(&broker, 0).publish(&envelope).await;

        assert_eq!(outcome, PublishOutcome::RetriesExhausted { attempts: 1 });
    }

    #[tokio::test]
    async fn test_custom_queue_and_headers() {
        let broker = InMemoryBroker::new();
        let headers = RoutingHeaders::new("order", "warehouse");
        let envelope = MessageEnvelope::new("orders", json!({"number": "R100"}))
            .with_headers(headers.clone())
            .with_queue("fulfilment");

        let outcome = publisher(&broker, 2).publish(&envelope).await;

        assert!(outcome.is_published());
        assert!(broker.queued("orders").await.is_empty());
        let queued = broker.queued("fulfilment").await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].headers, headers);
    }

    #[tokio::test]
    async fn test_exhausted_retries_log_each_retry_and_one_error() {
        let counts = LevelCounts::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(counts.clone()));
        let broker = InMemoryBroker::new();
        broker.fail_always(Failure::Transient).await;
        let envelope = MessageEnvelope::new("orders", json!({"number": "R100"}));

        publisher(&broker, 2).publish(&envelope).await;

        assert_eq!(counts.warns(), 2);
        assert_eq!(counts.errors(), 1);
    }

    #[tokio::test]
    async fn test_unexpected_error_logs_once_without_retry_warnings() {
        let counts = LevelCounts::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(counts.clone()));
        let broker = InMemoryBroker::new();
        broker.fail_always(Failure::Unexpected).await;
        let envelope = MessageEnvelope::new("orders", json!({"number": "R100"}));

        publisher(&broker, 2).publish(&envelope).await;

        assert_eq!(counts.warns(), 0);
        assert_eq!(counts.errors(), 1);
    }

    #[tokio::test]
    async fn test_stuck_close_is_bounded_by_attempt_timeout() {
        let policy = RetryPolicy {
            max_retries: 0,
            retry_delay: Duration::ZERO,
            attempt_timeout: Duration::from_millis(50),
        };
        let publisher = Publisher::new(Arc::new(StuckClose), policy);
        let envelope = MessageEnvelope::new("orders", json!({"number": "R100"}));

        let outcome = timeout(Duration::from_secs(2), publisher.publish(&envelope))
            .await
            .expect("publish hung on channel close");

        assert_eq!(outcome, PublishOutcome::Published { attempts: 1 });
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.retry_delay, Duration::from_secs(1));
    }
}
