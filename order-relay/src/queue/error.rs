//! Broker error taxonomy.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while talking to the broker.
///
/// Transient errors are retried by the publisher; everything else is an
/// unexpected publish error that is logged once and dropped.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("broker operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unexpected publish error: {0}")]
    Publish(String),
}

impl BrokerError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Amqp(_) | BrokerError::Timeout(_) | BrokerError::Unavailable(_)
        )
    }
}
