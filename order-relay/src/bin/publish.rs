//! Order Relay Publish - fires the order completion hooks for one order.
//!
//! Reads the completed order's attributes as a JSON object from stdin and
//! publishes them to the configured headers exchange:
//!
//! ```text
//! echo '{"number":"R123456789","state":"complete"}' | order-relay-publish
//! ```
//!
//! Publish failures are logged, never turned into a non-zero exit.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::io::AsyncReadExt;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use order_relay::{
    AmqpConnection, CompletionHooks, Config, Order, OrderEventPublisher, Publisher,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    let config = Config::from_env();
    info!(
        exchange = %config.publish_exchange,
        queue = %config.queue,
        max_retries = config.publish_max_retries,
        "config_loaded"
    );

    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("Failed to read order from stdin")?;

    let value: serde_json::Value =
        serde_json::from_str(&input).context("Order is not valid JSON")?;
    let order = Order::try_from(value).map_err(|_| anyhow!("Order must be a JSON object"))?;

    let connection = AmqpConnection::connect(&config.rabbitmq_url)
        .await
        .context("Failed to connect to RabbitMQ")?;

    let publisher = Publisher::new(Arc::new(connection.clone()), config.retry_policy());

    let mut hooks = CompletionHooks::new();
    hooks.register(Arc::new(OrderEventPublisher::new(
        publisher,
        config.publish_exchange.clone(),
        config.queue.clone(),
        config.routing_headers(),
    )));

    hooks.order_completed(&order).await;

    connection.close().await;

    Ok(())
}
