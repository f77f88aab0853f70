//! Order Relay Consumer - binds the orders queue and marks consumed orders as fulfilled.
//!
//! Runs until SIGINT/SIGTERM. The broker connection is closed on the way out
//! whether or not the consume loop failed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use order_relay::{
    AmqpConnection, Config, Consumer, ConsumerSettings, HttpStatusUpdater, LogOnlyStatusUpdater,
    OrderStatusUpdater,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("consumer_starting");

    // Load configuration from environment
    let config = Config::from_env();
    let settings = ConsumerSettings::from_config(&config);
    info!(
        exchange = %settings.exchange,
        queue = %settings.queue,
        object_type = %settings.headers.object_type,
        routing_key = %settings.headers.routing_key,
        store_api_configured = config.store_api_url.is_some(),
        "config_loaded"
    );

    let updater = build_updater(&config)?;

    let connection = AmqpConnection::connect(&config.rabbitmq_url)
        .await
        .context("Failed to connect to RabbitMQ")?;

    let consumer = Consumer::new(Arc::new(connection.clone()), settings, updater);
    let result = consumer.retrieve_orders(shutdown_signal()).await;

    connection.close().await;

    info!("consumer_shutdown_complete");
    result
}

fn build_updater(config: &Config) -> Result<Arc<dyn OrderStatusUpdater>> {
    match &config.store_api_url {
        Some(url) => {
            let updater = HttpStatusUpdater::new(
                url,
                config.store_api_token.clone(),
                Duration::from_millis(config.request_timeout_ms),
            )
            .context("Failed to create store API client")?;
            Ok(Arc::new(updater))
        }
        None => {
            warn!("STORE_API_URL not set, order status updates will only be logged");
            Ok(Arc::new(LogOnlyStatusUpdater))
        }
    }
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "sigint_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
