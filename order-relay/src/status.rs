//! Order status updates in the store.
//!
//! The consumer only knows an order number and a target status; how the
//! store applies it sits behind [`OrderStatusUpdater`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

/// Result of a status update that reached the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    Updated,
    NotFound,
}

#[derive(Debug, Error)]
pub enum StatusUpdateError {
    #[error("invalid store API URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("store API request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("store API returned {status} for order {order_number}")]
    UnexpectedStatus { order_number: String, status: u16 },
}

/// Updates the status of an order identified by its number.
#[async_trait]
pub trait OrderStatusUpdater: Send + Sync {
    async fn update_order_status(
        &self,
        order_number: &str,
        status: &str,
    ) -> Result<StatusUpdate, StatusUpdateError>;
}

#[derive(Serialize)]
struct StatusBody<'a> {
    status: &'a str,
}

/// Updates orders through the store's HTTP API:
/// `PATCH {base}/orders/{number}` with `{"status": ...}`.
pub struct HttpStatusUpdater {
    client: Client,
    base_url: Url,
    api_token: Option<String>,
}

impl HttpStatusUpdater {
    pub fn new(
        base_url: &str,
        api_token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, StatusUpdateError> {
        let client = Client::builder().timeout(request_timeout).build()?;

        Ok(Self {
            client,
            base_url: normalize_base(base_url)?,
            api_token,
        })
    }

    /// URL of a single order resource.
    pub fn order_url(&self, order_number: &str) -> Result<Url, StatusUpdateError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .extend(["orders", order_number]);
        Ok(url)
    }
}

/// Parse the base URL, rejecting bases that cannot carry a path.
fn normalize_base(base_url: &str) -> Result<Url, url::ParseError> {
    let url = Url::parse(base_url)?;
    if url.cannot_be_a_base() {
        return Err(url::ParseError::RelativeUrlWithCannotBeABaseBase);
    }
    Ok(url)
}

#[async_trait]
impl OrderStatusUpdater for HttpStatusUpdater {
    async fn update_order_status(
        &self,
        order_number: &str,
        status: &str,
    ) -> Result<StatusUpdate, StatusUpdateError> {
        let url = self.order_url(order_number)?;

        let mut request = self.client.patch(url).json(&StatusBody { status });
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;

        match response.status() {
            s if s.is_success() => {
                info!(
                    order_number = order_number,
                    status = status,
                    "order_status_updated"
                );
                Ok(StatusUpdate::Updated)
            }
            StatusCode::NOT_FOUND => {
                warn!(order_number = order_number, "order_not_found");
                Ok(StatusUpdate::NotFound)
            }
            other => Err(StatusUpdateError::UnexpectedStatus {
                order_number: order_number.to_string(),
                status: other.as_u16(),
            }),
        }
    }
}

/// Logs the update without contacting the store.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlyStatusUpdater;

#[async_trait]
impl OrderStatusUpdater for LogOnlyStatusUpdater {
    async fn update_order_status(
        &self,
        order_number: &str,
        status: &str,
    ) -> Result<StatusUpdate, StatusUpdateError> {
        info!(
            order_number = order_number,
            status = status,
            dry_run = true,
            "order_status_updated"
        );
        Ok(StatusUpdate::Updated)
    }
}
