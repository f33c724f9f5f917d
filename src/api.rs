//! Order backend API client.
//!
//! Two calls make up the whole backend surface the panel needs:
//! - `GET  {base}/api/admin/orders` returns the full order snapshot
//! - `PATCH {base}/api/admin/orders/{id}/status` moves one order to a new status
//!
//! The `OrderBackend` trait is the seam the panel talks to, so the reconcile
//! loop and the transition controller can run against an in-memory fake.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::order::{Order, OrderId, OrderStatus};

/// Default timeout for API requests (15 seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Collection endpoint, relative to the normalised base URL.
pub const ORDERS_PATH: &str = "/api/admin/orders";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Snapshot retrieval failed. Recovered by the next poll, never shown to the
/// operator.
#[derive(Debug, Clone, Error)]
pub enum FetchFailure {
    #[error("{0}")]
    Network(String),
    #[error("{message} (HTTP {status})")]
    Status { status: u16, message: String },
    #[error("Order backend reported an unsuccessful response")]
    Unsuccessful,
    #[error("Invalid order payload from backend: {0}")]
    Malformed(String),
}

/// A status update was not applied. Always surfaced to the operator.
#[derive(Debug, Clone, Error)]
pub enum TransitionFailure {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Failed to update status: {message} (HTTP {status})")]
    Rejected { status: u16, message: String },
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the backend URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/api` segment
pub fn normalize_backend_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach order backend at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid order backend URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 | 403 => "Panel is not authorized by the order backend".to_string(),
        404 => "Order not found on backend".to_string(),
        409 | 422 => "Order backend refused the status change".to_string(),
        s if s >= 500 => format!("Order backend server error (HTTP {s})"),
        s => format!("Unexpected response from order backend (HTTP {s})"),
    }
}

/// Pull an `error`/`message` string out of a JSON error body, falling back to
/// the generic status text.
fn error_detail(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|json| {
            json.get("error")
                .or_else(|| json.get("message"))
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| status_error(status))
}

// ---------------------------------------------------------------------------
// Backend seam
// ---------------------------------------------------------------------------

#[async_trait]
pub trait OrderBackend: Send + Sync {
    /// Fetch the complete current order collection.
    async fn fetch_orders(&self) -> Result<Vec<Order>, FetchFailure>;

    /// Ask the backend to move `id` to `status`. Only the response status
    /// code is consumed.
    async fn update_status(&self, id: &OrderId, status: &OrderStatus)
        -> Result<(), TransitionFailure>;
}

#[derive(Debug, Deserialize)]
struct OrdersEnvelope {
    #[serde(default)]
    success: bool,
    orders: Option<Vec<Order>>,
}

/// reqwest-backed order backend.
#[derive(Debug, Clone)]
pub struct HttpOrderBackend {
    base_url: String,
    http: Client,
}

impl HttpOrderBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, String> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {e}"))?;
        Ok(Self {
            base_url: normalize_backend_url(base_url),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn orders_url(&self) -> String {
        format!("{}{ORDERS_PATH}", self.base_url)
    }

    /// `{base}/api/admin/orders/{id}/status`, with the id percent-encoded as a
    /// single path segment.
    fn status_url(&self, id: &OrderId) -> Result<Url, String> {
        let mut url = Url::parse(&self.orders_url())
            .map_err(|e| format!("Invalid order backend URL {}: {e}", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| format!("Order backend URL cannot be a base: {}", self.base_url))?
            .push(id.as_str())
            .push("status");
        Ok(url)
    }
}

#[async_trait]
impl OrderBackend for HttpOrderBackend {
    async fn fetch_orders(&self) -> Result<Vec<Order>, FetchFailure> {
        let url = self.orders_url();
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| FetchFailure::Network(friendly_error(&self.base_url, &e)))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| FetchFailure::Network(friendly_error(&self.base_url, &e)))?;

        if !status.is_success() {
            return Err(FetchFailure::Status {
                status: status.as_u16(),
                message: error_detail(status, &body),
            });
        }

        let envelope: OrdersEnvelope =
            serde_json::from_str(&body).map_err(|e| FetchFailure::Malformed(e.to_string()))?;
        if !envelope.success {
            return Err(FetchFailure::Unsuccessful);
        }
        let orders = envelope
            .orders
            .ok_or_else(|| FetchFailure::Malformed("missing `orders` array".into()))?;

        debug!(count = orders.len(), "Fetched order snapshot");
        Ok(orders)
    }

    async fn update_status(
        &self,
        id: &OrderId,
        status: &OrderStatus,
    ) -> Result<(), TransitionFailure> {
        let url = self.status_url(id).map_err(TransitionFailure::Network)?;
        let resp = self
            .http
            .patch(url)
            .json(&serde_json::json!({ "status": status }))
            .send()
            .await
            .map_err(|e| TransitionFailure::Network(friendly_error(&self.base_url, &e)))?;

        let code = resp.status();
        if !code.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransitionFailure::Rejected {
                status: code.as_u16(),
                message: error_detail(code, &body),
            });
        }

        info!(order_id = %id, status = %status, "Order status updated");
        Ok(())
    }
}
