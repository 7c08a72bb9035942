//! Rate-limited provider fetching: transports, retry, and the fetch client.
//!
//! # Architecture
//!
//! - [`RateLimiter`] - rolling-window budgets per [`RequestClass`](crate::model::RequestClass)
//! - [`RetryPolicy`] / [`classify_error`] - bounded backoff for transient failures
//! - [`Transport`] - pluggable request execution ([`HttpTransport`], [`BrowserTransport`])
//! - [`FetchClient`] - the only path to the network: acquire, execute, retry
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use mangasync_core::fetch::{FetchClient, HttpTransport, RateLimit, RateLimiter, RetryPolicy};
//! use mangasync_core::model::RequestClass;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let limiter = Arc::new(RateLimiter::new(RateLimit::new(4, Duration::from_secs(1))));
//! let client = FetchClient::new(Arc::new(HttpTransport::new()), limiter, RetryPolicy::default());
//! let response = client.fetch("https://example.com/feed", RequestClass::Feed).await?;
//! println!("fetched {} bytes from {}", response.body.len(), response.final_url);
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod rate_limiter;
mod retry;
mod transport;

pub use client::{FetchClient, FetchResponse};
pub use error::FetchError;
pub use rate_limiter::{RateLimit, RateLimiter, parse_retry_after};
pub use retry::{
    DEFAULT_MAX_ATTEMPTS, FailureType, RetryDecision, RetryPolicy, classify_error,
    classify_http_status,
};
pub use transport::{BrowserTransport, HttpTransport, Transport, TransportRequest, TransportResponse};
