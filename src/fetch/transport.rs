//! Interchangeable transports behind the fetch client.
//!
//! Transport choice is a property of the call site: most providers are
//! served by the lightweight [`HttpTransport`], while providers whose pages
//! only materialize after client-side script execution use the
//! [`BrowserTransport`]. Rate limiting and retry live above this seam and
//! are transport-agnostic.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions};
use reqwest::Client;
use reqwest::header::{REFERER, RETRY_AFTER, USER_AGENT};
use tracing::{debug, instrument};

use super::FetchError;
use crate::user_agent;

/// Connect timeout for the HTTP transport.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Read timeout for the HTTP transport. Provider pages and images are small;
/// anything slower than this is effectively down.
const READ_TIMEOUT_SECS: u64 = 60;

/// A single outbound request as seen by a transport.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// Target URL.
    pub url: String,
    /// Optional Referer header, required by some image CDNs.
    pub referer: Option<String>,
}

impl TransportRequest {
    /// Creates a request without a referer.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            referer: None,
        }
    }
}

/// What a transport observed for one request.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// HTTP status code (the browser transport reports 200 on successful
    /// navigation).
    pub status: u16,
    /// URL the response actually came from, after redirects.
    pub final_url: String,
    /// Raw Retry-After header value, when the server sent one.
    pub retry_after: Option<String>,
    /// Response body bytes (page HTML or image data).
    pub body: Vec<u8>,
}

impl TransportResponse {
    /// Returns the body decoded as UTF-8 text, lossily.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// One way of performing an outbound request.
///
/// Implementations report HTTP-level failures (4xx/5xx) as a successful
/// `TransportResponse` carrying the status; only request-level failures
/// (network, navigation) are errors. Classification happens in the fetch
/// client.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Short transport name for logs ("http", "browser").
    fn name(&self) -> &'static str;

    /// Performs the request.
    async fn execute(&self, request: &TransportRequest) -> Result<TransportResponse, FetchError>;
}

/// Plain HTTP transport over a pooled reqwest client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Creates the transport with default timeouts.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails with the static
    /// configuration, which cannot happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(READ_TIMEOUT_SECS))
            .gzip(true)
            .cookie_store(true)
            .user_agent(user_agent::default_user_agent())
            .build()
            .expect("failed to build HTTP client with static configuration");
        Self { client }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    #[instrument(skip(self), fields(url = %request.url))]
    async fn execute(&self, request: &TransportRequest) -> Result<TransportResponse, FetchError> {
        let mut builder = self.client.get(&request.url);
        if let Some(referer) = &request.referer {
            builder = builder.header(REFERER, referer);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::timeout(&request.url)
            } else {
                FetchError::network(&request.url, e)
            }
        })?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(std::string::ToString::to_string);

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::network(&request.url, e))?
            .to_vec();

        debug!(status, bytes = body.len(), final_url = %final_url, "http transport response");
        Ok(TransportResponse {
            status,
            final_url,
            retry_after,
            body,
        })
    }
}

/// Scripted-browser transport for providers that render content client-side.
///
/// Drives a shared headless Chromium instance; each request opens a fresh
/// tab, waits for navigation (and therefore script execution) to settle, and
/// returns the rendered document. Navigation is synchronous in the
/// underlying CDP library, so it runs on the blocking thread pool.
#[derive(Clone)]
pub struct BrowserTransport {
    browser: Arc<Browser>,
}

impl fmt::Debug for BrowserTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrowserTransport").finish_non_exhaustive()
    }
}

impl BrowserTransport {
    /// Launches the headless browser behind the transport.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Browser`] when Chromium cannot be launched
    /// (missing binary, sandbox restrictions).
    pub fn launch() -> Result<Self, FetchError> {
        let user_agent_arg = format!("--user-agent={}", user_agent::BROWSER_USER_AGENT);
        let args = vec![
            std::ffi::OsStr::new("--disable-blink-features=AutomationControlled"),
            std::ffi::OsStr::new("--disable-dev-shm-usage"),
            std::ffi::OsStr::new("--no-sandbox"),
            std::ffi::OsStr::new(&user_agent_arg),
        ];
        let options = LaunchOptions::default_builder()
            .headless(true)
            .window_size(Some((1920, 1080)))
            .args(args)
            .build()
            .map_err(|e| FetchError::browser("<launch>", e.to_string()))?;
        let browser =
            Browser::new(options).map_err(|e| FetchError::browser("<launch>", e.to_string()))?;
        Ok(Self {
            browser: Arc::new(browser),
        })
    }
}

#[async_trait]
impl Transport for BrowserTransport {
    fn name(&self) -> &'static str {
        "browser"
    }

    #[instrument(skip(self), fields(url = %request.url))]
    async fn execute(&self, request: &TransportRequest) -> Result<TransportResponse, FetchError> {
        let browser = Arc::clone(&self.browser);
        let url = request.url.clone();

        let result = tokio::task::spawn_blocking(move || -> Result<(String, String), String> {
            let tab = browser.new_tab().map_err(|e| e.to_string())?;
            tab.navigate_to(&url).map_err(|e| e.to_string())?;
            tab.wait_until_navigated().map_err(|e| e.to_string())?;
            let content = tab.get_content().map_err(|e| e.to_string())?;
            let final_url = tab.get_url();
            let _ = tab.close(true);
            Ok((content, final_url))
        })
        .await
        .map_err(|e| FetchError::browser(&request.url, format!("render task failed: {e}")))?;

        let (content, final_url) =
            result.map_err(|message| FetchError::browser(&request.url, message))?;

        debug!(bytes = content.len(), final_url = %final_url, "browser transport response");
        Ok(TransportResponse {
            status: 200,
            final_url,
            retry_after: None,
            body: content.into_bytes(),
        })
    }
}
