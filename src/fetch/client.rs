//! Rate-limited, retrying fetch client.
//!
//! Every outbound provider request goes through [`FetchClient::fetch`]:
//! the request class's rate-limit slot is acquired first (callers must
//! never bypass this path), the configured transport performs the request,
//! and transient failures are retried with exponential backoff. The client
//! also reports whether the response URL differs from the request URL —
//! some providers redirect a search query straight to a result page, and
//! callers treat that specially.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, instrument, warn};

use super::rate_limiter::{RateLimiter, parse_retry_after};
use super::retry::{FailureType, RetryDecision, RetryPolicy, classify_error};
use super::transport::{Transport, TransportRequest};
use super::FetchError;
use crate::model::RequestClass;

/// A completed fetch.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// HTTP status of the final response (always a success status).
    pub status: u16,
    /// Response body bytes.
    pub body: Vec<u8>,
    /// URL the body actually came from.
    pub final_url: String,
    /// Whether the final URL differs from the requested URL.
    pub redirected: bool,
}

impl FetchResponse {
    /// Returns the body decoded as UTF-8 text, lossily.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Rate-limited fetch client with bounded retry.
///
/// Cheap to clone-share via `Arc`; the transport and rate limiter are both
/// shared. Transport choice is fixed per client instance — call sites that
/// need the scripted browser construct a second client over the same
/// limiter, keeping the budget global.
#[derive(Debug, Clone)]
pub struct FetchClient {
    transport: Arc<dyn Transport>,
    rate_limiter: Arc<RateLimiter>,
    retry_policy: RetryPolicy,
}

impl FetchClient {
    /// Creates a client over the given transport and shared rate limiter.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        rate_limiter: Arc<RateLimiter>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            rate_limiter,
            retry_policy,
        }
    }

    /// Returns the shared rate limiter.
    #[must_use]
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Fetches a URL under the given request class.
    ///
    /// # Errors
    ///
    /// Returns the final [`FetchError`] once retries are exhausted, or
    /// immediately for permanent failures.
    #[instrument(skip(self), fields(class = %class))]
    pub async fn fetch(
        &self,
        url: &str,
        class: RequestClass,
    ) -> Result<FetchResponse, FetchError> {
        self.fetch_with(url, class, None, None).await
    }

    /// Fetches with an optional referer and cancellation flag.
    ///
    /// The cancellation flag is checked before the first attempt and between
    /// retry attempts; a cancelled fetch returns [`FetchError::Cancelled`]
    /// without touching the network again.
    ///
    /// # Errors
    ///
    /// Returns the final [`FetchError`] once retries are exhausted, or
    /// immediately for permanent failures and cancellation.
    #[instrument(skip(self, cancel), fields(class = %class))]
    pub async fn fetch_with(
        &self,
        url: &str,
        class: RequestClass,
        referer: Option<&str>,
        cancel: Option<&AtomicBool>,
    ) -> Result<FetchResponse, FetchError> {
        // Reject malformed URLs before spending a rate-limit slot.
        if url::Url::parse(url).is_err() {
            return Err(FetchError::invalid_url(url));
        }

        let mut request = TransportRequest::new(url);
        request.referer = referer.map(std::string::ToString::to_string);

        let mut attempt: u32 = 1;
        loop {
            if cancel.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
                return Err(FetchError::cancelled(url));
            }

            self.rate_limiter.acquire(class).await;

            match self.attempt(&request).await {
                Ok(response) => {
                    debug!(
                        status = response.status,
                        redirected = response.redirected,
                        attempt,
                        "fetch complete"
                    );
                    return Ok(response);
                }
                Err(error) => {
                    let failure = classify_error(&error);
                    let server_delay = self.fold_server_delay(class, failure, &error).await;

                    match self.retry_policy.should_retry(failure, attempt) {
                        RetryDecision::Retry {
                            delay,
                            attempt: next_attempt,
                        } => {
                            // A server-mandated delay outranks our own backoff.
                            let wait = server_delay.map_or(delay, |sd| sd.max(delay));
                            warn!(
                                error = %error,
                                attempt,
                                wait_ms = wait.as_millis(),
                                "transient fetch failure, retrying"
                            );
                            tokio::time::sleep(wait).await;
                            attempt = next_attempt;
                        }
                        RetryDecision::DoNotRetry { reason } => {
                            warn!(error = %error, attempt, reason = %reason, "fetch failed");
                            return Err(error);
                        }
                    }
                }
            }
        }
    }

    /// One transport round trip, mapping error statuses to `FetchError`.
    async fn attempt(&self, request: &TransportRequest) -> Result<FetchResponse, FetchError> {
        let response = self.transport.execute(request).await?;

        if !(200..300).contains(&response.status) {
            return Err(FetchError::http_status_with_retry_after(
                &request.url,
                response.status,
                response.retry_after,
            ));
        }

        let redirected = response.final_url != request.url;
        Ok(FetchResponse {
            status: response.status,
            body: response.body,
            final_url: response.final_url,
            redirected,
        })
    }

    /// Records a 429's Retry-After into the class budget, returning the
    /// parsed delay.
    async fn fold_server_delay(
        &self,
        class: RequestClass,
        failure: FailureType,
        error: &FetchError,
    ) -> Option<Duration> {
        if failure != FailureType::RateLimited {
            return None;
        }
        let FetchError::HttpStatus {
            retry_after: Some(raw),
            ..
        } = error
        else {
            return None;
        };
        let delay = parse_retry_after(raw)?;
        self.rate_limiter.record_server_delay(class, delay).await;
        Some(delay)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::fetch::rate_limiter::RateLimit;
    use crate::fetch::transport::HttpTransport;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn open_limiter() -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(RateLimit::new(
            1000,
            Duration::from_millis(10),
        )))
    }

    fn client() -> (FetchClient, Arc<RateLimiter>) {
        let limiter = open_limiter();
        let client = FetchClient::new(
            Arc::new(HttpTransport::new()),
            Arc::clone(&limiter),
            RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(50), 2.0),
        );
        (client, limiter)
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/title/42"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload"))
            .mount(&server)
            .await;

        let (client, _) = client();
        let response = client
            .fetch(&format!("{}/title/42", server.uri()), RequestClass::Metadata)
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.text(), "payload");
        assert!(!response.redirected);
    }

    #[tokio::test]
    async fn test_fetch_reports_redirect() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("Location", format!("{}/title/7", server.uri())),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/title/7"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"single result"))
            .mount(&server)
            .await;

        let (client, _) = client();
        let response = client
            .fetch(&format!("{}/search", server.uri()), RequestClass::Metadata)
            .await
            .unwrap();

        // A search that lands on a result page must be detectable.
        assert!(response.redirected);
        assert!(response.final_url.ends_with("/title/7"));
    }

    #[tokio::test]
    async fn test_fetch_retries_transient_500() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"recovered"))
            .mount(&server)
            .await;

        let (client, _) = client();
        let response = client
            .fetch(&format!("{}/flaky", server.uri()), RequestClass::Feed)
            .await
            .unwrap();
        assert_eq!(response.text(), "recovered");
    }

    #[tokio::test]
    async fn test_fetch_does_not_retry_404() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let (client, _) = client();
        let result = client
            .fetch(&format!("{}/gone", server.uri()), RequestClass::Metadata)
            .await;

        assert!(matches!(
            result,
            Err(FetchError::HttpStatus { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn test_fetch_gives_up_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let (client, _) = client();
        let result = client
            .fetch(&format!("{}/down", server.uri()), RequestClass::Default)
            .await;

        assert!(matches!(
            result,
            Err(FetchError::HttpStatus { status: 503, .. })
        ));
    }

    #[tokio::test]
    async fn test_fetch_invalid_url_is_immediate() {
        let (client, _) = client();
        let result = client.fetch("not-a-valid-url", RequestClass::Default).await;
        assert!(matches!(result, Err(FetchError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn test_fetch_cancelled_between_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow-fail"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (client, _) = client();
        let cancel = AtomicBool::new(false);
        let url = format!("{}/slow-fail", server.uri());

        // Cancel immediately: the pre-attempt check must fire.
        cancel.store(true, Ordering::SeqCst);
        let result = client
            .fetch_with(&url, RequestClass::Default, None, Some(&cancel))
            .await;
        assert!(matches!(result, Err(FetchError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn test_fetch_429_records_server_delay() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/limited"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/limited"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok"))
            .mount(&server)
            .await;

        let (client, _) = client();
        let response = client
            .fetch(&format!("{}/limited", server.uri()), RequestClass::Feed)
            .await
            .unwrap();
        assert_eq!(response.text(), "ok");
    }
}
