//! Per-request-class rate limiting for outbound provider requests.
//!
//! Every outbound request belongs to a [`RequestClass`]; each class gets a
//! rolling-window budget of at most N request starts per window of length T.
//! [`RateLimiter::acquire`] blocks until a slot is free — it never drops a
//! request and never spins — and concurrent callers of the same class are
//! admitted in arrival order, which bounds tail latency.
//!
//! Classes are independent: exhausting the `feed` budget does not delay
//! `cover_image` requests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::model::RequestClass;

/// Warning threshold for cumulative delay per class.
const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Maximum Retry-After value to prevent excessive delays.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// A rolling-window budget: at most `max_requests` starts per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Maximum request starts inside any window.
    pub max_requests: u32,
    /// Window length.
    pub window: Duration,
}

impl RateLimit {
    /// Creates a budget of `max_requests` per `window`.
    #[must_use]
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
        }
    }
}

impl Default for RateLimit {
    /// One request per second — a conservative default for unconfigured
    /// classes.
    fn default() -> Self {
        Self::new(1, Duration::from_secs(1))
    }
}

/// Per-request-class rolling-window rate limiter.
///
/// Designed to be wrapped in `Arc` and shared by every fetch path in the
/// process; callers must never reach the network without passing through
/// [`acquire`](Self::acquire) first.
#[derive(Debug)]
pub struct RateLimiter {
    default_limit: RateLimit,
    limits: DashMap<RequestClass, RateLimit>,
    classes: DashMap<RequestClass, Arc<ClassState>>,
}

/// State tracked for each request class.
#[derive(Debug)]
struct ClassState {
    /// Recent request start times plus any server-mandated embargo.
    /// The (FIFO-fair) mutex is held across the admission wait so that
    /// callers are admitted strictly in arrival order.
    window: Mutex<ClassWindow>,
    /// Cumulative delay applied to this class, for excess warnings.
    cumulative_delay_ms: AtomicU64,
}

#[derive(Debug, Default)]
struct ClassWindow {
    starts: VecDeque<Instant>,
    /// No request may start before this instant (server Retry-After).
    not_before: Option<Instant>,
}

impl ClassState {
    fn new() -> Self {
        Self {
            window: Mutex::new(ClassWindow::default()),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::SeqCst)
            + delay_ms;
        Duration::from_millis(total)
    }
}

impl RateLimiter {
    /// Creates a rate limiter with the given default budget for classes
    /// without an explicit limit.
    #[must_use]
    pub fn new(default_limit: RateLimit) -> Self {
        Self {
            default_limit,
            limits: DashMap::new(),
            classes: DashMap::new(),
        }
    }

    /// Sets the budget for one request class.
    pub fn set_limit(&self, class: RequestClass, limit: RateLimit) {
        self.limits.insert(class, limit);
    }

    /// Returns the budget in effect for a class.
    #[must_use]
    pub fn limit(&self, class: RequestClass) -> RateLimit {
        self.limits
            .get(&class)
            .map_or(self.default_limit, |entry| *entry.value())
    }

    /// Blocks until a request of the given class may start, then records the
    /// start.
    ///
    /// Guarantees that within any window of the class's length, no more than
    /// the configured number of requests have started. Concurrent callers of
    /// one class are served FIFO; separate classes never wait on each other.
    #[instrument(skip(self))]
    pub async fn acquire(&self, class: RequestClass) {
        let limit = self.limit(class);
        let state = self.class_state(class);

        // Held across the admission wait: the next caller queues behind us,
        // which is exactly the FIFO ordering we promise.
        let mut window = state.window.lock().await;
        loop {
            let now = Instant::now();

            if let Some(not_before) = window.not_before {
                if not_before > now {
                    let wait = not_before - now;
                    debug!(class = %class, wait_ms = wait.as_millis(), "waiting out server embargo");
                    tokio::time::sleep(wait).await;
                    continue;
                }
                window.not_before = None;
            }

            while window
                .starts
                .front()
                .is_some_and(|&start| now.duration_since(start) >= limit.window)
            {
                window.starts.pop_front();
            }

            if window.starts.len() < limit.max_requests as usize {
                window.starts.push_back(now);
                return;
            }

            // Window full: wait until the oldest start ages out.
            let oldest = window.starts[0];
            let wait = limit.window - now.duration_since(oldest);
            let cumulative = state.add_cumulative_delay(wait);
            debug!(
                class = %class,
                wait_ms = wait.as_millis(),
                cumulative_ms = cumulative.as_millis(),
                "rate limit window full"
            );
            if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
                warn!(
                    class = %class,
                    cumulative_delay_secs = cumulative.as_secs(),
                    "excessive rate limiting - consider raising the class budget"
                );
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Folds a server-mandated delay (Retry-After) into the class budget.
    ///
    /// Subsequent requests of the class will not start before the delay has
    /// passed.
    #[instrument(skip(self))]
    pub async fn record_server_delay(&self, class: RequestClass, delay: Duration) {
        let delay = delay.min(MAX_RETRY_AFTER);
        let state = self.class_state(class);
        let cumulative = state.add_cumulative_delay(delay);

        let mut window = state.window.lock().await;
        let target = Instant::now() + delay;
        window.not_before = Some(window.not_before.map_or(target, |nb| nb.max(target)));

        debug!(
            class = %class,
            delay_ms = delay.as_millis(),
            cumulative_ms = cumulative.as_millis(),
            "recorded server rate limit"
        );
        if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
            warn!(
                class = %class,
                cumulative_delay_secs = cumulative.as_secs(),
                "excessive server rate limiting - provider may be under heavy load"
            );
        }
    }

    fn class_state(&self, class: RequestClass) -> Arc<ClassState> {
        // Clone the Arc so the DashMap shard lock is released before any await.
        self.classes
            .entry(class)
            .or_insert_with(|| Arc::new(ClassState::new()))
            .clone()
    }
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports both RFC 7231 forms: integer seconds and HTTP-date. Returns
/// `None` for unparseable values; caps excessive values at one hour.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }
        #[allow(clippy::cast_sign_loss)]
        return Some(Duration::from_secs(seconds as u64).min(MAX_RETRY_AFTER));
    }

    if let Ok(datetime) = httpdate::parse_http_date(header_value) {
        let now = std::time::SystemTime::now();
        return match datetime.duration_since(now) {
            Ok(duration) => Some(duration.min(MAX_RETRY_AFTER)),
            // Date in the past: no wait required.
            Err(_) => Some(Duration::ZERO),
        };
    }

    debug!(header_value, "unparseable Retry-After value");
    None
}
