//! Best-effort pushes to external library managers and notification
//! services.
//!
//! Both are fire-and-forget: a failing endpoint is logged and skipped,
//! never fatal to the worker run that triggered it. Notification endpoints
//! configure a body template with `%title`/`%text` placeholders; the
//! dispatcher substitutes before sending.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Error from a push endpoint.
#[derive(Debug, Error)]
#[error("{name}: {message}")]
pub struct PushError {
    /// Endpoint name.
    pub name: String,
    /// Endpoint-specific description.
    pub message: String,
}

impl PushError {
    /// Creates an endpoint error.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// A notification service endpoint (gotify-alikes, webhooks, ...).
#[async_trait]
pub trait Notifier: Send + Sync + std::fmt::Debug {
    /// Endpoint name for logs.
    fn name(&self) -> &str;

    /// Sends a rendered notification.
    async fn notify(&self, title: &str, text: &str) -> Result<(), PushError>;
}

/// An external library manager that should rescan after downloads.
#[async_trait]
pub trait LibraryUpdater: Send + Sync + std::fmt::Debug {
    /// Endpoint name for logs.
    fn name(&self) -> &str;

    /// Asks the library to refresh.
    async fn update_library(&self) -> Result<(), PushError>;
}

/// Substitutes `%title` and `%text` placeholders in a template.
#[must_use]
pub fn substitute(template: &str, title: &str, text: &str) -> String {
    template.replace("%title", title).replace("%text", text)
}

/// The configured set of push targets.
#[derive(Debug, Default)]
pub struct PushSet {
    notifiers: Vec<Arc<dyn Notifier>>,
    updaters: Vec<Arc<dyn LibraryUpdater>>,
}

impl PushSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a notification endpoint.
    pub fn add_notifier(&mut self, notifier: Arc<dyn Notifier>) {
        self.notifiers.push(notifier);
    }

    /// Adds a library endpoint.
    pub fn add_updater(&mut self, updater: Arc<dyn LibraryUpdater>) {
        self.updaters.push(updater);
    }

    /// Sends a notification to every endpoint, logging failures.
    #[instrument(skip(self, text))]
    pub async fn notify_all(&self, title: &str, text: &str) {
        for notifier in &self.notifiers {
            match notifier.notify(title, text).await {
                Ok(()) => debug!(endpoint = notifier.name(), "notification sent"),
                Err(error) => {
                    warn!(endpoint = notifier.name(), error = %error, "notification failed");
                }
            }
        }
    }

    /// Triggers a refresh on every library endpoint, logging failures.
    #[instrument(skip(self))]
    pub async fn update_all(&self) {
        for updater in &self.updaters {
            match updater.update_library().await {
                Ok(()) => debug!(endpoint = updater.name(), "library update triggered"),
                Err(error) => {
                    warn!(endpoint = updater.name(), error = %error, "library update failed");
                }
            }
        }
    }
}
