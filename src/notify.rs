//! Error notifications.
//!
//! The data layer only produces a presentable message; showing it is up to a
//! [`Notifier`] supplied by the application.

use crate::client::error_classification::classify;
use crate::Error;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::warn;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_error(&self, message: &str, title: Option<&str>);
}

/// Logs notifications instead of displaying them.
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify_error(&self, message: &str, title: Option<&str>) {
        warn!(title = title.unwrap_or(""), text = message, "error notification");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub message: String,
    pub title: Option<String>,
}

/// Records notifications; used by tests.
#[derive(Default)]
pub struct InMemoryNotifier {
    seen: Mutex<Vec<Notification>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.seen.lock().map(|n| n.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn notify_error(&self, message: &str, title: Option<&str>) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(Notification {
                message: message.to_string(),
                title: title.map(str::to_string),
            });
        }
    }
}

/// Classifies failed operations and forwards the message to a notifier.
pub struct QueryErrorHandler {
    notifier: Arc<dyn Notifier>,
    title: Option<String>,
}

impl QueryErrorHandler {
    pub fn new(notifier: Arc<dyn Notifier>, title: Option<String>) -> Self {
        Self { notifier, title }
    }

    /// Notify about `err` and return the message that was shown. The full
    /// error is logged alongside.
    pub async fn handle(&self, err: &Error) -> String {
        let message = classify(err);
        warn!(error = %err, presented = message.as_str(), "operation failed");
        self.notifier
            .notify_error(&message, self.title.as_deref())
            .await;
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::GENERIC_SERVER_ERROR_MESSAGE;
    use crate::transport::TransportError;
    use crate::types::GraphqlError;

    #[tokio::test]
    async fn handler_forwards_classified_messages() {
        let notifier = Arc::new(InMemoryNotifier::new());
        let handler = QueryErrorHandler::new(notifier.clone(), Some("Request failed".into()));

        handler
            .handle(&Error::Api {
                errors: vec![GraphqlError::new("name is taken")],
            })
            .await;
        handler
            .handle(&Error::Transport(TransportError::Status {
                status: 500,
                body: "internal".into(),
            }))
            .await;

        let seen = notifier.notifications();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].message, "Error: name is taken");
        assert_eq!(seen[0].title.as_deref(), Some("Request failed"));
        assert_eq!(seen[1].message, GENERIC_SERVER_ERROR_MESSAGE);
    }
}
