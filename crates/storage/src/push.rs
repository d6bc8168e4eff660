//! Best-effort push notification dispatch
//!
//! The core only requires fire-and-forget semantics from its dispatcher.
//! [`LoggingDispatcher`] is the reference implementation: it records the
//! notification in the log and always succeeds.

use async_trait::async_trait;

use crate::records::PushNotification;
use crate::stores::{NotificationDispatcher, Result};

/// Dispatcher that logs notifications instead of delivering them
#[derive(Debug, Default)]
pub struct LoggingDispatcher;

impl LoggingDispatcher {
    /// Create a logging dispatcher
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NotificationDispatcher for LoggingDispatcher {
    async fn notify(&self, notification: PushNotification) -> Result<()> {
        tracing::info!(
            targets = ?notification.target_ids,
            title = %notification.title,
            body = %notification.body,
            "push notification"
        );
        Ok(())
    }
}
