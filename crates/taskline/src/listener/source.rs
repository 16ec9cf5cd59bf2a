//! Notification source seam

use async_trait::async_trait;

/// A single change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

/// Listener errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ListenerError {
    /// Could not open or subscribe a connection
    #[error("listener connection failed: {0}")]
    Connection(String),

    /// An established connection went away
    #[error("listener connection lost: {0}")]
    ConnectionLost(String),

    /// No connection was established within the connect timeout
    #[error("listener did not connect within {0:?}")]
    StartTimeout(std::time::Duration),

    /// `start` was called on a running listener
    #[error("listener is already running")]
    AlreadyRunning,
}

/// Opens subscriptions to a notification channel
#[async_trait]
pub trait NotificationSource: Send + Sync + 'static {
    /// Connect and subscribe to `channel`
    async fn connect(&self, channel: &str)
        -> Result<Box<dyn NotificationConnection>, ListenerError>;
}

/// A live subscription
#[async_trait]
pub trait NotificationConnection: Send {
    /// Wait for the next notification
    ///
    /// Must be cancel safe: the listener wraps it in a timeout.
    async fn recv(&mut self) -> Result<Notification, ListenerError>;

    /// Unsubscribe and release the connection
    async fn close(&mut self);
}
