//! In-process notification source for testing

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tracing::trace;

use super::source::{ListenerError, Notification, NotificationConnection, NotificationSource};

const CHANNEL_CAPACITY: usize = 1024;

struct Inner {
    sender: broadcast::Sender<Notification>,
    generation: watch::Sender<u64>,
    failing_connects: AtomicU32,
    connect_count: AtomicU32,
}

/// Broadcast-backed notification source
///
/// Clones share the same channel, so a store and a listener built from
/// clones of one source talk to each other. Connection failures can be
/// injected with [`fail_next_connects`](Self::fail_next_connects) and
/// [`drop_connections`](Self::drop_connections).
#[derive(Clone)]
pub struct InMemoryNotificationSource {
    inner: Arc<Inner>,
}

impl Default for InMemoryNotificationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryNotificationSource {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (generation, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                sender,
                generation,
                failing_connects: AtomicU32::new(0),
                connect_count: AtomicU32::new(0),
            }),
        }
    }

    /// Deliver `payload` to every live subscription of `channel`
    pub fn publish(&self, channel: &str, payload: &str) {
        // No subscribers is fine; nobody is listening yet
        let _ = self.inner.sender.send(Notification {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
    }

    /// Make the next `count` connection attempts fail
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Break every open connection
    pub fn drop_connections(&self) {
        self.inner.generation.send_modify(|g| *g += 1);
    }

    /// Number of successful connections so far
    pub fn connect_count(&self) -> u32 {
        self.inner.connect_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationSource for InMemoryNotificationSource {
    async fn connect(
        &self,
        channel: &str,
    ) -> Result<Box<dyn NotificationConnection>, ListenerError> {
        let injected_failure = self
            .inner
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected_failure {
            return Err(ListenerError::Connection("injected connect failure".into()));
        }

        self.inner.connect_count.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InMemoryConnection {
            channel: channel.to_string(),
            receiver: self.inner.sender.subscribe(),
            generation: self.inner.generation.subscribe(),
        }))
    }
}

struct InMemoryConnection {
    channel: String,
    receiver: broadcast::Receiver<Notification>,
    generation: watch::Receiver<u64>,
}

#[async_trait]
impl NotificationConnection for InMemoryConnection {
    async fn recv(&mut self) -> Result<Notification, ListenerError> {
        loop {
            tokio::select! {
                _ = self.generation.changed() => {
                    return Err(ListenerError::ConnectionLost("connection dropped".into()));
                }
                received = self.receiver.recv() => match received {
                    Ok(notification) if notification.channel == self.channel => {
                        return Ok(notification);
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        trace!(skipped, "Notification receiver lagged");
                        // Missed notifications still mean "poll again"
                        return Ok(Notification {
                            channel: self.channel.clone(),
                            payload: String::new(),
                        });
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(ListenerError::ConnectionLost("source closed".into()));
                    }
                },
            }
        }
    }

    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_reaches_matching_channel_only() {
        let source = InMemoryNotificationSource::new();
        let mut conn = source.connect("tasks").await.unwrap();

        source.publish("other", "x");
        source.publish("tasks", "y");

        let notification = tokio::time::timeout(Duration::from_secs(1), conn.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notification.payload, "y");
    }

    #[tokio::test]
    async fn test_injected_connect_failures() {
        let source = InMemoryNotificationSource::new();
        source.fail_next_connects(2);

        assert!(source.connect("tasks").await.is_err());
        assert!(source.connect("tasks").await.is_err());
        assert!(source.connect("tasks").await.is_ok());
        assert_eq!(source.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_drop_connections_breaks_recv() {
        let source = InMemoryNotificationSource::new();
        let mut conn = source.connect("tasks").await.unwrap();

        source.drop_connections();
        let err = conn.recv().await.unwrap_err();
        assert!(matches!(err, ListenerError::ConnectionLost(_)));
    }
}
