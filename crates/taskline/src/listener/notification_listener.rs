//! Self-healing new-task notification listener

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use super::source::{ListenerError, NotificationConnection, NotificationSource};
use crate::config::ConfigError;
use crate::duration_millis;
use crate::metrics::{
    AppMetricId, AppMetricSnapshot, AppMetricsCollection, AppMetricsProvider, MetricsError,
};
use crate::persistence::DEFAULT_NOTIFICATION_CHANNEL;

const LISTENER_METRICS: &[AppMetricId] = &[
    AppMetricId::ListenerTaskNotificationCount,
    AppMetricId::ListenerReconnectCount,
    AppMetricId::ListenerNotificationWaitTimeoutCount,
];

const EVENT_CAPACITY: usize = 256;

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenerConfig {
    /// Channel new-task notifications are published on
    pub channel: String,

    /// How long one wait for a notification lasts before timing out
    #[serde(with = "duration_millis")]
    pub wait_timeout: Duration,

    /// First delay after a failed connection attempt
    #[serde(with = "duration_millis")]
    pub reconnect_initial_delay: Duration,

    /// Upper bound for the reconnect delay
    #[serde(with = "duration_millis")]
    pub reconnect_max_delay: Duration,

    /// Reconnect delay multiplier
    pub reconnect_backoff_multiplier: f64,

    /// How long `start` waits for the first connection
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            channel: DEFAULT_NOTIFICATION_CHANNEL.to_string(),
            wait_timeout: Duration::from_millis(250),
            reconnect_initial_delay: Duration::from_millis(100),
            reconnect_max_delay: Duration::from_secs(5),
            reconnect_backoff_multiplier: 2.0,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ListenerConfig {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ..Default::default()
        }
    }

    /// Set the notification wait timeout
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout.max(Duration::from_millis(1));
        self
    }

    /// Set the reconnect delay bounds
    pub fn with_reconnect_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_initial_delay = initial;
        self.reconnect_max_delay = max.max(initial);
        self
    }

    /// Set the reconnect delay multiplier
    pub fn with_reconnect_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.reconnect_backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Set the first-connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel.is_empty() {
            return Err(ConfigError::invalid("listener", "channel must not be empty"));
        }
        if self.wait_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "listener",
                "wait_timeout must be greater than zero",
            ));
        }
        if self.reconnect_initial_delay > self.reconnect_max_delay {
            return Err(ConfigError::invalid(
                "listener",
                "reconnect_initial_delay must not exceed reconnect_max_delay",
            ));
        }
        Ok(())
    }

    fn next_reconnect_delay(&self, current: Duration) -> Duration {
        Duration::from_secs_f64(current.as_secs_f64() * self.reconnect_backoff_multiplier)
            .min(self.reconnect_max_delay)
    }
}

/// Something the poller should react to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerEvent {
    /// First connection after start
    Connected,
    /// Reconnected after losing the connection; notifications may be lost
    ConnectionRestored,
    /// A task was posted
    NewTaskPosted,
    /// A full wait elapsed without notifications
    TimedOut,
}

/// Keeps one subscription to the new-task channel alive
///
/// ```text
///   connect ──fail──▶ sleep (bounded exponential) ──┐
///      │ ok                                          │
///      ▼                                             │
///   Connected / ConnectionRestored                   │
///      │                                             │
///      ▼                                             │
///   wait(timeout) ──notification──▶ NewTaskPosted    │
///      │         ──timeout──────▶ TimedOut           │
///      │ connection lost                             │
///      └─────────────────────────────────────────────┘
/// ```
pub struct NotificationListener {
    source: Arc<dyn NotificationSource>,
    config: ListenerConfig,
    events: broadcast::Sender<ListenerEvent>,
    metrics: Arc<AppMetricsCollection>,
    cancel: Mutex<CancellationToken>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationListener {
    pub fn new(source: Arc<dyn NotificationSource>, config: ListenerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            source,
            config,
            events,
            metrics: Arc::new(AppMetricsCollection::new(LISTENER_METRICS)),
            cancel: Mutex::new(CancellationToken::new()),
            handle: Mutex::new(None),
        }
    }

    /// Receive listener events
    pub fn subscribe(&self) -> broadcast::Receiver<ListenerEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Start listening and wait for the first connection
    ///
    /// Fails with [`ListenerError::StartTimeout`] if no connection could be
    /// established within the connect timeout; the listener is stopped again
    /// in that case.
    #[instrument(skip(self), fields(channel = %self.config.channel))]
    pub async fn start(&self) -> Result<(), ListenerError> {
        let (connected_tx, mut connected_rx) = watch::channel(false);
        {
            let mut handle = self.handle.lock();
            if handle.is_some() {
                return Err(ListenerError::AlreadyRunning);
            }

            let cancel = CancellationToken::new();
            *self.cancel.lock() = cancel.clone();

            let task = ListenerTask {
                source: Arc::clone(&self.source),
                config: self.config.clone(),
                events: self.events.clone(),
                metrics: Arc::clone(&self.metrics),
                cancel,
                connected: connected_tx,
            };
            *handle = Some(tokio::spawn(task.run()));
        }

        let first_connection =
            tokio::time::timeout(self.config.connect_timeout, connected_rx.wait_for(|c| *c))
                .await
                .map(|connected| connected.is_ok());

        match first_connection {
            Ok(true) => {
                info!(channel = %self.config.channel, "Notification listener started");
                Ok(())
            }
            Ok(false) => {
                self.stop().await;
                Err(ListenerError::Connection(
                    "listener exited before connecting".into(),
                ))
            }
            Err(_) => {
                self.stop().await;
                Err(ListenerError::StartTimeout(self.config.connect_timeout))
            }
        }
    }

    /// Stop listening; idempotent
    #[instrument(skip(self), fields(channel = %self.config.channel))]
    pub async fn stop(&self) {
        self.cancel.lock().cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Listener task failed");
            }
            info!(channel = %self.config.channel, "Notification listener stopped");
        }
    }
}

impl AppMetricsProvider for NotificationListener {
    fn collect_metrics(&self) -> Vec<AppMetricSnapshot> {
        self.metrics.collect_metrics()
    }

    fn query_metric(&self, id: AppMetricId) -> Result<AppMetricSnapshot, MetricsError> {
        self.metrics.query_metric(id)
    }

    fn exported_metric_ids(&self) -> Vec<AppMetricId> {
        self.metrics.exported_metric_ids()
    }
}

// =============================================================================
// Background loop
// =============================================================================

struct ListenerTask {
    source: Arc<dyn NotificationSource>,
    config: ListenerConfig,
    events: broadcast::Sender<ListenerEvent>,
    metrics: Arc<AppMetricsCollection>,
    cancel: CancellationToken,
    connected: watch::Sender<bool>,
}

impl ListenerTask {
    async fn run(self) {
        let mut connected_once = false;
        let mut delay = self.config.reconnect_initial_delay;

        loop {
            let attempt = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                attempt = self.source.connect(&self.config.channel) => attempt,
            };

            let mut connection = match attempt {
                Ok(connection) => connection,
                Err(e) => {
                    warn!(
                        channel = %self.config.channel,
                        error = %e,
                        retry_in_ms = delay.as_millis(),
                        "Listener connect failed"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = self.config.next_reconnect_delay(delay);
                    continue;
                }
            };
            delay = self.config.reconnect_initial_delay;

            if connected_once {
                self.metrics.bump(AppMetricId::ListenerReconnectCount);
                info!(channel = %self.config.channel, "Listener connection restored");
                self.emit(ListenerEvent::ConnectionRestored);
            } else {
                connected_once = true;
                self.connected.send_replace(true);
                self.emit(ListenerEvent::Connected);
            }

            let outcome = self.wait_for_notifications(connection.as_mut()).await;
            connection.close().await;

            match outcome {
                Ok(()) => break,
                Err(e) => {
                    error!(channel = %self.config.channel, error = %e, "Listener connection lost");
                }
            }
        }

        debug!(channel = %self.config.channel, "Listener loop exited");
    }

    /// Returns `Ok` when cancelled, `Err` when the connection broke
    async fn wait_for_notifications(
        &self,
        connection: &mut dyn NotificationConnection,
    ) -> Result<(), ListenerError> {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                received = tokio::time::timeout(self.config.wait_timeout, connection.recv()) => {
                    match received {
                        Ok(Ok(notification)) => {
                            self.metrics.bump(AppMetricId::ListenerTaskNotificationCount);
                            trace!(payload = %notification.payload, "Task notification received");
                            self.emit(ListenerEvent::NewTaskPosted);
                        }
                        Ok(Err(e)) => return Err(e),
                        Err(_) => {
                            self.metrics.bump(AppMetricId::ListenerNotificationWaitTimeoutCount);
                            self.emit(ListenerEvent::TimedOut);
                        }
                    }
                }
            }
        }
    }

    fn emit(&self, event: ListenerEvent) {
        // Nobody subscribed is not an error
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::InMemoryNotificationSource;

    async fn next_event(
        rx: &mut broadcast::Receiver<ListenerEvent>,
        wanted: ListenerEvent,
    ) -> ListenerEvent {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match rx.recv().await {
                    Ok(event) if event == wanted => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(e) => panic!("event channel closed: {e}"),
                }
            }
        })
        .await
        .unwrap()
    }

    fn listener(source: &InMemoryNotificationSource, config: ListenerConfig) -> NotificationListener {
        NotificationListener::new(Arc::new(source.clone()), config)
    }

    #[test]
    fn test_default_config() {
        let config = ListenerConfig::default();
        assert_eq!(config.channel, DEFAULT_NOTIFICATION_CHANNEL);
        assert_eq!(config.wait_timeout, Duration::from_millis(250));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_reconnect_delay_is_bounded() {
        let config = ListenerConfig::default()
            .with_reconnect_delays(Duration::from_millis(100), Duration::from_millis(300));
        let d1 = config.next_reconnect_delay(config.reconnect_initial_delay);
        let d2 = config.next_reconnect_delay(d1);
        assert_eq!(d1, Duration::from_millis(200));
        assert_eq!(d2, Duration::from_millis(300));
    }

    #[test]
    fn test_empty_channel_is_invalid() {
        assert!(ListenerConfig::new("").validate().is_err());
    }

    #[tokio::test]
    async fn test_notifications_are_counted_and_published() {
        let source = InMemoryNotificationSource::new();
        let listener = listener(&source, ListenerConfig::new("tasks"));
        let mut events = listener.subscribe();

        listener.start().await.unwrap();
        next_event(&mut events, ListenerEvent::Connected).await;

        source.publish("tasks", "1");
        next_event(&mut events, ListenerEvent::NewTaskPosted).await;

        assert_eq!(
            listener
                .query_metric(AppMetricId::ListenerTaskNotificationCount)
                .unwrap()
                .value,
            1
        );
        listener.stop().await;
        assert!(!listener.is_running());
    }

    #[tokio::test]
    async fn test_connection_loss_reconnects() {
        let source = InMemoryNotificationSource::new();
        let config = ListenerConfig::new("tasks")
            .with_reconnect_delays(Duration::from_millis(5), Duration::from_millis(20));
        let listener = listener(&source, config);
        let mut events = listener.subscribe();
        listener.start().await.unwrap();

        source.fail_next_connects(2);
        source.drop_connections();
        next_event(&mut events, ListenerEvent::ConnectionRestored).await;

        assert_eq!(
            listener
                .query_metric(AppMetricId::ListenerReconnectCount)
                .unwrap()
                .value,
            1
        );
        assert_eq!(source.connect_count(), 2);

        source.publish("tasks", "after-restore");
        next_event(&mut events, ListenerEvent::NewTaskPosted).await;
        listener.stop().await;
    }

    #[tokio::test]
    async fn test_wait_timeouts_are_reported() {
        let source = InMemoryNotificationSource::new();
        let listener = listener(
            &source,
            ListenerConfig::new("tasks").with_wait_timeout(Duration::from_millis(10)),
        );
        let mut events = listener.subscribe();
        listener.start().await.unwrap();

        next_event(&mut events, ListenerEvent::TimedOut).await;
        listener.stop().await;

        assert!(
            listener
                .query_metric(AppMetricId::ListenerNotificationWaitTimeoutCount)
                .unwrap()
                .value
                >= 1
        );
    }

    #[tokio::test]
    async fn test_start_times_out_without_connection() {
        let source = InMemoryNotificationSource::new();
        source.fail_next_connects(u32::MAX);
        let listener = listener(
            &source,
            ListenerConfig::new("tasks")
                .with_reconnect_delays(Duration::from_millis(5), Duration::from_millis(10))
                .with_connect_timeout(Duration::from_millis(50)),
        );

        let err = listener.start().await.unwrap_err();
        assert!(matches!(err, ListenerError::StartTimeout(_)));
        assert!(!listener.is_running());
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let source = InMemoryNotificationSource::new();
        let listener = listener(&source, ListenerConfig::new("tasks"));
        listener.start().await.unwrap();

        assert!(matches!(
            listener.start().await,
            Err(ListenerError::AlreadyRunning)
        ));
        listener.stop().await;
    }
}
