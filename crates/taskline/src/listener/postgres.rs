//! PostgreSQL LISTEN/NOTIFY source

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tracing::{debug, warn};

use super::source::{ListenerError, Notification, NotificationConnection, NotificationSource};

/// Opens a dedicated `LISTEN` connection from the pool's connect options
#[derive(Clone)]
pub struct PostgresNotificationSource {
    pool: PgPool,
}

impl PostgresNotificationSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationSource for PostgresNotificationSource {
    async fn connect(
        &self,
        channel: &str,
    ) -> Result<Box<dyn NotificationConnection>, ListenerError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| ListenerError::Connection(e.to_string()))?;
        listener
            .listen(channel)
            .await
            .map_err(|e| ListenerError::Connection(e.to_string()))?;

        debug!(channel, "Signaling connection open");
        Ok(Box::new(PostgresNotificationConnection {
            listener,
            channel: channel.to_string(),
        }))
    }
}

struct PostgresNotificationConnection {
    listener: PgListener,
    channel: String,
}

#[async_trait]
impl NotificationConnection for PostgresNotificationConnection {
    async fn recv(&mut self) -> Result<Notification, ListenerError> {
        // try_recv reports a lost connection as Ok(None) instead of silently
        // reconnecting, so the pipeline can re-poll for anything it missed.
        match self.listener.try_recv().await {
            Ok(Some(notification)) => Ok(Notification {
                channel: notification.channel().to_string(),
                payload: notification.payload().to_string(),
            }),
            Ok(None) => Err(ListenerError::ConnectionLost(
                "signaling connection closed".into(),
            )),
            Err(e) => Err(ListenerError::ConnectionLost(e.to_string())),
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.listener.unlisten(&self.channel).await {
            warn!(channel = %self.channel, error = %e, "Failed to unlisten");
        }
    }
}
