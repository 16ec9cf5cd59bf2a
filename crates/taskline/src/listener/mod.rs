//! New-task notification listening
//!
//! This module provides:
//! - [`NotificationListener`] - Keeps a subscription alive and reports [`ListenerEvent`]s
//! - [`NotificationSource`] - Seam over the change-notification channel
//! - [`PostgresNotificationSource`] - `LISTEN`/`NOTIFY` via a dedicated connection
//! - [`InMemoryNotificationSource`] - In-process source for tests

mod memory;
mod notification_listener;
mod postgres;
mod source;

pub use memory::InMemoryNotificationSource;
pub use notification_listener::{ListenerConfig, ListenerEvent, NotificationListener};
pub use postgres::PostgresNotificationSource;
pub use source::{ListenerError, Notification, NotificationConnection, NotificationSource};
