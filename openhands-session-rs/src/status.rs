//! Outbound status channel.
//!
//! Components report user-facing status (runtime disconnects, recall
//! failures) by sending on a [`StatusSender`]; the session owns the receiving
//! end and whoever drives the session drains it.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

pub const STATUS_ERROR_RUNTIME_DISCONNECTED: &str = "STATUS$ERROR_RUNTIME_DISCONNECTED";
pub const STATUS_ERROR_MEMORY: &str = "STATUS$ERROR_MEMORY";
pub const STATUS_STARTING_RUNTIME: &str = "STATUS$STARTING_RUNTIME";
pub const STATUS_SETTING_UP_WORKSPACE: &str = "STATUS$SETTING_UP_WORKSPACE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusMessage {
    pub level: StatusLevel,
    /// Fixed status code, e.g. [`STATUS_ERROR_MEMORY`].
    pub id: String,
    pub message: String,
}

pub type StatusReceiver = mpsc::UnboundedReceiver<StatusMessage>;

#[derive(Clone, Debug)]
pub struct StatusSender {
    tx: mpsc::UnboundedSender<StatusMessage>,
}

pub fn status_channel() -> (StatusSender, StatusReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (StatusSender { tx }, rx)
}

impl StatusSender {
    pub fn info(&self, id: &str, message: impl Into<String>) {
        self.send(StatusLevel::Info, id, message.into());
    }

    pub fn error(&self, id: &str, message: impl Into<String>) {
        self.send(StatusLevel::Error, id, message.into());
    }

    fn send(&self, level: StatusLevel, id: &str, message: String) {
        let status = StatusMessage {
            level,
            id: id.to_string(),
            message,
        };
        // Nobody listening is fine; status is advisory.
        if self.tx.send(status).is_err() {
            debug!(id, "Status receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_arrive_in_order() {
        let (tx, mut rx) = status_channel();
        tx.info(STATUS_STARTING_RUNTIME, "starting");
        tx.error(STATUS_ERROR_MEMORY, "boom");

        let first = rx.try_recv().unwrap();
        assert_eq!(first.level, StatusLevel::Info);
        assert_eq!(first.id, STATUS_STARTING_RUNTIME);
        let second = rx.try_recv().unwrap();
        assert_eq!(second.level, StatusLevel::Error);
        assert_eq!(second.message, "boom");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn sending_without_receiver_is_harmless() {
        let (tx, rx) = status_channel();
        drop(rx);
        tx.error(STATUS_ERROR_RUNTIME_DISCONNECTED, "gone");
    }
}
