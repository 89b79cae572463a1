//! Operator-facing status stream.
//!
//! The presentation layer subscribes to a broadcast of [`StatusMessage`]s.
//! Every message is also logged.

use std::fmt;

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

/// Capacity of the status broadcast; slow subscribers lose the oldest lines.
pub const STATUS_CAPACITY: usize = 256;

/// Which part of the rig produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusSource {
    /// Motor worker.
    Motor,
    /// Filter wheel worker.
    Filter,
    /// THP poller.
    Environment,
    /// Acquisition engine.
    Spectrometer,
    /// Routine engine.
    Routine,
    /// Data saving and files.
    Data,
}

impl fmt::Display for StatusSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StatusSource::Motor => "motor",
            StatusSource::Filter => "filter",
            StatusSource::Environment => "environment",
            StatusSource::Spectrometer => "spectrometer",
            StatusSource::Routine => "routine",
            StatusSource::Data => "data",
        };
        f.write_str(label)
    }
}

/// One status line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusMessage {
    /// Producer.
    pub source: StatusSource,
    /// Text shown to the operator.
    pub text: String,
    /// When it was produced.
    pub at: DateTime<Local>,
}

impl fmt::Display for StatusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.source, self.text)
    }
}

/// Sending side of the status stream.
#[derive(Debug, Clone)]
pub struct StatusBus {
    tx: broadcast::Sender<StatusMessage>,
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBus {
    /// New bus with no subscribers.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(STATUS_CAPACITY);
        Self { tx }
    }

    /// New subscriber.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusMessage> {
        self.tx.subscribe()
    }

    /// Publish and log.
    pub fn publish(&self, source: StatusSource, text: impl Into<String>) {
        let text = text.into();
        info!(source = %source, "{}", text);
        // No subscribers is fine.
        let _ = self.tx.send(StatusMessage {
            source,
            text,
            at: Local::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_see_published_lines() {
        let bus = StatusBus::new();
        let mut rx = bus.subscribe();
        bus.publish(StatusSource::Routine, "Routine execution completed");
        let message = rx.try_recv().unwrap();
        assert_eq!(message.source, StatusSource::Routine);
        assert_eq!(message.to_string(), "[routine] Routine execution completed");
    }

    #[test]
    fn publishing_without_subscribers_is_silent() {
        StatusBus::new().publish(StatusSource::Data, "nobody listening");
    }
}
