//! Best-effort event fan-out.
//!
//! A single bounded queue of named events. Publishing never blocks: when
//! the queue is full the event is dropped. This is an at-most-once, lossy
//! hint channel: consumers must treat an event as "something changed, go
//! re-query the registry", never as a reliable log.

use std::fmt;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// Capacity of the event queue. Deliberately small: observers that fall
/// behind re-poll authoritative state instead of draining a backlog.
pub const EVENT_QUEUE_DEPTH: usize = 10;

/// Events observable by external consumers (e.g. the web console).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Event {
    /// The set of registered sessions changed.
    MembershipChanged,
    /// Periodic liveness tick.
    Heartbeat,
}

impl Event {
    /// Wire name of the event.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Event::MembershipChanged => "membership-changed",
            Event::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publishing side of the event queue. Cheap to clone.
#[derive(Clone)]
pub struct EventNotifier {
    tx: mpsc::Sender<Event>,
}

impl EventNotifier {
    /// Create the queue, returning the publisher and the single consumer.
    #[must_use]
    pub fn channel() -> (Self, EventStream) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        (Self { tx }, EventStream { rx })
    }

    /// Publish an event without ever blocking the caller.
    ///
    /// Dropped silently (with a debug log) when the queue is full or the
    /// consumer is gone.
    pub fn publish(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                debug!(event = %event, "Event queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(event)) => {
                debug!(event = %event, "No event consumer, dropping event");
            }
        }
    }
}

/// Consuming side of the event queue.
pub struct EventStream {
    rx: mpsc::Receiver<Event>,
}

impl EventStream {
    /// Receive the next event; `None` once all publishers are gone.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_the_consumer_in_order() {
        let (notifier, mut stream) = EventNotifier::channel();
        notifier.publish(Event::MembershipChanged);
        notifier.publish(Event::Heartbeat);

        assert_eq!(stream.next().await, Some(Event::MembershipChanged));
        assert_eq!(stream.next().await, Some(Event::Heartbeat));
    }

    #[tokio::test]
    async fn overflow_drops_instead_of_blocking() {
        let (notifier, mut stream) = EventNotifier::channel();

        // Fill the queue past capacity; every publish must return.
        for _ in 0..(EVENT_QUEUE_DEPTH * 3) {
            notifier.publish(Event::MembershipChanged);
        }

        let mut received = 0;
        while let Ok(Some(_)) = tokio::time::timeout(
            std::time::Duration::from_millis(10),
            stream.next(),
        )
        .await
        {
            received += 1;
        }
        assert_eq!(received, EVENT_QUEUE_DEPTH);
    }

    #[tokio::test]
    async fn publishing_without_a_consumer_is_harmless() {
        let (notifier, stream) = EventNotifier::channel();
        drop(stream);
        notifier.publish(Event::Heartbeat);
    }

    #[test]
    fn wire_names_are_kebab_case() {
        assert_eq!(Event::MembershipChanged.as_str(), "membership-changed");
        assert_eq!(
            serde_json::to_string(&Event::Heartbeat).unwrap(),
            "\"heartbeat\""
        );
    }
}
