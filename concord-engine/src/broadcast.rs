//! Per-document fan-out of committed operations and presence deltas.
//!
//! Every live document owns one [`DocumentChannel`]; each subscriber gets
//! an independent buffered receiver, so a slow consumer lags (and
//! eventually drops messages) without holding up the authority or its
//! peers. Events carry the *rebased* operation — every subscriber applies
//! the exact same committed sequence, which is what makes convergence
//! hold across the fleet.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::presence::PresenceEvent;
use concord_ot::Operation;

/// An event published to all subscribers of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DocEvent {
    /// An operation committed at `version`, in its rebased form.
    /// Subscribers filter out their own submissions by `client_id`.
    Committed {
        version: u64,
        client_id: Uuid,
        operation: Operation,
    },
    /// A presence delta (join/leave/cursor/selection).
    Presence(PresenceEvent),
}

/// Channel statistics snapshot.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    pub events_published: u64,
    pub subscribers: usize,
}

/// Fan-out channel for one document.
pub struct DocumentChannel {
    sender: broadcast::Sender<DocEvent>,
    capacity: usize,
    events_published: AtomicU64,
}

impl DocumentChannel {
    /// `capacity` is the per-subscriber buffer; a receiver further behind
    /// than that starts losing the oldest events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            events_published: AtomicU64::new(0),
        }
    }

    /// Subscribe to this document's events.
    pub fn subscribe(&self) -> broadcast::Receiver<DocEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to every current subscriber. Returns the number
    /// of receivers it reached; zero subscribers is not an error.
    pub fn publish(&self, event: DocEvent) -> usize {
        let reached = self.sender.send(event).unwrap_or(0);
        self.events_published.fetch_add(1, Ordering::Relaxed);
        reached
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// The per-subscriber buffer capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lock-free stats snapshot.
    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            events_published: self.events_published.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn committed(version: u64) -> DocEvent {
        let mut op = Operation::new();
        op.insert("x");
        DocEvent::Committed {
            version,
            client_id: Uuid::new_v4(),
            operation: op,
        }
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let channel = DocumentChannel::new(16);
        let mut rx1 = channel.subscribe();
        let mut rx2 = channel.subscribe();

        let event = committed(1);
        let reached = channel.publish(event.clone());
        assert_eq!(reached, 2);

        assert_eq!(rx1.recv().await.unwrap(), event);
        assert_eq!(rx2.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let channel = DocumentChannel::new(16);
        assert_eq!(channel.publish(committed(1)), 0);
    }

    #[tokio::test]
    async fn test_subscriber_count_and_stats() {
        let channel = DocumentChannel::new(32);
        assert_eq!(channel.capacity(), 32);
        assert_eq!(channel.subscriber_count(), 0);

        let _rx = channel.subscribe();
        assert_eq!(channel.subscriber_count(), 1);

        channel.publish(committed(1));
        channel.publish(committed(2));
        let stats = channel.stats();
        assert_eq!(stats.events_published, 2);
        assert_eq!(stats.subscribers, 1);
    }

    #[tokio::test]
    async fn test_events_arrive_in_publish_order() {
        let channel = DocumentChannel::new(16);
        let mut rx = channel.subscribe();

        for v in 1..=5 {
            channel.publish(committed(v));
        }
        for v in 1..=5 {
            match rx.recv().await.unwrap() {
                DocEvent::Committed { version, .. } => assert_eq!(version, v),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }
}
