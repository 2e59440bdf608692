//! Broadcast event bus for distributing `JobEvent` to multiple subscribers.
//!
//! Publishing with no active subscribers is a no-op, so producers never
//! block on slow or absent observers.

use modelgate_types::event::JobEvent;
use tokio::sync::broadcast;

/// Default channel capacity.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Multi-consumer bus for job progress events.
///
/// Cloning the bus clones the sender, allowing multiple producers and
/// consumers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn publish_and_subscribe_delivers_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let id = Uuid::now_v7();

        bus.publish(JobEvent::Completed { job_id: id });

        let received = rx.recv().await.unwrap();
        assert_eq!(received.job_id(), id);
    }

    #[tokio::test]
    async fn clone_shares_channel() {
        let bus = EventBus::new(16);
        let producer = bus.clone();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        producer.publish(JobEvent::Cancelled {
            job_id: Uuid::now_v7(),
        });

        assert!(matches!(rx1.recv().await.unwrap(), JobEvent::Cancelled { .. }));
        assert!(matches!(rx2.recv().await.unwrap(), JobEvent::Cancelled { .. }));
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let bus = EventBus::default();
        bus.publish(JobEvent::Completed {
            job_id: Uuid::now_v7(),
        });
        assert!(format!("{bus:?}").contains("receiver_count"));
    }

    #[test]
    fn lagged_receiver_reports_lag() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.publish(JobEvent::Completed {
                job_id: Uuid::now_v7(),
            });
        }
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(_))
        ));
    }
}
