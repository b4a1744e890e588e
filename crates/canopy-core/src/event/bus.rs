//! Broadcast event bus for distributing `WorkflowEvent` to host subscribers.
//!
//! Built on `tokio::sync::broadcast`. Each workflow application owns one bus;
//! the scheduler publishes into it and any number of host tasks subscribe.
//! Publishing with no active subscribers is a no-op.

use canopy_types::event::WorkflowEvent;
use tokio::sync::broadcast;

/// Multi-consumer bus for the events of one workflow instance.
///
/// Cloning the bus clones the sender, so the scheduler task and every
/// `InstanceHandle` publish into and subscribe from the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// A subscriber that falls more than `capacity` events behind observes
    /// `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
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

    fn idle_event(instance_id: Uuid) -> WorkflowEvent {
        WorkflowEvent::PersistableIdle { instance_id }
    }

    #[tokio::test]
    async fn subscribers_each_receive_published_event() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        let id = Uuid::now_v7();

        bus.publish(idle_event(id));

        assert_eq!(rx1.recv().await.unwrap().instance_id(), id);
        assert_eq!(rx2.recv().await.unwrap().instance_id(), id);
    }

    #[test]
    fn publish_without_subscribers_is_dropped() {
        let bus = EventBus::new(16);
        bus.publish(idle_event(Uuid::now_v7()));
        let mut late = bus.subscribe();
        assert!(matches!(
            late.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[test]
    fn lagging_subscriber_is_told_how_far_behind() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.publish(idle_event(Uuid::now_v7()));
        }
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(3))
        ));
    }

    #[test]
    fn clone_shares_channel() {
        let bus = EventBus::new(16);
        let clone = bus.clone();
        let mut rx = bus.subscribe();
        clone.publish(idle_event(Uuid::now_v7()));
        assert!(rx.try_recv().is_ok());
        assert_eq!(bus.subscriber_count(), 1);
        assert!(format!("{bus:?}").contains("receiver_count"));
    }
}
