use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for domain events. Collaborators subscribe per class or tap
/// the firehose (every published event, e.g. the notification fan-out
/// service). Publishing is fire-and-forget: no listener, no work.
pub struct EventHub {
    class_channels: DashMap<Ulid, broadcast::Sender<Event>>,
    firehose: broadcast::Sender<Event>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            class_channels: DashMap::new(),
            firehose: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to one class's events. Creates the channel if needed.
    pub fn subscribe_class(&self, class_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .class_channels
            .entry(class_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Subscribe to every published event regardless of class.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.firehose.subscribe()
    }

    pub fn publish(&self, class_id: Ulid, event: &Event) {
        let _ = self.firehose.send(event.clone());
        if let Some(sender) = self.class_channels.get(&class_id) {
            let _ = sender.send(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booked_event(class_id: Ulid) -> Event {
        Event::ClassBooked {
            booking_id: Ulid::new(),
            class_id,
            user_id: Ulid::new(),
            class_name: "Spin".into(),
            start_time: 1_700_000_000_000,
            booked_at: 1_699_000_000_000,
        }
    }

    #[tokio::test]
    async fn class_subscriber_receives() {
        let hub = EventHub::new();
        let cid = Ulid::new();
        let mut rx = hub.subscribe_class(cid);

        let event = booked_event(cid);
        hub.publish(cid, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn firehose_receives_all_classes() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe_all();

        let a = Ulid::new();
        let b = Ulid::new();
        hub.publish(a, &booked_event(a));
        hub.publish(b, &booked_event(b));

        assert_eq!(rx.recv().await.unwrap().class_id(), a);
        assert_eq!(rx.recv().await.unwrap().class_id(), b);
    }

    #[tokio::test]
    async fn class_channel_is_scoped() {
        let hub = EventHub::new();
        let a = Ulid::new();
        let b = Ulid::new();
        let mut rx_a = hub.subscribe_class(a);

        hub.publish(b, &booked_event(b));
        hub.publish(a, &booked_event(a));

        // Only A's event shows up on A's channel.
        assert_eq!(rx_a.recv().await.unwrap().class_id(), a);
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let hub = EventHub::new();
        let cid = Ulid::new();
        hub.publish(cid, &booked_event(cid));
    }
}
