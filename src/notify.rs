use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-mechanic broadcast of applied store events, for whatever renders the
/// shop's visit board. Slow subscribers lag and miss events; they never
/// block a booking.
///
/// This is a library hook: embedders subscribe through
/// `ShopManager::get_or_create(shop)?.notify`. The wire protocol does not
/// forward these events, and with no subscriber `send` is a no-op.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to one mechanic's events. Creates the channel if needed.
    pub fn subscribe(&self, mechanic_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(mechanic_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, mechanic_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&mechanic_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a mechanic's channel. Receivers see the channel close.
    pub fn remove(&self, mechanic_id: &Ulid) {
        self.channels.remove(mechanic_id);
    }

    pub fn subscriber_count(&self, mechanic_id: &Ulid) -> usize {
        self.channels
            .get(mechanic_id)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VisitStatus;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mid = Ulid::new();
        let mut rx = hub.subscribe(mid);
        assert_eq!(hub.subscriber_count(&mid), 1);

        let event = Event::VisitAdvanced {
            id: Ulid::new(),
            mechanic_id: mid,
            status: VisitStatus::Done,
            at: 5,
        };
        hub.send(mid, &event);
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn events_stay_on_their_mechanic() {
        let hub = NotifyHub::new();
        let ana = Ulid::new();
        let bruno = Ulid::new();
        let mut ana_rx = hub.subscribe(ana);
        let _bruno_rx = hub.subscribe(bruno);

        hub.send(bruno, &Event::MechanicDeleted { id: bruno });
        assert!(matches!(
            ana_rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn removed_channel_closes() {
        let hub = NotifyHub::new();
        let mid = Ulid::new();
        let mut rx = hub.subscribe(mid);
        hub.remove(&mid);
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert_eq!(hub.subscriber_count(&mid), 0);
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let mid = Ulid::new();
        hub.send(mid, &Event::MechanicDeleted { id: mid });
    }
}
