//! Process-wide typed event fan-out.
//!
//! Observers own their inbound channel; the bus keeps only a sender per
//! observer and event type. An observer must [`EventBus::unregister`]
//! before it is dropped, otherwise its senders linger until the next
//! failed delivery prunes them.

pub mod acpi;

use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Shutdown,
    Reboot,
    Upgrade,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Power off the machine (power button, SIGTERM).
    Shutdown,
    Reboot,
    /// Upgrade to the given installer image.
    Upgrade { image: String },
}

impl Event {
    pub fn event_type(&self) -> EventType {
        match self {
            Event::Shutdown => EventType::Shutdown,
            Event::Reboot => EventType::Reboot,
            Event::Upgrade { .. } => EventType::Upgrade,
        }
    }
}

/// Receiving end of bus notifications.
#[derive(Debug)]
pub struct Observer {
    id: Uuid,
    sender: mpsc::UnboundedSender<Event>,
    receiver: mpsc::UnboundedReceiver<Event>,
}

impl Default for Observer {
    fn default() -> Self {
        Self::new()
    }
}

impl Observer {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            id: Uuid::new_v4(),
            sender,
            receiver,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next delivered event.
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }
}

type Listeners = Vec<(Uuid, mpsc::UnboundedSender<Event>)>;

#[derive(Debug, Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<EventType, Listeners>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver events of `types` to `observer`. Registering twice for the
    /// same type is a no-op.
    pub fn register(&self, observer: &Observer, types: &[EventType]) {
        let mut listeners = self.listeners.write();
        for event_type in types {
            let list = listeners.entry(*event_type).or_default();
            if !list.iter().any(|(id, _)| *id == observer.id) {
                list.push((observer.id, observer.sender.clone()));
            }
        }
    }

    pub fn unregister(&self, observer: &Observer) {
        let mut listeners = self.listeners.write();
        for list in listeners.values_mut() {
            list.retain(|(id, _)| *id != observer.id);
        }
    }

    /// Send `event` to every observer registered for its type.
    pub fn notify(&self, event: Event) {
        let event_type = event.event_type();
        let targets: Listeners = self
            .listeners
            .read()
            .get(&event_type)
            .cloned()
            .unwrap_or_default();

        let mut closed = Vec::new();
        for (id, sender) in targets {
            if sender.send(event.clone()).is_err() {
                closed.push(id);
            }
        }

        if !closed.is_empty() {
            debug!(?event_type, count = closed.len(), "Pruning dropped observers");
            let mut listeners = self.listeners.write();
            if let Some(list) = listeners.get_mut(&event_type) {
                list.retain(|(id, _)| !closed.contains(id));
            }
        }
    }

    pub fn listener_count(&self, event_type: EventType) -> usize {
        self.listeners
            .read()
            .get(&event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notify_filters_by_type() {
        let bus = EventBus::new();
        let mut shutdown = Observer::new();
        let mut reboot = Observer::new();
        bus.register(&shutdown, &[EventType::Shutdown]);
        bus.register(&reboot, &[EventType::Reboot]);

        bus.notify(Event::Shutdown);

        assert_eq!(shutdown.recv().await, Some(Event::Shutdown));
        assert_eq!(reboot.try_recv(), None);
    }

    #[tokio::test]
    async fn test_multiple_types_one_observer() {
        let bus = EventBus::new();
        let mut observer = Observer::new();
        bus.register(&observer, &[EventType::Shutdown, EventType::Upgrade]);
        bus.register(&observer, &[EventType::Shutdown]);
        assert_eq!(bus.listener_count(EventType::Shutdown), 1);

        bus.notify(Event::Upgrade {
            image: "installer:v1".into(),
        });
        bus.notify(Event::Shutdown);

        assert_eq!(
            observer.recv().await,
            Some(Event::Upgrade {
                image: "installer:v1".into()
            })
        );
        assert_eq!(observer.recv().await, Some(Event::Shutdown));
    }

    #[test]
    fn test_unregister() {
        let bus = EventBus::new();
        let mut observer = Observer::new();
        bus.register(&observer, &[EventType::Shutdown, EventType::Reboot]);
        bus.unregister(&observer);

        bus.notify(Event::Shutdown);
        assert_eq!(observer.try_recv(), None);
        assert_eq!(bus.listener_count(EventType::Reboot), 0);
    }

    #[test]
    fn test_dropped_observer_pruned() {
        let bus = EventBus::new();
        let observer = Observer::new();
        bus.register(&observer, &[EventType::Shutdown]);
        drop(observer);

        bus.notify(Event::Shutdown);
        assert_eq!(bus.listener_count(EventType::Shutdown), 0);
    }
}
