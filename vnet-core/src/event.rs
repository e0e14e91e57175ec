//! Event bus between the service loop and the registered observer.
//!
//! Events travel through a small bounded channel. The dispatcher task runs on
//! the service thread and hands each event to the single registered observer;
//! when the buffer is full, producers wait for the observer to catch up
//! instead of dropping events.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::identity::NodeId;
use crate::network::NetworkId;

/// Capacity of the event channel.
pub const EVENT_BUFFER: usize = 32;

/// Lifecycle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    NodeOnline(NodeId),
    NodeOffline(NodeId),
    NetworkReadyIpv4(NetworkId),
    NetworkReadyIpv6(NetworkId),
    PeerDirect(NodeId),
    PeerRelay(NodeId),
}

impl Event {
    /// The node, network or peer id the event is about.
    pub fn id(&self) -> u64 {
        match self {
            Self::NodeOnline(id)
            | Self::NodeOffline(id)
            | Self::PeerDirect(id)
            | Self::PeerRelay(id) => id.as_u64(),
            Self::NetworkReadyIpv4(id) | Self::NetworkReadyIpv6(id) => id.0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NodeOnline(_) => "NODE_ONLINE",
            Self::NodeOffline(_) => "NODE_OFFLINE",
            Self::NetworkReadyIpv4(_) => "NETWORK_READY_IP4",
            Self::NetworkReadyIpv6(_) => "NETWORK_READY_IP6",
            Self::PeerDirect(_) => "PEER_DIRECT",
            Self::PeerRelay(_) => "PEER_RELAY",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeOnline(id)
            | Self::NodeOffline(id)
            | Self::PeerDirect(id)
            | Self::PeerRelay(id) => write!(f, "{} {id}", self.name()),
            Self::NetworkReadyIpv4(id) | Self::NetworkReadyIpv6(id) => {
                write!(f, "{} {id}", self.name())
            }
        }
    }
}

/// Receives events on the service thread.
///
/// Implementations must return promptly: while an observer runs, no further
/// events are delivered.
pub trait EventObserver: Send + Sync + 'static {
    fn on_event(&self, event: Event);
}

impl<F> EventObserver for F
where
    F: Fn(Event) + Send + Sync + 'static,
{
    fn on_event(&self, event: Event) {
        self(event)
    }
}

type ObserverSlot = Arc<RwLock<Option<Arc<dyn EventObserver>>>>;

/// Observer registration, shareable without keeping the channel open.
#[derive(Clone, Default)]
pub struct ObserverRegistry {
    slot: ObserverSlot,
}

impl ObserverRegistry {
    /// Register the observer, replacing any previous one.
    pub fn set(&self, observer: Arc<dyn EventObserver>) {
        *self.slot.write() = Some(observer);
    }

    pub fn clear(&self) {
        *self.slot.write() = None;
    }

    fn current(&self) -> Option<Arc<dyn EventObserver>> {
        self.slot.read().clone()
    }
}

/// Producer side of the bus.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<Event>,
    observers: ObserverRegistry,
}

impl EventBus {
    /// Create a bus and the dispatcher that drains it.
    pub fn new() -> (Self, EventDispatcher) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let observers = ObserverRegistry::default();
        let bus = Self {
            tx,
            observers: observers.clone(),
        };
        (bus, EventDispatcher { rx, observers })
    }

    pub fn registry(&self) -> ObserverRegistry {
        self.observers.clone()
    }

    /// Register the observer, replacing any previous one.
    pub fn set_observer(&self, observer: Arc<dyn EventObserver>) {
        self.observers.set(observer);
    }

    pub fn clear_observer(&self) {
        self.observers.clear();
    }

    /// Queue an event, waiting while the buffer is full.
    pub async fn emit(&self, event: Event) {
        tracing::debug!(%event, "emit");
        if self.tx.send(event).await.is_err() {
            tracing::debug!(%event, "event dispatcher gone; dropping event");
        }
    }

    pub async fn emit_all(&self, events: impl IntoIterator<Item = Event>) {
        for event in events {
            self.emit(event).await;
        }
    }
}

/// Consumer side of the bus; run it on the service thread. Returns once
/// every `EventBus` clone is gone and the buffer is drained.
pub struct EventDispatcher {
    rx: mpsc::Receiver<Event>,
    observers: ObserverRegistry,
}

impl EventDispatcher {
    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            match self.observers.current() {
                Some(observer) => observer.on_event(event),
                None => tracing::trace!(%event, "no observer registered"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const NET: NetworkId = NetworkId(0xabcdef);

    #[test]
    fn test_event_ids() {
        let node = NodeId::new(0x11_22_33_44_55);
        assert_eq!(Event::NodeOnline(node).id(), 0x11_22_33_44_55);
        assert_eq!(Event::NetworkReadyIpv6(NET).id(), 0xabcdef);
        assert_eq!(
            Event::PeerRelay(node).to_string(),
            "PEER_RELAY 1122334455"
        );
    }

    #[tokio::test]
    async fn test_dispatch_in_order() {
        let (bus, dispatcher) = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.set_observer(Arc::new(move |e: Event| sink.lock().unwrap().push(e)));

        let task = tokio::spawn(dispatcher.run());
        let node = NodeId::new(7);
        bus.emit(Event::NodeOnline(node)).await;
        bus.emit(Event::NetworkReadyIpv4(NET)).await;
        bus.emit(Event::NetworkReadyIpv6(NET)).await;
        drop(bus);
        task.await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                Event::NodeOnline(node),
                Event::NetworkReadyIpv4(NET),
                Event::NetworkReadyIpv6(NET),
            ]
        );
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let (bus, dispatcher) = EventBus::new();
        let first = Arc::new(Mutex::new(0));
        let second = Arc::new(Mutex::new(0));

        let f = Arc::clone(&first);
        bus.set_observer(Arc::new(move |_: Event| *f.lock().unwrap() += 1));
        let s = Arc::clone(&second);
        bus.set_observer(Arc::new(move |_: Event| *s.lock().unwrap() += 1));

        let task = tokio::spawn(dispatcher.run());
        bus.emit(Event::PeerDirect(NodeId::new(1))).await;
        drop(bus);
        task.await.unwrap();

        assert_eq!(*first.lock().unwrap(), 0);
        assert_eq!(*second.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_full_buffer_waits_instead_of_dropping() {
        let (bus, dispatcher) = EventBus::new();
        let count = Arc::new(Mutex::new(0usize));
        let c = Arc::clone(&count);
        bus.set_observer(Arc::new(move |_: Event| *c.lock().unwrap() += 1));

        let producer = {
            let bus = bus.clone();
            tokio::spawn(async move {
                for i in 0..(EVENT_BUFFER as u64 * 4) {
                    bus.emit(Event::PeerDirect(NodeId::new(i + 1))).await;
                }
            })
        };
        let consumer = tokio::spawn(dispatcher.run());
        producer.await.unwrap();
        drop(bus);
        consumer.await.unwrap();

        assert_eq!(*count.lock().unwrap(), EVENT_BUFFER * 4);
    }

    #[tokio::test]
    async fn test_registry_outlives_bus() {
        let (bus, dispatcher) = EventBus::new();
        let registry = bus.registry();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        registry.set(Arc::new(move |e: Event| sink.lock().unwrap().push(e)));

        let task = tokio::spawn(dispatcher.run());
        bus.emit(Event::NodeOffline(NodeId::new(3))).await;
        drop(bus);
        // The registry does not hold the channel open.
        task.await.unwrap();
        registry.clear();

        assert_eq!(*seen.lock().unwrap(), vec![Event::NodeOffline(NodeId::new(3))]);
    }
}
