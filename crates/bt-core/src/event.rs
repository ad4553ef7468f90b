//! Node lifecycle events and their synchronous fan-out bus.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::node::NodeId;

/// The closed set of lifecycle event kinds a node can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Initialized,
    Setup,
    Entering,
    Exiting,
    StatusChanged,
    Shutdown,
    Error,
}

/// A single lifecycle event, emitted synchronously at well-defined points in
/// the node lifecycle.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub node_id: NodeId,
    pub node_name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Event {
    pub fn new(kind: EventKind, node_id: NodeId, node_name: impl Into<String>) -> Self {
        Self {
            kind,
            node_id,
            node_name: node_name.into(),
            timestamp: Utc::now(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

pub type ListenerId = u64;

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    next_id: ListenerId,
    listeners: Vec<(ListenerId, Listener)>,
}

/// Fan-out bus for [`Event`]s.
///
/// Listeners are invoked in registration order, synchronously with the
/// emitting tick and outside the bus's internal lock.
#[derive(Default)]
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: impl Fn(&Event) + Send + Sync + 'static) -> ListenerId {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Returns `false` when the id was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut inner = self.lock();
        let before = inner.listeners.len();
        inner.listeners.retain(|(lid, _)| *lid != id);
        inner.listeners.len() != before
    }

    pub fn emit(&self, event: Event) {
        let listeners: Vec<Listener> = self
            .lock()
            .listeners
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(&event);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::node::NodeId;

    #[test]
    fn listeners_fire_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.subscribe(move |_| order.lock().unwrap().push(tag));
        }

        bus.emit(Event::new(EventKind::Entering, NodeId::new(), "n"));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits2 = Arc::clone(&hits);
        let id = bus.subscribe(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(Event::new(EventKind::Setup, NodeId::new(), "n"));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(Event::new(EventKind::Setup, NodeId::new(), "n"));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
