//! Service events and the per-handle callback slot.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::info::InformationMap;

/// What happened on a service handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEventKind {
    /// An inference result or a pipeline sink produced data. The payload
    /// carries `name` (pipeline node, absent for single models) and `data`.
    NewData,
    /// An offloading receiver registered a model in the catalog.
    ModelRegistered,
    /// An offloading receiver registered a pipeline description.
    PipelineRegistered,
    /// A reply payload arrived from a peer, under the `data` key.
    Reply,
}

/// Event delivered on the handle callback. The payload is borrowed for the
/// duration of the callback; handlers copy what they need and return fast.
#[derive(Debug)]
pub struct ServiceEvent {
    pub kind: ServiceEventKind,
    pub info: InformationMap,
}

impl ServiceEvent {
    pub fn new(kind: ServiceEventKind, info: InformationMap) -> Self {
        Self { kind, info }
    }
}

pub type EventCallback = Arc<dyn Fn(&ServiceEvent) + Send + Sync>;

/// Thread-safe callback slot shared between a handle and its workers.
///
/// `emit` snapshots the callback under the lock and invokes it with the
/// lock released, so a handler may call back into the handle.
#[derive(Clone, Default)]
pub struct EventSink {
    slot: Arc<RwLock<Option<EventCallback>>>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, callback: EventCallback) {
        *self.slot.write() = Some(callback);
    }

    pub fn clear(&self) {
        *self.slot.write() = None;
    }

    pub fn is_set(&self) -> bool {
        self.slot.read().is_some()
    }

    pub fn emit(&self, event: &ServiceEvent) {
        let snapshot = self.slot.read().clone();
        if let Some(cb) = snapshot {
            cb(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emit_without_callback_is_a_no_op() {
        let sink = EventSink::new();
        sink.emit(&ServiceEvent::new(
            ServiceEventKind::Reply,
            InformationMap::information(),
        ));
    }

    #[test]
    fn clear_stops_delivery() {
        let sink = EventSink::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        sink.set(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let event = ServiceEvent::new(ServiceEventKind::NewData, InformationMap::information());
        sink.emit(&event);
        sink.clear();
        sink.emit(&event);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_may_reenter_the_sink() {
        let sink = EventSink::new();
        let inner = sink.clone();
        sink.set(Arc::new(move |_| {
            // Snapshot semantics: the slot lock is not held here.
            assert!(inner.is_set());
        }));
        sink.emit(&ServiceEvent::new(
            ServiceEventKind::Reply,
            InformationMap::information(),
        ));
    }
}
