//! Outbound event queue shared by all components.

use std::sync::{Arc, Mutex};

use ferrite_shared_types::p2p::NetEvent;

/// Components push [`NetEvent`]s here while holding their own locks; the
/// transport drains the queue after each call into the core. The queue's
/// mutex is always the innermost lock and is never held across I/O.
#[derive(Clone, Default)]
pub struct NetQueue {
    events: Arc<Mutex<Vec<NetEvent>>>,
}

impl NetQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: NetEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn drain(&self) -> Vec<NetEvent> {
        let mut events = self.events.lock().unwrap();
        std::mem::take(&mut *events)
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
