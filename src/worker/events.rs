//! Event envelopes and the listener registry behind the Rust `Worker`.

use crate::runtime::message::StructuredValue;

/// Event types a worker dispatches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message,
    Error,
}

/// An inbound message from the paired context
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub data: StructuredValue,
    /// Buffers whose ownership moved with the message
    pub transfer: Vec<Vec<u8>>,
}

/// A failure reported by the paired context
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    /// The failure value exactly as it was thrown
    pub error: StructuredValue,
    pub message: String,
}

impl ErrorEvent {
    pub fn new(error: StructuredValue) -> Self {
        let message = error.describe();
        Self { error, message }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Message(MessageEvent),
    Error(ErrorEvent),
}

impl WorkerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            WorkerEvent::Message(_) => EventKind::Message,
            WorkerEvent::Error(_) => EventKind::Error,
        }
    }
}

pub type Listener = Box<dyn FnMut(&WorkerEvent) + Send>;

/// Identifies one registration; returned by `add_listener`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Clone, Copy, Default)]
pub struct ListenerOptions {
    /// Remove the listener after its first delivery
    pub once: bool,
}

struct Registration {
    id: ListenerId,
    kind: EventKind,
    once: bool,
    listener: Listener,
}

/// Ordered listener set with one replaceable handler slot per event kind.
#[derive(Default)]
pub struct EventTarget {
    registrations: Vec<Registration>,
    message_slot: Option<ListenerId>,
    error_slot: Option<ListenerId>,
    next_id: u64,
}

impl EventTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(
        &mut self,
        kind: EventKind,
        listener: Listener,
        options: ListenerOptions,
    ) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.registrations.push(Registration {
            id,
            kind,
            once: options.once,
            listener,
        });
        id
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.registrations.len();
        self.registrations.retain(|r| r.id != id);
        for slot in [&mut self.message_slot, &mut self.error_slot] {
            if *slot == Some(id) {
                *slot = None;
            }
        }
        self.registrations.len() != before
    }

    fn slot_mut(&mut self, kind: EventKind) -> &mut Option<ListenerId> {
        match kind {
            EventKind::Message => &mut self.message_slot,
            EventKind::Error => &mut self.error_slot,
        }
    }

    /// The registration currently reachable through the `on<kind>` slot
    pub fn handler(&self, kind: EventKind) -> Option<ListenerId> {
        match kind {
            EventKind::Message => self.message_slot,
            EventKind::Error => self.error_slot,
        }
    }

    /// Replace the slot's handler. The previous one leaves the listener set and the
    /// new one is appended after every existing listener; `None` clears the slot.
    pub fn set_handler(&mut self, kind: EventKind, handler: Option<Listener>) -> Option<ListenerId> {
        if let Some(previous) = self.slot_mut(kind).take() {
            self.registrations.retain(|r| r.id != previous);
        }
        let id = handler.map(|h| self.add_listener(kind, h, ListenerOptions::default()));
        *self.slot_mut(kind) = id;
        id
    }

    pub fn has_listeners(&self, kind: EventKind) -> bool {
        self.registrations.iter().any(|r| r.kind == kind)
    }

    /// Deliver to every matching listener in registration order.
    /// Returns how many listeners ran.
    pub fn dispatch(&mut self, event: &WorkerEvent) -> usize {
        let kind = event.kind();
        let mut invoked = 0;
        let mut spent = Vec::new();
        for registration in self.registrations.iter_mut().filter(|r| r.kind == kind) {
            (registration.listener)(event);
            invoked += 1;
            if registration.once {
                spent.push(registration.id);
            }
        }
        for id in spent {
            self.remove_listener(id);
        }
        invoked
    }
}
