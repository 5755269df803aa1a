//! Native side of a worker: the paired channel, lifecycle flags, the thread that
//! runs the worker context, and the registry of workers owned by JavaScript.

use super::WorkerError;
use crate::resolver::ModuleSource;
use crate::runtime::RuntimeConfig;
use crate::runtime::bootstrap;
use crate::runtime::message::SerializedMessage;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

pub type WorkerId = u32;
pub type ContextId = u32;

/// Worker threads run deep module graphs; the default 2MB is not enough
const WORKER_STACK_SIZE: usize = 8 * 1024 * 1024;

static WORKER_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Workers created from JavaScript, keyed by id
static WORKERS: LazyLock<Mutex<HashMap<WorkerId, Arc<WorkerHandle>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Lifecycle of the worker context as seen from its own thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Starting = 0,
    Running = 1,
    Closing = 2,
    Exited = 3,
}

impl From<u8> for WorkerState {
    fn from(v: u8) -> Self {
        match v {
            0 => WorkerState::Starting,
            1 => WorkerState::Running,
            2 => WorkerState::Closing,
            _ => WorkerState::Exited,
        }
    }
}

/// A raw signal from the worker context to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentEvent {
    Message(SerializedMessage),
    Error(SerializedMessage),
    Exit(i32),
}

#[derive(Default)]
struct Outbox {
    messages: VecDeque<SerializedMessage>,
    errors: VecDeque<SerializedMessage>,
    exit: Option<i32>,
}

/// Everything the two sides of a worker share
pub struct WorkerHandle {
    id: WorkerId,
    name: Option<String>,
    url: String,
    owner: Option<ContextId>,
    inbox: Mutex<VecDeque<SerializedMessage>>,
    inbox_ready: Condvar,
    outbox: Mutex<Outbox>,
    outbox_ready: Condvar,
    state: AtomicU8,
    /// Set once the owner has observed the exit or terminated the worker
    exited: AtomicBool,
    terminate_requested: AtomicBool,
    armed: AtomicBool,
}

impl WorkerHandle {
    pub(crate) fn new(name: Option<String>, url: String, owner: Option<ContextId>) -> Arc<Self> {
        Arc::new(Self {
            id: WORKER_COUNTER.fetch_add(1, Ordering::SeqCst),
            name,
            url,
            owner,
            inbox: Mutex::new(VecDeque::with_capacity(16)),
            inbox_ready: Condvar::new(),
            outbox: Mutex::new(Outbox::default()),
            outbox_ready: Condvar::new(),
            state: AtomicU8::new(WorkerState::Starting as u8),
            exited: AtomicBool::new(false),
            terminate_requested: AtomicBool::new(false),
            armed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn owner(&self) -> Option<ContextId> {
        self.owner
    }

    /// Console label of the worker context
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("worker {}", self.id),
        }
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    // ---- owner side ----

    /// Queue a message for the worker; `false` once the worker has exited
    pub fn post(&self, message: SerializedMessage) -> bool {
        if self.has_exited() {
            return false;
        }
        self.inbox.lock().push_back(message);
        self.inbox_ready.notify_one();
        true
    }

    /// Start forwarding messages to the owner; queued messages are kept
    pub fn arm(&self) {
        if !self.armed.swap(true, Ordering::SeqCst) {
            self.outbox_ready.notify_all();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Drain pending signals: armed messages first, then errors, then the exit.
    ///
    /// The exit marks the handle exited. Messages never armed for are dropped
    /// with it.
    pub fn take_events(&self) -> Vec<ParentEvent> {
        if self.has_exited() {
            return Vec::new();
        }
        let mut outbox = self.outbox.lock();
        let mut events = Vec::new();
        if self.is_armed() {
            events.extend(outbox.messages.drain(..).map(ParentEvent::Message));
        }
        events.extend(outbox.errors.drain(..).map(ParentEvent::Error));
        if let Some(code) = outbox.exit.take() {
            if !outbox.messages.is_empty() {
                debug!(
                    worker = self.id,
                    dropped = outbox.messages.len(),
                    "worker exited with messages nobody listened for"
                );
                outbox.messages.clear();
            }
            self.exited.store(true, Ordering::SeqCst);
            events.push(ParentEvent::Exit(code));
        }
        events
    }

    fn has_pending(&self, outbox: &Outbox) -> bool {
        outbox.exit.is_some()
            || !outbox.errors.is_empty()
            || (self.is_armed() && !outbox.messages.is_empty())
    }

    /// Block until something can be taken, the handle exits, or `timeout` elapses
    pub fn wait_for_events(&self, timeout: Duration) {
        let mut outbox = self.outbox.lock();
        if !self.has_exited() && !self.has_pending(&outbox) {
            self.outbox_ready.wait_for(&mut outbox, timeout);
        }
    }

    /// Stop the worker. Pending and in-flight events are discarded.
    pub fn terminate(&self) {
        if self.exited.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(worker = self.id, url = %self.url, "terminating worker");
        self.terminate_requested.store(true, Ordering::SeqCst);
        self.inbox.lock().clear();
        *self.outbox.lock() = Outbox::default();
        self.inbox_ready.notify_all();
        self.outbox_ready.notify_all();
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    // ---- worker side ----

    pub(crate) fn take_inbox(&self) -> Vec<SerializedMessage> {
        self.inbox.lock().drain(..).collect()
    }

    pub(crate) fn inbox_is_empty(&self) -> bool {
        self.inbox.lock().is_empty()
    }

    pub(crate) fn wait_for_inbox(&self, timeout: Duration) {
        let mut inbox = self.inbox.lock();
        if inbox.is_empty() && !self.termination_requested() {
            self.inbox_ready.wait_for(&mut inbox, timeout);
        }
    }

    pub(crate) fn send_to_parent(&self, message: SerializedMessage) {
        if self.has_exited() {
            trace!(worker = self.id, "owner is gone, message dropped");
            return;
        }
        self.outbox.lock().messages.push_back(message);
        self.outbox_ready.notify_all();
    }

    pub(crate) fn report_error(&self, error: SerializedMessage) {
        if self.has_exited() {
            return;
        }
        self.outbox.lock().errors.push_back(error);
        self.outbox_ready.notify_all();
    }

    pub(crate) fn signal_exit(&self, code: i32) {
        self.set_state(WorkerState::Exited);
        if !self.has_exited() {
            self.outbox.lock().exit = Some(code);
        }
        self.outbox_ready.notify_all();
        debug!(worker = self.id, code, "worker exited");
    }

    pub(crate) fn termination_requested(&self) -> bool {
        self.terminate_requested.load(Ordering::SeqCst)
    }
}

/// What a worker thread needs to start
pub struct WorkerSpec {
    pub source: ModuleSource,
    pub name: Option<String>,
    pub config: RuntimeConfig,
    /// Context that owns the worker, `None` for workers driven from Rust
    pub owner: Option<ContextId>,
}

/// Create a handle and start its thread
pub fn spawn(spec: WorkerSpec) -> Result<Arc<WorkerHandle>, WorkerError> {
    let handle = WorkerHandle::new(spec.name.clone(), spec.source.to_string(), spec.owner);
    let thread_handle = Arc::clone(&handle);
    thread::Builder::new()
        .name(format!("spindle-worker-{}", handle.id))
        .stack_size(WORKER_STACK_SIZE)
        .spawn(move || bootstrap::run(thread_handle, spec))?;
    debug!(worker = handle.id, url = %handle.url, owner = ?handle.owner, "spawned worker");
    Ok(handle)
}

pub fn register(handle: Arc<WorkerHandle>) {
    WORKERS.lock().insert(handle.id, handle);
}

pub fn get(id: WorkerId) -> Option<Arc<WorkerHandle>> {
    WORKERS.lock().get(&id).cloned()
}

pub fn remove(id: WorkerId) -> Option<Arc<WorkerHandle>> {
    WORKERS.lock().remove(&id)
}

/// Registered workers owned by `context`, oldest first
pub fn owned_by(context: ContextId) -> Vec<Arc<WorkerHandle>> {
    let mut handles: Vec<_> = WORKERS
        .lock()
        .values()
        .filter(|h| h.owner == Some(context))
        .cloned()
        .collect();
    handles.sort_by_key(|h| h.id);
    handles
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> Arc<WorkerHandle> {
        WorkerHandle::new(None, "data:text/javascript,".into(), None)
    }

    fn message(text: &str) -> SerializedMessage {
        SerializedMessage::encode(&text.into(), Vec::new())
    }

    #[test]
    fn test_worker_state() {
        let handle = handle();
        assert_eq!(handle.state(), WorkerState::Starting);
        handle.set_state(WorkerState::Running);
        assert_eq!(handle.state(), WorkerState::Running);
        assert_eq!(WorkerState::from(9), WorkerState::Exited);
    }

    #[test]
    fn test_messages_wait_for_arming() {
        let handle = handle();
        handle.send_to_parent(message("a"));
        handle.send_to_parent(message("b"));
        assert!(handle.take_events().is_empty());

        handle.arm();
        assert_eq!(
            handle.take_events(),
            vec![
                ParentEvent::Message(message("a")),
                ParentEvent::Message(message("b"))
            ]
        );
    }

    #[test]
    fn test_exit_comes_after_messages() {
        let handle = handle();
        handle.arm();
        handle.send_to_parent(message("last"));
        handle.report_error(message("boom"));
        handle.signal_exit(1);

        let events = handle.take_events();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], ParentEvent::Message(_)));
        assert!(matches!(events[1], ParentEvent::Error(_)));
        assert_eq!(events[2], ParentEvent::Exit(1));
        assert!(handle.has_exited());
        assert!(!handle.post(message("late")));
    }

    #[test]
    fn test_terminate_discards_pending_events() {
        let handle = handle();
        handle.arm();
        handle.send_to_parent(message("in flight"));
        handle.terminate();
        handle.terminate();
        assert!(handle.take_events().is_empty());
        assert!(handle.termination_requested());
        assert!(handle.has_exited());
    }

    #[test]
    fn test_inbox_preserves_order() {
        let handle = handle();
        for n in 0..5 {
            assert!(handle.post(message(&n.to_string())));
        }
        let inbox = handle.take_inbox();
        let texts: Vec<String> = inbox
            .iter()
            .map(|m| m.decode().unwrap().0.as_str().unwrap().to_string())
            .collect();
        assert_eq!(texts, ["0", "1", "2", "3", "4"]);
        assert!(handle.inbox_is_empty());
    }

    #[test]
    fn test_registry_by_owner() {
        let first = WorkerHandle::new(None, "a".into(), Some(u32::MAX - 1));
        let second = WorkerHandle::new(None, "b".into(), Some(u32::MAX - 1));
        register(Arc::clone(&second));
        register(Arc::clone(&first));

        let owned = owned_by(u32::MAX - 1);
        assert_eq!(owned.len(), 2);
        assert!(owned[0].id() < owned[1].id());

        remove(first.id());
        remove(second.id());
        assert!(owned_by(u32::MAX - 1).is_empty());
    }
}
